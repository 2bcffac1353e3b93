// packages/engine/src/utils/errors.rs
//! Engine error taxonomy

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the store, the discriminator and the HTTP surface
#[derive(Debug, Error)]
pub enum EngineError {
    /// Ingestion queue is full; the caller may retry later
    #[error("input queue overflow")]
    QueueOverflow,

    /// Tail mailbox for a topic is full
    #[error("tailer mailbox overflow for topic {topic}")]
    TailerOverflow { topic: String },

    /// Rejected configuration (empty session type, bad limits, ...)
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A pattern failed to compile; the whole group is rejected
    #[error("pattern {key:?} failed to compile: {source}")]
    PatternCompile {
        key: String,
        #[source]
        source: regex::Error,
    },

    /// Session type markers were not found in the inbound request
    #[error("session type {0} delimiter can not be found")]
    DelimiterNotFound(&'static str),

    /// Malformed session document
    #[error("failed to parse session: {0}")]
    Parse(#[from] serde_json::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary decode found less data than declared
    #[error("truncated buffer: needed {needed} bytes, {available} available")]
    TruncatedBuffer { needed: usize, available: usize },

    /// Store file does not carry a valid header
    #[error("corrupt store file {path:?}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    /// LZ4 compression or decompression failure
    #[error("compression failed: {0}")]
    Compression(String),

    /// Timestamp can not be represented relative to its window
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(String),

    /// Configuration sources could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl EngineError {
    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::QueueOverflow | EngineError::TailerOverflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(EngineError::QueueOverflow.is_retryable());
        assert!(EngineError::TailerOverflow {
            topic: "*".to_string()
        }
        .is_retryable());
        assert!(!EngineError::ConfigInvalid("empty".to_string()).is_retryable());
    }

    #[test]
    fn test_truncated_message() {
        let err = EngineError::TruncatedBuffer {
            needed: 8,
            available: 3,
        };
        assert_eq!(
            err.to_string(),
            "truncated buffer: needed 8 bytes, 3 available"
        );
    }
}
