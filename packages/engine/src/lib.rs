// packages/engine/src/lib.rs
//! Quoll Session Store Engine Library
//!
//! Captures RPC trace sessions, drops the ones that repeat an already seen
//! scene, and stores the rest in an hour-windowed, LZ4 block-compressed log.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **recording**: Event queue, block writer, window files, listing and export
//! - **discrimination**: Pattern groups, session matchers, dedup and tailing
//! - **server**: HTTP surface over the store and the discriminator
//! - **observability**: Tracing and metrics bootstrap
//! - **utils**: Configuration, errors and the injectable clock

// Public module exports
pub mod discrimination;
pub mod observability;
pub mod recording;
pub mod server;
pub mod utils;

// Re-export commonly used types
pub use discrimination::{Discriminate, Discriminator, Scene, SessionMatcherCnf};
pub use recording::{Store, StoreConfig};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
