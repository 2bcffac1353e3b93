// packages/engine/src/recording/exporter.rs
//! Export listed event blocks as JSON
//!
//! Supports:
//! - JSON (one pretty-printed array)
//! - JSON Lines (one record per line, for streaming to log tooling)

use crate::recording::codec::EventBlocks;
use crate::recording::window::{self, Window};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tracing::debug;

/// Export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// JSON array
    Json,

    /// Newline-delimited JSON
    JsonLines,
}

impl ExportFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "json" => Some(Self::Json),
            "jsonl" | "ndjson" => Some(Self::JsonLines),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::JsonLines => "application/x-ndjson",
        }
    }
}

/// One decoded event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedEvent {
    /// Window file the event was read from
    pub window: String,

    /// Scan-assigned block index within the file
    pub block: u32,

    pub timestamp: DateTime<Utc>,

    /// Event body, lossily decoded as UTF-8
    pub body: String,
}

/// Decodes [`EventBlocks`] into event records
pub struct Exporter {
    format: ExportFormat,
    offset: FixedOffset,
}

impl Exporter {
    /// Create an exporter; `offset` is the one file names were rendered in
    pub fn new(format: ExportFormat, offset: FixedOffset) -> Self {
        Self { format, offset }
    }

    /// Decompress every block and recover entry timestamps
    pub fn decode(&self, blocks: &EventBlocks) -> Result<Vec<ExportedEvent>> {
        let mut events = Vec::new();
        for block in blocks.cursor() {
            let (id, block) = block?;
            let window = Window::parse_file_name(&id.file_name, self.offset).ok_or_else(|| {
                EngineError::CorruptFile {
                    path: id.file_name.clone().into(),
                    reason: "block id names no window".to_string(),
                }
            })?;
            for (cts, body) in block.entries()? {
                events.push(ExportedEvent {
                    window: id.file_name.clone(),
                    block: id.index,
                    timestamp: window::uncompress(window.start(), cts),
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }
        }
        Ok(events)
    }

    /// Export blocks to a string in the configured format
    pub fn export(&self, blocks: &EventBlocks) -> Result<String> {
        let events = self.decode(blocks)?;
        debug!("Exporting {} events to {:?} format", events.len(), self.format);

        match self.format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&events)?),
            ExportFormat::JsonLines => {
                let mut out = String::new();
                for event in &events {
                    out.push_str(&serde_json::to_string(event)?);
                    out.push('\n');
                }
                Ok(out)
            }
        }
    }
}
