// packages/engine/src/recording/mod.rs
//! Event recording and storage
//!
//! This module provides the time-windowed event log:
//!
//! - **Store**: `add`, background flush/clean loop, `list`
//! - **Event Queue**: bounded try-send queue between producers and the writer
//! - **Codec**: bit-exact file, block, entry and block-id layouts
//! - **Compressor**: LZ4 block compression with a reusable scratch buffer
//! - **Storage**: one file per hour window, create/append/list/remove
//! - **Exporter**: decode listed blocks into JSON records
//!
//! # On-disk layout
//!
//! ```text
//! file   = 0xD1 0xD1 0x01 windowStartUnix:u32 | block*
//! block  = compressedSize:u32 uncompressedSize:u32 entryCount:u16
//!          minCTS:u32 maxCTS:u32 | lz4(entry*)
//! entry  = size:u32 cts:u32 | body[size]
//! ```
//!
//! All integers are little-endian.

pub mod codec;
pub mod compressor;
pub mod event_queue;
pub mod exporter;
pub mod storage;
pub mod store;
pub mod window;

// Re-export commonly used types
pub use codec::{BlockCursor, BlockHeader, EventBlock, EventBlockId, EventBlocks, EventEntries, EventEntry};
pub use event_queue::{EventQueue, QueueStats};
pub use exporter::{ExportFormat, ExportedEvent, Exporter};
pub use storage::WindowStorage;
pub use store::{BlockWriter, Store, StoreConfig, StoreWorker};
pub use window::Window;
