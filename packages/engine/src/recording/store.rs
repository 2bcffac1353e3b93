// packages/engine/src/recording/store.rs
//! Time-windowed, block-compressed event store
//!
//! `add` enqueues without blocking. A single background writer thread owns
//! the open window file, the block accumulator and the compression scratch,
//! so none of them needs a lock. Every `maximum_flush_interval` it drains the
//! queue into LZ4 blocks and then runs the retention sweep.
//!
//! A failed flush keeps the unsaved block and the event it was placing in the
//! writer, and the next cycle retries them. A block whose append failed part
//! way may leave a torn record that ends reads of that file.
//!
//! # Architecture
//!
//! ```text
//! add() → EventQueue (bounded, try-send) → BlockWriter (writer thread)
//!                                              ↓
//!                                   Block (≤ N entries / ≤ M bytes)
//!                                              ↓
//!                                   LZ4 → append to window file
//!                                              ↓
//!                                   clean(): keep newest K files
//! ```

use crate::recording::codec::{append_entry, BlockHeader, EventBlockId, EventBlocks};
use crate::recording::compressor::Lz4Compressor;
use crate::recording::event_queue::{EventQueue, QueueStats, QueuedEvent};
use crate::recording::storage::{WindowFile, WindowStorage};
use crate::recording::window::{self, Window};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one file per window
    pub root_dir: PathBuf,

    /// A block is closed once its entry count exceeds this
    pub block_entries_count_limit: u16,

    /// A block is closed once its uncompressed size exceeds this (bytes)
    pub block_size_limit: usize,

    /// Sleep between flush cycles (milliseconds)
    pub maximum_flush_interval_ms: u64,

    /// Number of newest window files kept by the retention sweep
    pub keep_files_count: usize,

    /// Capacity of the ingestion queue
    pub queue_capacity: usize,

    /// UTC offset used to render window file names
    pub utc_offset_secs: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/tmp/store"),
            block_entries_count_limit: u16::MAX - 1,
            block_size_limit: 1024 * 1024,
            maximum_flush_interval_ms: 1000,
            keep_files_count: 24,
            queue_capacity: 100,
            utc_offset_secs: 8 * 3600,
        }
    }
}

impl StoreConfig {
    pub fn maximum_flush_interval(&self) -> Duration {
        Duration::from_millis(self.maximum_flush_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_entries_count_limit == 0 {
            return Err(EngineError::ConfigInvalid(
                "block_entries_count_limit must be positive".to_string(),
            ));
        }
        if self.block_size_limit == 0 {
            return Err(EngineError::ConfigInvalid(
                "block_size_limit must be positive".to_string(),
            ));
        }
        if self.keep_files_count == 0 {
            return Err(EngineError::ConfigInvalid(
                "keep_files_count must be positive".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::ConfigInvalid(
                "queue_capacity must be positive".to_string(),
            ));
        }
        window::naming_offset(self.utc_offset_secs)?;
        Ok(())
    }
}

struct StoreShared {
    config: StoreConfig,
    offset: FixedOffset,
    storage: WindowStorage,
    queue: EventQueue,
    clock: Arc<dyn Clock>,
}

/// Handle to the event store; cheap to clone
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Store {
    /// Open a store on the wall clock
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Open a store with an injected time source
    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let offset = window::naming_offset(config.utc_offset_secs)?;
        let storage = WindowStorage::new(&config.root_dir, offset)?;
        let queue = EventQueue::new(config.queue_capacity);

        info!("Event store opened at {:?}", config.root_dir);

        Ok(Self {
            shared: Arc::new(StoreShared {
                config,
                offset,
                storage,
                queue,
                clock,
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Offset window file names are rendered in
    pub fn naming_offset(&self) -> FixedOffset {
        self.shared.offset
    }

    /// Current time on the store's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.queue.stats()
    }

    /// Enqueue an event stamped with the current time; never blocks
    pub fn add(&self, body: impl Into<Bytes>) -> Result<()> {
        let event = QueuedEvent {
            timestamp: self.shared.clock.now(),
            body: body.into(),
        };
        match self.shared.queue.try_push(event) {
            Ok(()) => {
                metrics::counter!("quoll_store_events_enqueued_total").increment(1);
                Ok(())
            }
            Err(_) => {
                metrics::counter!("quoll_store_queue_overflow_total").increment(1);
                Err(EngineError::QueueOverflow)
            }
        }
    }

    /// A writer driving flushes on the caller's thread.
    ///
    /// Only one writer may be active at a time; [`Store::start`] creates its own.
    pub fn writer(&self) -> BlockWriter {
        BlockWriter::new(Arc::clone(&self.shared))
    }

    /// Spawn the background flush/clean loop
    pub fn start(&self) -> Result<StoreWorker> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let store = self.clone();
        let interval = self.shared.config.maximum_flush_interval();

        let handle = std::thread::Builder::new()
            .name("quoll-store-writer".to_string())
            .spawn(move || {
                info!("Store writer started (flush interval {:?})", interval);
                let mut writer = store.writer();
                loop {
                    store.run_cycle(&mut writer);
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                store.run_cycle(&mut writer);
                if let Err(e) = writer.sync() {
                    warn!("Failed to sync window file on shutdown: {}", e);
                }
                info!("Store writer stopped");
            })?;

        Ok(StoreWorker {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// One flush + clean iteration with panics contained
    fn run_cycle(&self, writer: &mut BlockWriter) {
        match panic::catch_unwind(AssertUnwindSafe(|| writer.flush_input_queue())) {
            Ok(Ok(0)) => {}
            Ok(Ok(blocks)) => debug!("Flushed {} blocks", blocks),
            Ok(Err(e)) => error!("Flush cycle abandoned: {}", e),
            Err(panic) => error!("Flush cycle panicked: {}", panic_message(&panic)),
        }
        match panic::catch_unwind(AssertUnwindSafe(|| self.clean())) {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Clean cycle abandoned: {}", e),
            Err(panic) => error!("Clean cycle panicked: {}", panic_message(&panic)),
        }
    }

    /// Delete the oldest window files beyond `keep_files_count`
    pub fn clean(&self) -> Result<usize> {
        let files = self.shared.storage.list_files()?;
        let keep = self.shared.config.keep_files_count;
        if files.len() <= keep {
            return Ok(0);
        }

        let mut removed = 0;
        for file in &files[..files.len() - keep] {
            match self.shared.storage.remove(file) {
                Ok(()) => {
                    removed += 1;
                    metrics::counter!("quoll_store_files_removed_total").increment(1);
                    info!("Cleaned old window file {:?}", file.path);
                }
                Err(e) => error!("Failed to clean old window file {:?}: {}", file.path, e),
            }
        }
        Ok(removed)
    }

    /// Scan blocks overlapping `[start, end)`.
    ///
    /// Whole blocks are skipped while the skipped entries stay within `skip`;
    /// the scan stops after the block that makes the emitted entry count
    /// exceed `limit`.
    pub fn list(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        skip: usize,
        limit: usize,
    ) -> Result<EventBlocks> {
        let storage = &self.shared.storage;
        let unit = chrono::Duration::nanoseconds(1 << 10);
        let mut out = Vec::new();
        let mut skipped = 0usize;
        let mut emitted = 0usize;

        for file in storage.list_files()? {
            if !file.window.overlaps(start, end) {
                continue;
            }
            let Some(mut reader) = storage.open_blocks(&file)? else {
                continue;
            };
            let base = reader.window().start();

            let mut index = 0u32;
            while let Some(header) = reader.next_header()? {
                let block_index = index;
                index += 1;

                let count = header.entries_count as usize;
                let first = window::uncompress(base, header.min_cts);
                let last = window::uncompress(base, header.max_cts) + unit;
                if !(first < end && start < last) {
                    reader.skip_payload(&header)?;
                    continue;
                }
                if skipped + count <= skip {
                    skipped += count;
                    reader.skip_payload(&header)?;
                    continue;
                }

                let mark = out.len();
                EventBlockId {
                    file_name: file.name.clone(),
                    index: block_index,
                }
                .encode_into(&mut out);
                out.extend_from_slice(&header.encode());
                if !reader.read_payload(&header, &mut out)? {
                    out.truncate(mark);
                    break;
                }

                emitted += count;
                if emitted > limit {
                    return Ok(EventBlocks::new(out));
                }
            }
        }
        Ok(EventBlocks::new(out))
    }
}

/// Handle of the background writer thread
pub struct StoreWorker {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StoreWorker {
    /// Stop the loop after a final flush and wait for the thread
    pub fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Store writer thread panicked");
            }
        }
    }
}

impl Drop for StoreWorker {
    fn drop(&mut self) {
        // dropping the sender disconnects the loop, which exits after a final flush
        self.shutdown.take();
    }
}

#[derive(Default)]
struct BlockAccumulator {
    body: Vec<u8>,
    entries_count: u32,
    min_cts: u32,
    max_cts: u32,
}

impl BlockAccumulator {
    fn reset(&mut self) {
        self.body.clear();
        self.entries_count = 0;
        self.min_cts = u32::MAX;
        self.max_cts = 0;
    }

    fn is_empty(&self) -> bool {
        self.entries_count == 0
    }

    fn push(&mut self, cts: u32, body: &[u8]) {
        append_entry(&mut self.body, cts, body);
        self.entries_count += 1;
        self.min_cts = self.min_cts.min(cts);
        self.max_cts = self.max_cts.max(cts);
    }
}

/// Single-writer state: open window file, block accumulator, compression scratch
pub struct BlockWriter {
    shared: Arc<StoreShared>,
    current: Option<WindowFile>,
    block: BlockAccumulator,
    /// Dequeued event not yet placed in `block`
    pending: Option<QueuedEvent>,
    compressor: Lz4Compressor,
}

impl BlockWriter {
    fn new(shared: Arc<StoreShared>) -> Self {
        let mut block = BlockAccumulator::default();
        block.reset();
        Self {
            shared,
            current: None,
            block,
            pending: None,
            compressor: Lz4Compressor::new(),
        }
    }

    /// Window of the currently open file
    pub fn current_window(&self) -> Option<Window> {
        self.current.as_ref().map(WindowFile::window)
    }

    /// Drain the queue into blocks; returns the number of blocks written.
    ///
    /// On error the unsaved block and the event being placed stay in the
    /// writer for the next call.
    pub fn flush_input_queue(&mut self) -> Result<usize> {
        let mut written = 0;

        while let Some(event) = self.next_event() {
            let window = Window::of(event.timestamp);
            if self.current_window() != Some(window) && !self.block.is_empty() {
                self.pending = Some(event);
                self.save_block()?;
                written += 1;
                continue;
            }
            if let Err(e) = self.switch_file(window) {
                self.pending = Some(event);
                return Err(e);
            }

            let cts = window::compress(window.start(), event.timestamp)?;
            self.block.push(cts, &event.body);

            if self.block_is_full() {
                self.save_block()?;
                written += 1;
            }
        }

        if !self.block.is_empty() {
            self.save_block()?;
            written += 1;
        }
        Ok(written)
    }

    fn next_event(&mut self) -> Option<QueuedEvent> {
        self.pending.take().or_else(|| self.shared.queue.try_pop())
    }

    fn block_is_full(&self) -> bool {
        let entries_limit = u32::from(self.shared.config.block_entries_count_limit);
        self.block.entries_count > entries_limit
            || self.block.entries_count >= u32::from(u16::MAX)
            || self.block.body.len() > self.shared.config.block_size_limit
    }

    fn switch_file(&mut self, window: Window) -> Result<()> {
        if self.current_window() == Some(window) {
            return Ok(());
        }
        if let Some(previous) = self.current.take() {
            debug!("Closing window file {:?}", previous.path());
        }
        self.current = Some(self.shared.storage.open_for_append(window)?);
        Ok(())
    }

    fn save_block(&mut self) -> Result<()> {
        let Some(file) = self.current.as_mut() else {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no open window file",
            )));
        };

        let payload = self.compressor.compress(&self.block.body)?;
        let header = BlockHeader {
            compressed_size: payload.len() as u32,
            uncompressed_size: self.block.body.len() as u32,
            entries_count: self.block.entries_count as u16,
            min_cts: self.block.min_cts,
            max_cts: self.block.max_cts,
        };
        file.append_block(&header, payload)?;

        metrics::counter!("quoll_store_blocks_written_total").increment(1);
        metrics::histogram!("quoll_store_block_bytes").record(payload.len() as f64);
        debug!(
            "Saved block of {} entries ({} -> {} bytes) to {:?}",
            header.entries_count,
            header.uncompressed_size,
            header.compressed_size,
            file.path()
        );
        self.block.reset();
        Ok(())
    }

    /// Flush the open file to disk
    pub fn sync(&mut self) -> Result<()> {
        match self.current.as_mut() {
            Some(file) => file.sync(),
            None => Ok(()),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
