// packages/engine/src/recording/event_queue.rs
//! Bounded ingestion queue
//!
//! Producers `try_push` and never block; a full queue pushes back to the
//! caller. The background writer drains it with `try_pop`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Event waiting to be written
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Ingestion time, decides the window
    pub timestamp: DateTime<Utc>,

    /// Serialized session
    pub body: Bytes,
}

/// Bounded MPMC event queue
pub struct EventQueue {
    sender: Sender<QueuedEvent>,
    receiver: Receiver<QueuedEvent>,
    capacity: usize,

    push_count: AtomicU64,
    pop_count: AtomicU64,
    drop_count: AtomicU64,
}

impl EventQueue {
    /// Create a new event queue
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Push an event without blocking; returns it back when the queue is full
    pub fn try_push(&self, event: QueuedEvent) -> Result<(), QueuedEvent> {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                Err(event)
            }
        }
    }

    /// Try to pop an event (non-blocking)
    pub fn try_pop(&self) -> Option<QueuedEvent> {
        let event = self.receiver.try_recv().ok()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.receiver.len(),
            capacity: self.capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Total events accepted
    pub push_count: u64,

    /// Total events handed to the writer
    pub pop_count: u64,

    /// Total events rejected (queue full)
    pub drop_count: u64,

    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }
}
