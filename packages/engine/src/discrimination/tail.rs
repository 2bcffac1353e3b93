// packages/engine/src/discrimination/tail.rs
//! Live session tailing
//!
//! [`SessionTailRegistry`] is a one-shot publish/subscribe mailbox keyed by
//! topic (a session type, or `"*"` for every type). A registered tailer is
//! invoked at most once, by the next `notify` for its topic, and must
//! re-register to see further sessions. A tailer can also be withdrawn
//! unused with [`SessionTailRegistry::remove_tailer`].
//!
//! [`TailSession`] is the serving loop behind one tail connection. It keeps
//! one tailer registered, hands deliveries off through a bounded channel so
//! `notify` never waits on the consumer, runs its own ad-hoc matcher over each
//! session and writes [`TailFrame`]s to a sink until it ends.

use crate::discrimination::matcher::{SessionMatcher, SessionMatcherCnf};
use crate::discrimination::session::SessionDoc;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Topic that receives every session
pub const ALL_SESSIONS: &str = "*";

/// Default number of pending tailers per topic
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Deliveries buffered between `notify` and one serving loop
const HANDOFF_CAPACITY: usize = 64;

/// One-shot callback receiving `(session_type, session)`
pub type Tailer = Box<dyn FnOnce(&str, &[u8]) + Send>;

/// Handle of a registered tailer, used to withdraw it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TailerId(u64);

/// Topic-keyed bounded mailboxes of one-shot tailers
pub struct SessionTailRegistry {
    capacity: usize,
    next_id: AtomicU64,
    mailboxes: Mutex<HashMap<String, VecDeque<(TailerId, Tailer)>>>,
}

impl SessionTailRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: AtomicU64::new(0),
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Register a tailer for the next session on `topic`
    pub fn add_tailer(&self, topic: &str, tailer: Tailer) -> Result<TailerId> {
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes.entry(topic.to_string()).or_default();
        if mailbox.len() >= self.capacity {
            if mailbox.is_empty() {
                mailboxes.remove(topic);
            }
            return Err(EngineError::TailerOverflow {
                topic: topic.to_string(),
            });
        }
        let id = TailerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        mailbox.push_back((id, tailer));
        Ok(id)
    }

    /// Withdraw a tailer that has not been invoked yet.
    ///
    /// Returns false when it already ran or was never registered on `topic`.
    pub fn remove_tailer(&self, topic: &str, id: TailerId) -> bool {
        let mut mailboxes = self.mailboxes.lock();
        let Some(mailbox) = mailboxes.get_mut(topic) else {
            return false;
        };
        let before = mailbox.len();
        mailbox.retain(|(registered, _)| *registered != id);
        let removed = mailbox.len() != before;
        if mailbox.is_empty() {
            mailboxes.remove(topic);
        }
        removed
    }

    /// Drain and invoke the `"*"` tailers, then the `session_type` tailers.
    ///
    /// Tailers run on the caller's thread after the lock is released.
    pub fn notify(&self, session_type: &str, session: &[u8]) {
        let drained: Vec<Tailer> = {
            let mut mailboxes = self.mailboxes.lock();
            let mut drained: Vec<Tailer> = mailboxes
                .remove(ALL_SESSIONS)
                .map(|mailbox| mailbox.into_iter().map(|(_, tailer)| tailer).collect())
                .unwrap_or_default();
            if session_type != ALL_SESSIONS {
                if let Some(exact) = mailboxes.remove(session_type) {
                    drained.extend(exact.into_iter().map(|(_, tailer)| tailer));
                }
            }
            drained
        };

        if !drained.is_empty() {
            debug!("Notifying {} tailers of {}", drained.len(), session_type);
        }
        for tailer in drained {
            tailer(session_type, session);
        }
    }

    /// Tailers currently waiting on `topic`
    pub fn pending(&self, topic: &str) -> usize {
        self.mailboxes.lock().get(topic).map_or(0, VecDeque::len)
    }
}

impl Default for SessionTailRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

/// Parameters of one tail connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TailRequest {
    /// Topic to follow; empty means every session type
    pub session_type: String,

    /// Include the raw session in each frame
    pub show_session: bool,

    /// End once more than this many sessions were delivered; 0 means no limit
    pub limit: usize,

    /// Ad-hoc matcher run over each delivered session
    pub matcher: SessionMatcherCnf,
}

/// Why a tail loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TailOutcome {
    /// Nothing arrived within the idle timeout
    Timeout,

    /// The topic's mailbox was full
    Overflow,

    /// More sessions than the limit were delivered
    LimitReached,

    /// The consumer went away
    WriteFailed,

    Cancelled,
}

impl fmt::Display for TailOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Timeout => "timeout",
            Self::Overflow => "overflow",
            Self::LimitReached => "limit reached",
            Self::WriteFailed => "write failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Output of the serving loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum TailFrame {
    Session {
        session_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        scene: Option<BTreeMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    End {
        outcome: TailOutcome,
    },
}

/// Withdraws the serving loop's outstanding tailer when dropped
struct Registration<'a> {
    registry: &'a SessionTailRegistry,
    topic: &'a str,
    id: TailerId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove_tailer(self.topic, self.id);
    }
}

struct TailedSession {
    session_type: String,
    session: Bytes,
}

/// Serving loop bound to one tail connection
pub struct TailSession {
    registry: Arc<SessionTailRegistry>,
    matcher: SessionMatcher,
    topic: String,
    show_session: bool,
    limit: usize,
    idle_timeout: Duration,
}

impl TailSession {
    /// Compile the request's ad-hoc matcher
    pub fn new(
        registry: Arc<SessionTailRegistry>,
        request: &TailRequest,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let topic = if request.session_type.is_empty() {
            ALL_SESSIONS.to_string()
        } else {
            request.session_type.clone()
        };
        Ok(Self {
            registry,
            matcher: SessionMatcher::compile(&request.matcher)?,
            topic,
            show_session: request.show_session,
            limit: request.limit,
            idle_timeout,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn register(&self, handoff: &mpsc::Sender<TailedSession>) -> Result<Registration<'_>> {
        let handoff = handoff.clone();
        let id = self.registry.add_tailer(
            &self.topic,
            Box::new(move |session_type: &str, session: &[u8]| {
                let tailed = TailedSession {
                    session_type: session_type.to_string(),
                    session: Bytes::copy_from_slice(session),
                };
                match handoff.try_send(tailed) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Tail consumer is behind, dropping a {} session", session_type)
                    }
                    Err(TrySendError::Closed(_)) => debug!("Tail already ended"),
                }
            }),
        )?;
        Ok(Registration {
            registry: &self.registry,
            topic: &self.topic,
            id,
        })
    }

    fn frame(&self, tailed: TailedSession) -> TailFrame {
        let (scene, error) = match SessionDoc::parse(&tailed.session) {
            Ok(doc) => (Some(self.matcher.extract(&doc).scene.to_map()), None),
            Err(e) => (None, Some(e.to_string())),
        };
        TailFrame::Session {
            session_type: tailed.session_type,
            scene,
            error,
            session: self
                .show_session
                .then(|| String::from_utf8_lossy(&tailed.session).into_owned()),
        }
    }

    /// Run until timeout, overflow, limit, consumer loss or cancellation.
    ///
    /// Every outcome except `WriteFailed` is also sent to `sink` as a final
    /// [`TailFrame::End`].
    pub async fn run(self, sink: mpsc::Sender<TailFrame>, cancel: CancellationToken) -> TailOutcome {
        info!("Tail started on {}", self.topic);
        let outcome = self.serve(&sink, &cancel).await;
        if outcome != TailOutcome::WriteFailed {
            let _ = sink.send(TailFrame::End { outcome }).await;
        }
        info!("Tail on {} ended: {}", self.topic, outcome);
        outcome
    }

    async fn serve(&self, sink: &mpsc::Sender<TailFrame>, cancel: &CancellationToken) -> TailOutcome {
        let (handoff, mut deliveries) = mpsc::channel(HANDOFF_CAPACITY);
        let mut _registration = match self.register(&handoff) {
            Ok(registration) => registration,
            Err(_) => return TailOutcome::Overflow,
        };

        let mut delivered = 0usize;
        loop {
            let tailed = tokio::select! {
                _ = cancel.cancelled() => return TailOutcome::Cancelled,
                _ = tokio::time::sleep(self.idle_timeout) => return TailOutcome::Timeout,
                received = deliveries.recv() => match received {
                    Some(tailed) => tailed,
                    None => return TailOutcome::Cancelled,
                },
            };

            _registration = match self.register(&handoff) {
                Ok(registration) => registration,
                Err(_) => return TailOutcome::Overflow,
            };
            if sink.send(self.frame(tailed)).await.is_err() {
                return TailOutcome::WriteFailed;
            }

            delivered += 1;
            if self.limit > 0 && delivered > self.limit {
                return TailOutcome::LimitReached;
            }
        }
    }
}
