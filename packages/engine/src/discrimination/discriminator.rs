// packages/engine/src/discrimination/discriminator.rs
//! Session discrimination
//!
//! Turns a session body into a [`Scene`] and decides whether the session is
//! novel enough to keep:
//!
//! 1. Parse the document and extract the session type from the inbound request
//! 2. Broadcast the session to tailers, whatever happens next
//! 3. Look up the matcher for the session type (none registered: drop)
//! 4. Extract features in document order
//! 5. Count the fingerprint and drop once it exceeds `keep_n_sessions_per_scene`
//!
//! Malformed sessions are logged and dropped, never surfaced to the caller.

use crate::discrimination::dedup::{DedupDecision, DeduplicationState};
use crate::discrimination::matcher::{Extraction, MatcherRegistry, SessionMatcherCnf};
use crate::discrimination::scene::Scene;
use crate::discrimination::session::{SessionDoc, SessionTypeMarkers};
use crate::discrimination::tail::{SessionTailRegistry, DEFAULT_MAILBOX_CAPACITY};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Discriminator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorConfig {
    /// Literal text preceding the session type in the inbound request
    pub session_type_start: String,

    /// Literal text following the session type
    pub session_type_end: String,

    /// Pending tailers allowed per topic
    pub tail_mailbox_capacity: usize,

    /// Tail connections end after this long without a session (seconds)
    pub tail_idle_timeout_secs: u64,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        let markers = SessionTypeMarkers::default();
        Self {
            session_type_start: markers.start,
            session_type_end: markers.end,
            tail_mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            tail_idle_timeout_secs: 60,
        }
    }
}

impl DiscriminatorConfig {
    pub fn markers(&self) -> SessionTypeMarkers {
        SessionTypeMarkers::new(&self.session_type_start, &self.session_type_end)
    }

    pub fn tail_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tail_idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_type_start.is_empty() || self.session_type_end.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "session type markers must not be empty".to_string(),
            ));
        }
        if self.tail_idle_timeout_secs == 0 {
            return Err(EngineError::ConfigInvalid(
                "tail_idle_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decides which sessions are worth keeping
pub trait Discriminate: Send {
    /// Scene of a session to keep, or `None` to drop it
    fn scene_of(&mut self, session: &[u8]) -> Option<Scene>;
}

/// Matcher-driven discriminator with its own dedup state.
///
/// Registries are shared; the dedup state is not, so one instance must not be
/// used from several threads without external serialization.
pub struct Discriminator {
    matchers: Arc<MatcherRegistry>,
    tails: Arc<SessionTailRegistry>,
    markers: SessionTypeMarkers,
    dedup: DeduplicationState,
}

impl Discriminator {
    pub fn new(
        config: &DiscriminatorConfig,
        matchers: Arc<MatcherRegistry>,
        tails: Arc<SessionTailRegistry>,
    ) -> Self {
        Self {
            matchers,
            tails,
            markers: config.markers(),
            dedup: DeduplicationState::new(),
        }
    }

    /// Discriminator with registries of its own
    pub fn standalone(config: &DiscriminatorConfig) -> Self {
        Self::new(
            config,
            Arc::new(MatcherRegistry::new()),
            Arc::new(SessionTailRegistry::new(config.tail_mailbox_capacity)),
        )
    }

    pub fn matchers(&self) -> &Arc<MatcherRegistry> {
        &self.matchers
    }

    pub fn tails(&self) -> &Arc<SessionTailRegistry> {
        &self.tails
    }

    pub fn dedup(&self) -> &DeduplicationState {
        &self.dedup
    }

    /// Replace the matcher of `cnf.session_type`
    pub fn update_session_matcher(&self, cnf: &SessionMatcherCnf) -> Result<()> {
        self.matchers.update(cnf)
    }

    fn try_scene_of(&mut self, session: &[u8]) -> Result<Option<Scene>> {
        let doc = SessionDoc::parse(session)?;
        let session_type = self.markers.extract(doc.inbound_request())?;

        self.tails.notify(session_type, session);

        let Some(matcher) = self.matchers.get(session_type) else {
            metrics::counter!("quoll_sessions_dropped_total", "reason" => "unmatched").increment(1);
            return Ok(None);
        };

        let Extraction { scene, fingerprint } = matcher.extract(&doc);
        match self
            .dedup
            .observe(session_type, fingerprint, matcher.keep_n_sessions_per_scene())
        {
            DedupDecision::Keep { count } => {
                metrics::counter!("quoll_sessions_kept_total").increment(1);
                debug!("Keeping {} session ({} of scene)", session_type, count);
                Ok(Some(scene))
            }
            DedupDecision::Drop { count } => {
                metrics::counter!("quoll_sessions_dropped_total", "reason" => "duplicate")
                    .increment(1);
                debug!("Dropping {} session, scene seen {} times", session_type, count);
                Ok(None)
            }
        }
    }
}

impl Discriminate for Discriminator {
    fn scene_of(&mut self, session: &[u8]) -> Option<Scene> {
        match self.try_scene_of(session) {
            Ok(scene) => scene,
            Err(e) => {
                let reason = match e {
                    EngineError::DelimiterNotFound(_) => "untyped",
                    _ => "malformed",
                };
                metrics::counter!("quoll_sessions_dropped_total", "reason" => reason).increment(1);
                warn!("Dropping session: {}", e);
                None
            }
        }
    }
}

/// Keeps every session with an empty scene
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughDiscriminator;

impl Discriminate for PassThroughDiscriminator {
    fn scene_of(&mut self, _session: &[u8]) -> Option<Scene> {
        Some(Scene::new())
    }
}
