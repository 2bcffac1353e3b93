// packages/engine/src/discrimination/mod.rs
//! Session discrimination
//!
//! - **Pattern**: two-stage named pattern groups
//! - **Session**: borrowed view of session documents
//! - **Matcher**: per session type matchers and their registry
//! - **Scene**: extracted features
//! - **Dedup**: per scene occurrence counting
//! - **Discriminator**: the keep/drop decision
//! - **Tail**: one-shot tailer mailboxes and the tail serving loop

pub mod dedup;
pub mod discriminator;
pub mod matcher;
pub mod pattern;
pub mod scene;
pub mod session;
pub mod tail;

// Re-export commonly used types
pub use dedup::{DedupDecision, DeduplicationState};
pub use discriminator::{Discriminate, Discriminator, DiscriminatorConfig, PassThroughDiscriminator};
pub use matcher::{CallOutboundMatcherCnf, MatcherRegistry, SessionMatcher, SessionMatcherCnf};
pub use pattern::{PatternGroup, PatternMatch};
pub use scene::{Feature, Scene};
pub use session::{SessionDoc, SessionTypeMarkers};
pub use tail::{SessionTailRegistry, TailFrame, TailOutcome, TailRequest, TailSession};
