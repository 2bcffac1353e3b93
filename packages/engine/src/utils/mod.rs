// packages/engine/src/utils/mod.rs
//! Common utilities shared by the recording and discrimination layers
//!
//! - **errors**: Engine error taxonomy
//! - **config**: Layered configuration loading
//! - **clock**: Injectable time source

pub mod clock;
pub mod config;
pub mod errors;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::EngineConfig;
pub use errors::{EngineError, Result};
