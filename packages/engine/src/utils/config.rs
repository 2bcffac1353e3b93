// packages/engine/src/utils/config.rs
//! Layered engine configuration
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. `quoll.toml` (or the file named by `QUOLL_CONFIG`)
//! 3. Environment variables such as `QUOLL__STORE__KEEP_FILES_COUNT=48`

use crate::discrimination::DiscriminatorConfig;
use crate::observability::LoggingConfig;
use crate::recording::StoreConfig;
use crate::server::ServerConfig;
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_FILE: &str = "quoll";
const CONFIG_PATH_ENV: &str = "QUOLL_CONFIG";
const ENV_PREFIX: &str = "QUOLL";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub discriminator: DiscriminatorConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from the default file and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    /// Load configuration from a specific file (optional) and the environment
    pub fn load_from(path: &str) -> Result<Self> {
        let config: EngineConfig = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.discriminator.validate()?;
        Ok(())
    }
}
