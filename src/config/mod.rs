//! Config loading and persistence.

mod load;
mod merge;
mod schema;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::{Effect, Transience};

pub use load::{config_path, load, load_layer, load_user_config, write_config};
pub use merge::{apply_env_overrides, apply_env_overrides_from, merge_layers};
pub use schema::{
    Config, ConfigLayer, DrcConfig, DrcConfigOverride, DrcTableConfig, DrcTableConfigOverride,
    FileLoggingConfig, FileLoggingConfigOverride, LeaseConfig, LeaseConfigOverride, LogFormat,
    LogRotation, LoggingConfig, LoggingConfigOverride, NodeConfig, NodeConfigOverride,
    RdmaConfig, RdmaConfigOverride, RecoveryConfig, RecoveryConfigOverride, ServerConfig,
    ServerConfigOverride, WorkersConfig, WorkersConfigOverride,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn transience(&self) -> Transience {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => Transience::Unknown,
            ConfigError::Parse { .. } | ConfigError::Render(_) | ConfigError::Invalid { .. } => {
                Transience::Permanent
            }
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ConfigError::Write { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
