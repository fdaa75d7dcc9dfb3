//! Daemon configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};

use pap_core::comm::TOPIC_POLICY_PDP_PAP;
use pap_core::params::{ParameterError, PdpParameters};
use serde::{Deserialize, Serialize};

/// Error raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,

        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,

        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// A parameter is out of range.
    #[error(transparent)]
    Invalid(#[from] ParameterError),
}

/// Topic endpoint properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic name.
    #[serde(default = "default_topic_name")]
    pub name: String,

    /// Unix socket the PDP bus endpoint listens on.
    #[serde(default = "default_topic_socket")]
    pub socket: PathBuf,
}

fn default_topic_name() -> String {
    TOPIC_POLICY_PDP_PAP.to_string()
}

fn default_topic_socket() -> PathBuf {
    PathBuf::from("/run/pap/pdp-bus.sock")
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            name: default_topic_name(),
            socket: default_topic_socket(),
        }
    }
}

/// Policy store backing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path; omitted means a volatile in-memory store.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PapConfig {
    /// PDP communication parameters.
    #[serde(default)]
    pub pdp: PdpParameters,

    /// Topic endpoint properties.
    #[serde(default)]
    pub topic: TopicConfig,

    /// Policy store backing.
    #[serde(default)]
    pub store: StoreConfig,
}

impl PapConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, or a
    /// parameter is out of range.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.pdp.validate()?;
        Ok(config)
    }
}
