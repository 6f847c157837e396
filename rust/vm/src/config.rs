//! Machine configuration.

use std::path::Path;

use cesk_types::{EntityId, DEFAULT_ID_START};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::stream::OverflowPolicy;

/// Machine configuration, shared by all backends.
///
/// Loadable from JSON or TOML; missing fields take their defaults.
///
/// ```toml
/// default_stream_capacity = 16
/// stream_overflow = "drop_oldest"
/// max_steps = 100000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMConfig {
    /// Capacity of `stream-make` without an explicit capacity.
    pub default_stream_capacity: usize,
    /// What `stream-put` does on a full stream.
    pub stream_overflow: OverflowPolicy,
    /// Upper bound on steps per `run`; `None` runs to completion.
    pub max_steps: Option<u64>,
    /// First provisional id for programs decomposed by the machine.
    pub id_start: EntityId,
    /// Record [`crate::trace::MachineEvent`]s.
    pub record_events: bool,
}

impl Default for VMConfig {
    fn default() -> Self {
        Self {
            default_stream_capacity: 1024,
            stream_overflow: OverflowPolicy::Block,
            max_steps: None,
            id_start: DEFAULT_ID_START,
            record_events: true,
        }
    }
}

impl VMConfig {
    /// Load from a `.json` or `.toml` file, chosen by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}
