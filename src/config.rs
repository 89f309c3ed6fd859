//! Configuration management for palisade.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PalisadeError, Result};
use crate::ratelimit::{Policy, PolicyTable};

const DEFAULT_MESSAGE: &str = "Too many requests.";

/// Main configuration for a palisade engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PalisadeConfig {
    /// Background sweep configuration
    #[serde(default)]
    pub sweep: SweepConfig,

    /// Per-action policies, merged over the builtin table
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
}

/// Background sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

impl SweepConfig {
    /// Sweep interval as a duration.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Per-action policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Sliding window length in milliseconds
    pub window_ms: u64,
    /// Attempts allowed inside the window
    pub max_attempts: u32,
    /// Block duration in milliseconds once the budget is exceeded
    pub block_ms: u64,
    /// Denial message; a generic line is used when omitted
    #[serde(default)]
    pub message: Option<String>,
}

impl From<&PolicyConfig> for Policy {
    fn from(config: &PolicyConfig) -> Self {
        Policy::new(
            config.window_ms,
            config.max_attempts,
            config.block_ms,
            config
                .message
                .clone()
                .unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
        )
    }
}

impl PalisadeConfig {
    /// Load configuration from a file: JSON when the extension is `.json`,
    /// YAML otherwise.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|e| PalisadeError::Config(e.to_string())),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| PalisadeError::Config(e.to_string()))
    }

    /// The effective policy table: the builtin actions, overridden or
    /// extended by configured entries.
    pub fn policy_table(&self) -> PolicyTable {
        let mut table = PolicyTable::builtin();
        for (action, policy) in &self.policies {
            table.insert(action.clone(), Policy::from(policy));
        }
        table
    }
}
