use super::logger::{LogLevel, LoggerConfig};

/// Configuration for the per-device reverse mapping indices.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ReverseMapConfig {
    /// Logger configuration for index mutations.
    #[serde(default)]
    pub logger: LoggerConfig<ReverseMapLogLevel>,

    /// The largest region a single entry can describe, in bytes.
    #[serde(default = "default_max_region_size")]
    pub max_region_size: u64,
}

impl Default for ReverseMapConfig {
    fn default() -> Self {
        Self {
            logger: Default::default(),
            max_region_size: default_max_region_size(),
        }
    }
}

fn default_max_region_size() -> u64 {
    2 * 1024 * 1024
}

/// Log levels for the reverse mapping indices.
#[derive(Default, Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub enum ReverseMapLogLevel {
    /// Reverse map logging is disabled.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// Inserts and removals are logged.
    #[serde(rename = "basic")]
    Basic,

    /// Reparent, split, merge and lookups are logged too.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for ReverseMapLogLevel {
    fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}
