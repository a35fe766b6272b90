use super::logger::{LogLevel, LoggerConfig};

/// Configuration for per-chunk DMA mappings.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct MappingConfig {
    /// Logger configuration for DMA map and unmap logs.
    #[serde(default)]
    pub logger: LoggerConfig<MappingLogLevel>,
}

/// Log levels for DMA mappings.
#[derive(Default, Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub enum MappingLogLevel {
    /// Mapping logging is disabled.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// Only platform DMA map and unmap calls are logged.
    #[serde(rename = "basic")]
    Basic,

    /// Every use count change is logged.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for MappingLogLevel {
    fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}
