use super::logger::{LogLevel, LoggerConfig};
use alloc::vec::Vec;

/// Every chunk size the host page allocator can hand out, from 4 KiB to 2 MiB.
pub const SUPPORTED_CHUNK_SIZES_MASK: u64 = 0x003F_F000;

/// Configuration for host chunk allocation, split and merge.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ChunkConfig {
    /// Logger configuration for chunk lifecycle logs.
    #[serde(default)]
    pub logger: LoggerConfig<ChunkLogLevel>,

    /// The chunk sizes in bytes that allocation, split and merge may produce.
    ///
    /// Every size must be a power of two between 4 KiB and 2 MiB.
    #[serde(default = "default_allocation_sizes")]
    pub allocation_sizes: Vec<u64>,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            logger: Default::default(),
            allocation_sizes: default_allocation_sizes(),
        }
    }
}

impl ChunkConfig {
    /// Parse an OR'ed mask of allocation sizes, written in hexadecimal (`0x` prefix) or decimal.
    ///
    /// Sizes the host can't allocate are dropped. Returns `None` when the value doesn't parse
    /// or no supported size remains.
    pub fn parse_size_mask(value: &str) -> Option<Vec<u64>> {
        let value = value.trim();
        let mask = match value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16).ok()?,
            None => value.parse::<u64>().ok()?,
        };
        let mask = mask & SUPPORTED_CHUNK_SIZES_MASK;

        if mask == 0 {
            return None;
        }

        Some(
            (0..u64::BITS)
                .map(|bit| 1u64 << bit)
                .filter(|size| mask & size != 0)
                .collect(),
        )
    }
}

fn default_allocation_sizes() -> Vec<u64> {
    alloc::vec![4096, 65536, 2097152]
}

/// Log levels for chunk lifecycle events.
#[derive(Default, Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub enum ChunkLogLevel {
    /// Chunk logging is disabled.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// Allocations, splits and merges are logged.
    #[serde(rename = "basic")]
    Basic,

    /// Every chunk release and dirty state change is logged too.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for ChunkLogLevel {
    fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_mask_accepts_hex_and_decimal() {
        assert_eq!(
            ChunkConfig::parse_size_mask("0x201000"),
            Some(alloc::vec![4096, 2097152])
        );
        assert_eq!(
            ChunkConfig::parse_size_mask("69632"),
            Some(alloc::vec![4096, 65536])
        );
    }

    #[test]
    fn size_mask_drops_unsupported_sizes() {
        assert_eq!(
            ChunkConfig::parse_size_mask("0x40000fff"),
            None,
            "Sizes below a page or above 2 MiB can't be allocated"
        );
        assert_eq!(
            ChunkConfig::parse_size_mask("0x40080000"),
            Some(alloc::vec![524288])
        );
        assert_eq!(ChunkConfig::parse_size_mask("sixteen"), None);
    }
}
