use super::{chunk::ChunkConfig, mapping::MappingConfig, reverse_map::ReverseMapConfig};
use alloc::sync::Arc;

/// Static mutex holding the global configuration, initialized as `None`.
static SYSMEM_GLOBAL_CONFIG: spin::Mutex<Option<Arc<GlobalConfig>>> = spin::Mutex::new(None);

/// Represents the global configuration for sysmem, combining chunk, mapping and reverse map settings.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GlobalConfig {
    /// Configuration for chunk allocation, split and merge.
    #[serde(default)]
    pub chunk: ChunkConfig,

    /// Configuration for per-chunk DMA mappings.
    #[serde(default)]
    pub mapping: MappingConfig,

    /// Configuration for the reverse mapping indices.
    #[serde(default)]
    pub reverse_map: ReverseMapConfig,
}

impl GlobalConfig {
    /// Retrieves the current global configuration, loading it from the current directory if not set.
    ///
    /// If no configuration is set, it attempts to load one from `sysmem.toml` or `Sysmem.toml` in the
    /// current directory or its parents. If no file is found, a default configuration is used.
    ///
    /// # Notes
    ///
    /// Calling this function takes a global lock. Managers read the configuration once at
    /// construction and keep their own copy.
    pub fn get() -> Arc<Self> {
        let mut state = SYSMEM_GLOBAL_CONFIG.lock();
        if state.as_ref().is_none() {
            cfg_if::cfg_if! {
                if #[cfg(std_io)]  {
                    let config = Self::from_current_dir();
                    let config = config.override_from_env();
                } else {
                    let config = Self::default();
                }
            }

            *state = Some(Arc::new(config));
        }

        state.as_ref().cloned().unwrap()
    }

    #[cfg(std_io)]
    /// Save the current configuration to the provided file path.
    pub fn save_default<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<()> {
        use std::io::Write;

        let config = Self::get();
        let content =
            toml::to_string_pretty(config.as_ref()).expect("Default config should be serializable");
        let mut file = std::fs::File::create(path)?;
        file.write_all(content.as_bytes())?;

        Ok(())
    }

    /// Sets the global configuration to the provided value.
    ///
    /// # Panics
    /// Panics if the configuration has already been set or read, as it cannot be overridden.
    ///
    /// # Warning
    /// This method must be called during driver initialization, before any calls to `get`.
    pub fn set(config: Self) {
        let mut state = SYSMEM_GLOBAL_CONFIG.lock();
        if state.is_some() {
            panic!("Cannot set the global configuration multiple times.");
        }
        *state = Some(Arc::new(config));
    }

    #[cfg(std_io)]
    /// Overrides configuration fields based on environment variables.
    pub fn override_from_env(mut self) -> Self {
        use super::{
            chunk::ChunkLogLevel, mapping::MappingLogLevel, reverse_map::ReverseMapLogLevel,
        };

        if let Ok(val) = std::env::var("SYSMEM_DEBUG_LOG") {
            self.chunk.logger.level = ChunkLogLevel::Full;
            self.mapping.logger.level = MappingLogLevel::Full;
            self.reverse_map.logger.level = ReverseMapLogLevel::Full;

            match val.as_str() {
                "stdout" => {
                    self.chunk.logger.stdout = true;
                    self.mapping.logger.stdout = true;
                    self.reverse_map.logger.stdout = true;
                }
                "stderr" => {
                    self.chunk.logger.stderr = true;
                    self.mapping.logger.stderr = true;
                    self.reverse_map.logger.stderr = true;
                }
                "1" | "true" => {
                    let file_path = "/tmp/sysmem.log";
                    self.chunk.logger.file = Some(file_path.into());
                    self.mapping.logger.file = Some(file_path.into());
                    self.reverse_map.logger.file = Some(file_path.into());
                }
                "0" | "false" => {
                    self.chunk.logger.level = ChunkLogLevel::Disabled;
                    self.mapping.logger.level = MappingLogLevel::Disabled;
                    self.reverse_map.logger.level = ReverseMapLogLevel::Disabled;
                }
                file_path => {
                    self.chunk.logger.file = Some(file_path.into());
                    self.mapping.logger.file = Some(file_path.into());
                    self.reverse_map.logger.file = Some(file_path.into());
                }
            }
        };

        if let Ok(val) = std::env::var("SYSMEM_CPU_CHUNK_ALLOCATION_SIZES") {
            match ChunkConfig::parse_size_mask(&val) {
                Some(sizes) => self.chunk.allocation_sizes = sizes,
                None => log::warn!(
                    "Ignoring SYSMEM_CPU_CHUNK_ALLOCATION_SIZES={val}, no supported size in mask"
                ),
            }
        }

        self
    }

    // Loads configuration from `sysmem.toml` or `Sysmem.toml` in the current directory or its parents.
    //
    // Traverses up the directory tree until a valid configuration file is found or the root is reached.
    // Returns a default configuration if no file is found.
    #[cfg(std_io)]
    fn from_current_dir() -> Self {
        let Ok(mut dir) = std::env::current_dir() else {
            return Self::default();
        };

        loop {
            if let Ok(content) = Self::from_file_path(dir.join("sysmem.toml")) {
                return content;
            }

            if let Ok(content) = Self::from_file_path(dir.join("Sysmem.toml")) {
                return content;
            }

            if !dir.pop() {
                break;
            }
        }

        Self::default()
    }

    /// Loads configuration from a specified file path.
    #[cfg(std_io)]
    pub fn from_file_path<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    /// Parses a configuration from its toml representation.
    #[cfg(std_io)]
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(all(test, std_io))]
mod tests {
    use super::*;
    use crate::config::chunk::ChunkLogLevel;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = GlobalConfig::from_toml(
            r#"
            [chunk]
            allocation_sizes = [4096, 2097152]

            [chunk.logger]
            level = "basic"
            stderr = true
            "#,
        )
        .unwrap();

        assert_eq!(config.chunk.allocation_sizes, [4096, 2097152]);
        assert!(matches!(config.chunk.logger.level, ChunkLogLevel::Basic));
        assert!(config.chunk.logger.stderr);
        assert_eq!(
            config.reverse_map.max_region_size,
            ReverseMapConfig::default().max_region_size
        );
    }

    #[test]
    fn malformed_file_is_rejected() {
        let result = GlobalConfig::from_toml("[chunk]\nallocation_sizes = \"2MiB\"");

        assert!(result.is_err());
    }
}
