use crate::config::{
    GlobalConfig, Logger, chunk::ChunkLogLevel, mapping::MappingLogLevel,
    reverse_map::ReverseMapLogLevel,
};
use alloc::{string::String, sync::Arc};

/// How detailed a message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verbosity {
    /// Logged at the basic level and above.
    Basic,
    /// Only logged at the full level.
    Full,
}

/// Level aware front of the [Logger], messages are only built when they are logged.
#[derive(Debug)]
pub(crate) struct SysmemLogger {
    logger: Logger,
}

impl SysmemLogger {
    pub(crate) fn new(config: Arc<GlobalConfig>) -> Self {
        Self {
            logger: Logger::new(config),
        }
    }

    pub(crate) fn log_chunk<F: FnOnce() -> String>(&mut self, verbosity: Verbosity, msg: F) {
        let enabled = match self.logger.log_level_chunk() {
            ChunkLogLevel::Disabled => false,
            ChunkLogLevel::Basic => verbosity == Verbosity::Basic,
            ChunkLogLevel::Full => true,
        };

        if enabled {
            self.logger.log_chunk(&msg());
        }
    }

    pub(crate) fn log_mapping<F: FnOnce() -> String>(&mut self, verbosity: Verbosity, msg: F) {
        let enabled = match self.logger.log_level_mapping() {
            MappingLogLevel::Disabled => false,
            MappingLogLevel::Basic => verbosity == Verbosity::Basic,
            MappingLogLevel::Full => true,
        };

        if enabled {
            self.logger.log_mapping(&msg());
        }
    }

    pub(crate) fn log_reverse_map<F: FnOnce() -> String>(&mut self, verbosity: Verbosity, msg: F) {
        let enabled = match self.logger.log_level_reverse_map() {
            ReverseMapLogLevel::Disabled => false,
            ReverseMapLogLevel::Basic => verbosity == Verbosity::Basic,
            ReverseMapLogLevel::Full => true,
        };

        if enabled {
            self.logger.log_reverse_map(&msg());
        }
    }
}
