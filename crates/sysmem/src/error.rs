use alloc::string::String;
use sysmem_common::backtrace::BackTrace;
use thiserror::Error;

/// Errors returned by chunk, mapping and reverse-index operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SysmemError {
    /// Host page allocation or bookkeeping growth failed.
    ///
    /// Always recoverable: the caller can retry or fail the higher-level operation.
    #[error("Out of memory\nCaused by:\n  {reason}\nBacktrace\n{backtrace}")]
    OutOfMemory {
        /// The cause of the memory error.
        reason: String,
        /// The backtrace for this error.
        backtrace: BackTrace,
    },

    /// A misaligned or wrongly-sized request.
    #[error("Invalid argument\nCaused by:\n  {reason}\nBacktrace\n{backtrace}")]
    InvalidArgument {
        /// The reason the argument was rejected.
        reason: String,
        /// The backtrace for this error.
        backtrace: BackTrace,
    },

    /// A reverse-index key is already populated, a prior removal is missing.
    #[error("Reverse map entry already exists for DMA page key {key:#x}")]
    AlreadyExists {
        /// The colliding page-granular key.
        key: u64,
    },

    /// The platform rejected a DMA mapping.
    #[error("Operating system error\nCaused by:\n  {reason}\nBacktrace\n{backtrace}")]
    OperatingSystem {
        /// The reason reported by the platform.
        reason: String,
        /// The backtrace for this error.
        backtrace: BackTrace,
    },
}

impl SysmemError {
    /// Create an [out of memory](SysmemError::OutOfMemory) error.
    pub fn out_of_memory(reason: impl Into<String>) -> Self {
        Self::OutOfMemory {
            reason: reason.into(),
            backtrace: BackTrace::capture(),
        }
    }

    /// Create an [invalid argument](SysmemError::InvalidArgument) error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
            backtrace: BackTrace::capture(),
        }
    }

    /// Create an [operating system](SysmemError::OperatingSystem) error.
    pub fn operating_system(reason: impl Into<String>) -> Self {
        Self::OperatingSystem {
            reason: reason.into(),
            backtrace: BackTrace::capture(),
        }
    }

    /// Whether this is an [out of memory](SysmemError::OutOfMemory) error.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Whether this is an [invalid argument](SysmemError::InvalidArgument) error.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }
}
