//! Error types and result codes for the Unified Memory Framework.
//!
//! Mirrors the result-code contract in spec §6/§7 with a `thiserror`-derived
//! enum, the same shape as a production `MemoryError` type: one variant per
//! failure kind, a `code()` accessor for categorization, and constructors
//! that double as the single place a failure gets logged.

use std::fmt;

use thiserror::Error;

#[cfg(feature = "logging")]
use tracing::error;

/// The result codes enumerated in spec §6, kept as a standalone type so
/// callers can match on the wire-level category without pattern-matching
/// the full error (which carries free-form context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ResultCode {
    Success,
    OutOfHostMemory,
    OutOfDeviceMemory,
    InvalidArgument,
    PoolSpecific,
    ProviderSpecific,
    NotSupported,
    Unknown,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::OutOfHostMemory => "OUT_OF_HOST_MEMORY",
            Self::OutOfDeviceMemory => "OUT_OF_DEVICE_MEMORY",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::PoolSpecific => "POOL_SPECIFIC",
            Self::ProviderSpecific => "PROVIDER_SPECIFIC",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Unified error type for every fallible operation in this crate.
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum UmfError {
    #[error("out of host memory: requested {size} bytes (align {align})")]
    OutOfHostMemory { size: usize, align: usize },

    #[error("out of device memory: requested {size} bytes (align {align})")]
    OutOfDeviceMemory { size: usize, align: usize },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("pool-specific failure in '{pool}': {reason}")]
    PoolSpecific { pool: String, reason: String },

    #[error("provider-specific failure in '{provider}': {reason} (native code {native_code})")]
    ProviderSpecific {
        provider: String,
        reason: String,
        native_code: i32,
    },

    #[error("operation not supported: {feature}")]
    NotSupported { feature: &'static str },

    #[error("unknown error: {reason}")]
    Unknown { reason: String },
}

impl UmfError {
    /// Categorize this error into the wire-level result code from spec §6.
    #[must_use]
    pub fn code(&self) -> ResultCode {
        match self {
            Self::OutOfHostMemory { .. } => ResultCode::OutOfHostMemory,
            Self::OutOfDeviceMemory { .. } => ResultCode::OutOfDeviceMemory,
            Self::InvalidArgument { .. } => ResultCode::InvalidArgument,
            Self::PoolSpecific { .. } => ResultCode::PoolSpecific,
            Self::ProviderSpecific { .. } => ResultCode::ProviderSpecific,
            Self::NotSupported { .. } => ResultCode::NotSupported,
            Self::Unknown { .. } => ResultCode::Unknown,
        }
    }

    /// `NOT_SUPPORTED` is the one code callers are expected to treat as a
    /// soft skip rather than a hard failure (spec §7).
    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }

    pub fn out_of_host_memory(size: usize, align: usize) -> Self {
        #[cfg(feature = "logging")]
        error!(size, align, "out of host memory");
        Self::OutOfHostMemory { size, align }
    }

    pub fn out_of_device_memory(size: usize, align: usize) -> Self {
        #[cfg(feature = "logging")]
        error!(size, align, "out of device memory");
        Self::OutOfDeviceMemory { size, align }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn pool_specific(pool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PoolSpecific {
            pool: pool.into(),
            reason: reason.into(),
        }
    }

    pub fn provider_specific(
        provider: impl Into<String>,
        reason: impl Into<String>,
        native_code: i32,
    ) -> Self {
        #[cfg(feature = "logging")]
        error!(native_code, "provider-specific failure");
        Self::ProviderSpecific {
            provider: provider.into(),
            reason: reason.into(),
            native_code,
        }
    }

    pub fn not_supported(feature: &'static str) -> Self {
        Self::NotSupported { feature }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::Unknown {
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type UmfResult<T> = Result<T, UmfError>;

thread_local! {
    static LAST_ALLOCATION_ERROR: std::cell::RefCell<Option<UmfError>> = const { std::cell::RefCell::new(None) };
}

/// Records the given error as this thread's last allocation error
/// (spec §4.3, "Error handling").
pub(crate) fn set_last_allocation_error(err: UmfError) {
    LAST_ALLOCATION_ERROR.with(|slot| *slot.borrow_mut() = Some(err));
}

/// Returns the last allocation error recorded on the calling thread, if any.
///
/// Mirrors `pool_get_last_allocation_error` from spec §6: a thread-local
/// slot that is overwritten, never cleared, by each failing `pool_malloc`-
/// family call on that thread.
#[must_use]
pub fn get_last_allocation_error() -> Option<UmfError> {
    LAST_ALLOCATION_ERROR.with(|slot| slot.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_matches_variant() {
        assert_eq!(
            UmfError::out_of_host_memory(8, 8).code(),
            ResultCode::OutOfHostMemory
        );
        assert_eq!(
            UmfError::not_supported("ipc").code(),
            ResultCode::NotSupported
        );
    }

    #[test]
    fn not_supported_is_soft() {
        assert!(UmfError::not_supported("x").is_not_supported());
        assert!(!UmfError::invalid_argument("x").is_not_supported());
    }

    #[test]
    fn last_allocation_error_is_thread_local() {
        assert!(get_last_allocation_error().is_none());
        set_last_allocation_error(UmfError::out_of_host_memory(4096, 8));
        let err = get_last_allocation_error().expect("error should be recorded");
        assert_eq!(err.code(), ResultCode::OutOfHostMemory);
    }
}
