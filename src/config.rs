//! Configuration structures for providers and pools.
//!
//! Grounded in the teacher's `core::config::MemoryConfig`: plain structs
//! with a `Default` impl and a `validate()` that returns `UmfError` instead
//! of panicking, so a misconfigured pool fails at `pool_create` rather than
//! at the first allocation.

use crate::error::{UmfError, UmfResult};
use crate::utils::is_power_of_two;

/// Configuration for [`crate::pool::disjoint::DisjointPool`] (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisjointPoolParams {
    /// Minimum size of a coarse slab requested from the provider.
    pub slab_min_size: usize,
    /// Largest allocation served from buckets; above this, requests bypass
    /// pooling and go straight to the provider.
    pub max_poolable_size: usize,
    /// Maximum number of empty slabs cached per bucket before releasing to
    /// the provider.
    pub capacity: usize,
    /// Smallest bucket size class; bucket sizes grow geometrically from
    /// here (spec §9: pinned to powers of two).
    pub min_bucket_size: usize,
}

impl Default for DisjointPoolParams {
    fn default() -> Self {
        Self {
            slab_min_size: 64 * 1024,
            max_poolable_size: 2 * 1024 * 1024,
            capacity: 4,
            min_bucket_size: 16,
        }
    }
}

impl DisjointPoolParams {
    /// Validates the configuration, returning `InvalidArgument` on failure.
    pub fn validate(&self) -> UmfResult<()> {
        if self.slab_min_size == 0 {
            return Err(UmfError::invalid_argument("slab_min_size must be non-zero"));
        }
        if self.max_poolable_size == 0 {
            return Err(UmfError::invalid_argument(
                "max_poolable_size must be non-zero",
            ));
        }
        if !is_power_of_two(self.min_bucket_size) {
            return Err(UmfError::invalid_argument(
                "min_bucket_size must be a power of two",
            ));
        }
        if self.min_bucket_size > self.max_poolable_size {
            return Err(UmfError::invalid_argument(
                "min_bucket_size must not exceed max_poolable_size",
            ));
        }
        Ok(())
    }
}

/// Configuration for [`crate::provider::os::OsMemoryProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OsProviderParams {
    /// If set, newly committed pages are requested with this alignment
    /// instead of the platform page size.
    pub requested_alignment: Option<usize>,
}

impl OsProviderParams {
    pub fn validate(&self) -> UmfResult<()> {
        if let Some(a) = self.requested_alignment {
            if !is_power_of_two(a) {
                return Err(UmfError::invalid_argument(
                    "requested_alignment must be a power of two",
                ));
            }
        }
        Ok(())
    }
}

/// Configuration for [`crate::provider::fixed::FixedMemoryProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedProviderParams {
    /// Total size, in bytes, of the backing buffer.
    pub size: usize,
}

impl FixedProviderParams {
    pub fn validate(&self) -> UmfResult<()> {
        if self.size == 0 {
            return Err(UmfError::invalid_argument("size must be non-zero"));
        }
        Ok(())
    }
}
