//! The provider vtable abstraction (spec §4.1) and its two supporting
//! collaborators: the upstream-wrapping pattern (§4.2) and the concrete
//! backends in [`os`] and [`fixed`].
//!
//! In the source C implementation a provider is a struct of function
//! pointers plus an opaque state blob. Rust's trait objects are the
//! idiomatic stand-in, the same substitution the teacher makes for its
//! `Allocator` trait (`allocator/traits.rs`): a `dyn MemoryProvider` *is*
//! the vtable, with default method bodies modeling the optional
//! sub-capabilities (`purge`, `split`/`merge`, IPC) as `NOT_SUPPORTED`
//! rather than as separate nullable function-pointer tables.

pub mod fixed;
pub mod os;
pub mod wrapping;

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{UmfError, UmfResult};

/// A coarse-grain memory provider (spec §3 "Provider instance", §4.1).
///
/// All methods take `&self`: concurrent callers may invoke `alloc`/`free`
/// on the same provider from different threads (spec §5), so any internal
/// mutable state a provider needs (free lists, native handles, the
/// last-native-error slot) must be behind interior mutability that is
/// itself `Send + Sync`.
pub trait MemoryProvider: Send + Sync {
    /// A stable, human-readable name. Used by the IPC engine's
    /// compatibility check (spec §7): a consumer's provider must report
    /// the same name and the same `get_ipc_handle_size` as the producer's.
    fn get_name(&self) -> &str;

    /// Returns the base of a coarse region of at least `size` bytes,
    /// aligned to at least `alignment`. `alignment == 0` means "provider
    /// default".
    fn alloc(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>>;

    /// Releases exactly a region previously returned by `alloc` on this
    /// provider, with the same `size` it was allocated with.
    fn free(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()>;

    /// Releases all resources held by this provider. No-fail by contract
    /// (spec §4.1): a provider enters this method exactly once, so any
    /// internal failure here is logged and swallowed, never propagated.
    ///
    /// Called explicitly by [`provider_destroy`] or by an owning [`crate::pool::Pool`]/
    /// [`wrapping::WrappingProvider`] when its ownership flag is set — Rust's
    /// `Drop` is not used for this because destruction here is a distinct,
    /// explicit contract step, not implicit scope-exit cleanup (spec's
    /// "destruction is idempotent only insofar as double-destroy is a
    /// programming error").
    fn finalize(&self);

    /// Returns the backend's last native error on the calling thread, if
    /// one has been recorded since the last successful call.
    fn get_last_native_error(&self) -> (String, i32) {
        (String::new(), 0)
    }

    /// Recommended page/slab size for an allocation of `size` bytes.
    fn get_recommended_page_size(&self, size: usize) -> usize {
        let _ = size;
        4096
    }

    /// Minimum page size backing the allocation at `ptr`.
    fn get_min_page_size(&self, ptr: NonNull<u8>) -> usize {
        let _ = ptr;
        4096
    }

    /// Hints that the backend may decommit `[ptr, ptr+size)` lazily.
    fn purge_lazy(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()> {
        let _ = (ptr, size);
        Err(UmfError::not_supported("purge_lazy"))
    }

    /// Hints that the backend should decommit `[ptr, ptr+size)` now.
    fn purge_force(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()> {
        let _ = (ptr, size);
        Err(UmfError::not_supported("purge_force"))
    }

    /// Notifies the provider that the tracking table is splitting a region
    /// of `total` bytes at `ptr` into a first part of `first` bytes. A
    /// provider that does not track sub-region state can ignore this.
    fn allocation_split(&self, ptr: NonNull<u8>, total: usize, first: usize) -> UmfResult<()> {
        let _ = (ptr, total, first);
        Err(UmfError::not_supported("allocation_split"))
    }

    /// Notifies the provider that two adjacent regions are being merged
    /// back into one of `total` bytes.
    fn allocation_merge(&self, low: NonNull<u8>, high: NonNull<u8>, total: usize) -> UmfResult<()> {
        let _ = (low, high, total);
        Err(UmfError::not_supported("allocation_merge"))
    }

    /// Size, in bytes, of this provider's opaque IPC handle blob. Constant
    /// per provider instance (spec §3).
    fn get_ipc_handle_size(&self) -> UmfResult<usize> {
        Err(UmfError::not_supported("ipc"))
    }

    /// Fills `out` (exactly `get_ipc_handle_size()` bytes) with an opaque
    /// blob that [`open_ipc_handle`](Self::open_ipc_handle) in another
    /// process can turn back into a mapping of the same physical memory.
    fn get_ipc_handle(&self, ptr: NonNull<u8>, size: usize, out: &mut [u8]) -> UmfResult<()> {
        let _ = (ptr, size, out);
        Err(UmfError::not_supported("ipc"))
    }

    /// Releases producer-side resources associated with a blob previously
    /// filled by `get_ipc_handle`.
    fn put_ipc_handle(&self, blob: &[u8]) -> UmfResult<()> {
        let _ = blob;
        Err(UmfError::not_supported("ipc"))
    }

    /// Consumer-side: maps the region described by `blob` into this
    /// process, returning its local base address.
    fn open_ipc_handle(&self, blob: &[u8]) -> UmfResult<NonNull<u8>> {
        let _ = blob;
        Err(UmfError::not_supported("ipc"))
    }

    /// Consumer-side: unmaps a region previously returned by
    /// `open_ipc_handle`.
    fn close_ipc_handle(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()> {
        let _ = (ptr, size);
        Err(UmfError::not_supported("ipc"))
    }
}

/// Shared handle to a provider instance. Always `Arc`-based: the tracking
/// table, a pool, and any wrapping provider may all hold a reference to
/// the same provider concurrently (spec §3/§5). Ownership, in the sense
/// of "who calls `finalize`", is tracked separately (see
/// [`crate::pool::PoolCreateFlags::OWN_PROVIDER`] and
/// [`wrapping::WrappingProvider`]).
pub type ProviderHandle = Arc<dyn MemoryProvider>;

/// Wraps a concrete provider into a type-erased, shareable handle. The
/// Rust equivalent of spec §6's `provider_create(ops, params)`: here
/// `ops` is simply "whatever `impl MemoryProvider` `provider` has".
pub fn provider_create<P: MemoryProvider + 'static>(provider: P) -> ProviderHandle {
    Arc::new(provider)
}

/// Explicitly destroys a provider (spec §6 `provider_destroy`). Calling
/// this more than once for providers whose `finalize` is not idempotent is
/// a programming error, matching the C contract this crate reimplements.
pub fn provider_destroy(provider: &ProviderHandle) {
    provider.finalize();
}
