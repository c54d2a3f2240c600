//! Pool vtable and lifecycle (spec §4.3 header, §3 "Pool instance"): a
//! fine-grain allocator stacked over one or more providers.
//!
//! Grounded in the teacher's split between a trait (`allocator::traits::Allocator`)
//! and a concrete registry of live instances (`allocator::manager::AllocatorManager`,
//! `dashmap`-backed). Here [`PoolOps`] plays the trait's role and
//! [`registry`] plays the manager's: every [`Pool`] is registered by its
//! [`crate::tracking::PoolId`] so that the top-level, caller-supplied-pool-free
//! generic API (spec §6 `free(ptr)`, `get_pool_by_ptr(ptr)`) can resolve a
//! bare pointer back to the pool that owns it.

pub mod disjoint;

use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::error::{UmfError, UmfResult};
use crate::provider::MemoryProvider;
use crate::tracking::{self, PoolId};

/// The fine-grain allocation operations a concrete pool implementation
/// provides (spec §6 pool surface). `Pool` boxes one of these and
/// forwards to it.
pub trait PoolOps: Send + Sync {
    fn malloc(&self, size: usize) -> UmfResult<NonNull<u8>>;
    fn calloc(&self, num: usize, size: usize) -> UmfResult<NonNull<u8>>;
    fn aligned_malloc(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>>;
    fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> UmfResult<NonNull<u8>>;
    fn free(&self, ptr: NonNull<u8>) -> UmfResult<()>;
    fn malloc_usable_size(&self, ptr: NonNull<u8>) -> usize;
}

/// Pool creation flags (spec §6 "Pool creation flags").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCreateFlags {
    /// Destroying the pool also destroys its provider(s).
    pub own_provider: bool,
}

/// A pool instance: one or more providers, an ownership flag, and the
/// boxed hot-path implementation (spec §3 "Pool instance").
pub struct Pool {
    id: PoolId,
    providers: Vec<Arc<dyn MemoryProvider>>,
    own_provider: bool,
    ops: Box<dyn PoolOps>,
}

impl Pool {
    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn malloc(&self, size: usize) -> UmfResult<NonNull<u8>> {
        self.record_on_err(self.ops.malloc(size))
    }

    pub fn calloc(&self, num: usize, size: usize) -> UmfResult<NonNull<u8>> {
        self.record_on_err(self.ops.calloc(num, size))
    }

    pub fn aligned_malloc(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>> {
        self.record_on_err(self.ops.aligned_malloc(size, alignment))
    }

    pub fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> UmfResult<NonNull<u8>> {
        self.record_on_err(self.ops.realloc(ptr, new_size))
    }

    pub fn free(&self, ptr: NonNull<u8>) -> UmfResult<()> {
        if let Err(e) = self.ops.free(ptr) {
            crate::error::set_last_allocation_error(e.clone());
            return Err(e);
        }
        Ok(())
    }

    pub fn malloc_usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.ops.malloc_usable_size(ptr)
    }

    fn record_on_err(&self, result: UmfResult<NonNull<u8>>) -> UmfResult<NonNull<u8>> {
        if let Err(ref e) = result {
            crate::error::set_last_allocation_error(e.clone());
        }
        result
    }

    /// Providers backing this pool, in creation order. Used by the IPC
    /// engine's compatibility check (spec §7).
    pub fn providers(&self) -> &[Arc<dyn MemoryProvider>] {
        &self.providers
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.own_provider {
            for provider in &self.providers {
                provider.finalize();
            }
        }
    }
}

static REGISTRY: OnceLock<DashMap<PoolId, Arc<Pool>>> = OnceLock::new();

fn registry() -> &'static DashMap<PoolId, Arc<Pool>> {
    REGISTRY.get_or_init(DashMap::new)
}

/// Creates a disjoint pool over `providers` (spec §6 `pool_create`).
/// `providers[0]` is the one the disjoint allocator actually requests
/// slabs from; additional providers are retained only for ownership
/// bookkeeping, mirroring the original's `numProviders` parameter which
/// is accepted but only `providers[0]` is exercised by the hot path.
pub fn pool_create(
    providers: Vec<Arc<dyn MemoryProvider>>,
    params: crate::config::DisjointPoolParams,
    flags: PoolCreateFlags,
) -> UmfResult<Arc<Pool>> {
    if providers.is_empty() {
        return Err(UmfError::invalid_argument("pool_create requires at least one provider"));
    }
    let id = tracking::next_pool_id();
    let ops = disjoint::DisjointPool::new(providers[0].clone(), params, id)?;
    let pool = Arc::new(Pool {
        id,
        providers,
        own_provider: flags.own_provider,
        ops: Box::new(ops),
    });
    registry().insert(id, pool.clone());
    Ok(pool)
}

/// Destroys a pool (spec §6 `pool_destroy`): removes it from the registry
/// and, if it was the last `Arc` owner, runs `Pool::drop`, which
/// conditionally finalizes the providers (spec §8 "Ownership" scenario).
pub fn pool_destroy(pool: Arc<Pool>) {
    registry().remove(&pool.id());
    drop(pool);
}

/// Looks up a live pool by id, used by the IPC engine to resolve the
/// consumer-side provider for a previously opened handle.
pub fn get_pool(id: PoolId) -> Option<Arc<Pool>> {
    registry().get(&id).map(|r| r.value().clone())
}

/// Resolves `ptr` to the pool that owns it via the tracking table (spec
/// §6 `get_pool_by_ptr`).
pub fn get_pool_by_ptr(ptr: NonNull<u8>) -> Option<Arc<Pool>> {
    let entry = tracking::global().find(ptr.as_ptr() as usize)?;
    registry().get(&entry.pool).map(|r| r.value().clone())
}

/// Generic `free(ptr)` (spec §6): resolves the owning pool via the
/// tracking table rather than requiring the caller to know it.
pub fn free(ptr: NonNull<u8>) -> UmfResult<()> {
    let pool = get_pool_by_ptr(ptr)
        .ok_or_else(|| UmfError::invalid_argument("free: pointer is not tracked by any pool"))?;
    pool.free(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisjointPoolParams, FixedProviderParams};
    use crate::provider::fixed::FixedMemoryProvider;
    use crate::provider::mock::CountingMockProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params() -> DisjointPoolParams {
        DisjointPoolParams {
            slab_min_size: 32 * 1024,
            max_poolable_size: 2 * 1024 * 1024,
            capacity: 4,
            min_bucket_size: 16,
        }
    }

    #[test]
    fn own_provider_flag_drives_finalize_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let provider: Arc<dyn MemoryProvider> = Arc::new(CountingMockProvider::new(counter.clone()));
        let pool = pool_create(
            vec![provider],
            params(),
            PoolCreateFlags { own_provider: true },
        )
        .unwrap();
        pool_destroy(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn without_own_provider_flag_provider_survives() {
        let counter = Arc::new(AtomicUsize::new(0));
        let provider: Arc<dyn MemoryProvider> = Arc::new(CountingMockProvider::new(counter.clone()));
        let pool = pool_create(
            vec![provider],
            params(),
            PoolCreateFlags::default(),
        )
        .unwrap();
        pool_destroy(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn generic_free_resolves_pool_without_caller_supplying_it() {
        let provider: Arc<dyn MemoryProvider> =
            Arc::new(FixedMemoryProvider::new(FixedProviderParams { size: 1 << 20 }).unwrap());
        let pool = pool_create(vec![provider], params(), PoolCreateFlags::default()).unwrap();
        let ptr = pool.malloc(128).unwrap();
        free(ptr).unwrap();
        pool_destroy(pool);
    }

    #[test]
    fn get_pool_by_ptr_finds_the_owning_pool() {
        let provider: Arc<dyn MemoryProvider> =
            Arc::new(FixedMemoryProvider::new(FixedProviderParams { size: 1 << 20 }).unwrap());
        let pool = pool_create(vec![provider], params(), PoolCreateFlags::default()).unwrap();
        let ptr = pool.malloc(64).unwrap();
        let found = get_pool_by_ptr(ptr).unwrap();
        assert_eq!(found.id(), pool.id());
        pool.free(ptr).unwrap();
        pool_destroy(pool);
    }
}
