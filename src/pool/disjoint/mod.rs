//! Bucketed, multi-slab cache in front of a provider — the allocator's
//! hot path (spec §4.3).
//!
//! Grounded in
//! `examples/original_source/umf/disjoint_pool/disjoint_heap_manager.cpp`
//! (`usm::DisjointPool`), reshaped around Rust ownership: each [`Bucket`]
//! is `Mutex`-guarded independently (spec's "per-bucket lock for bucket
//! mutations"), while cross-bucket slab-to-pool resolution piggybacks on
//! the process-wide [`crate::tracking`] table rather than a second,
//! pool-private interval structure (spec §4.4: "used by... the disjoint
//! pool's slab-lookup if that pool chooses to piggyback").

mod bucket;
mod slab;

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::DisjointPoolParams;
use crate::error::{UmfError, UmfResult};
use crate::provider::MemoryProvider;
use crate::tracking::{self, PoolId};
use crate::utils::is_power_of_two;

use bucket::{Bucket, FreeOutcome};

use super::PoolOps;

/// Builds the geometric bucket-class sequence (spec §9 Open Question,
/// pinned): powers of two from `min_bucket_size` up to and including the
/// last class `<= max_poolable_size`. A request whose effective size
/// exceeds the last class bypasses pooling entirely.
fn bucket_classes(params: &DisjointPoolParams) -> Vec<usize> {
    let mut classes = Vec::new();
    let mut c = params.min_bucket_size;
    while c <= params.max_poolable_size {
        classes.push(c);
        c *= 2;
    }
    classes
}

/// Smallest power-of-two `>= min_bucket_size` sequence member that is also
/// `>= effective_min`, or `None` if that would exceed `max_poolable_size`
/// (spec §4.3 "Bucket selection").
fn class_for(effective_min: usize, params: &DisjointPoolParams) -> Option<usize> {
    let mut c = params.min_bucket_size;
    while c < effective_min {
        c *= 2;
    }
    if c > params.max_poolable_size {
        None
    } else {
        Some(c)
    }
}

/// Number of chunks a freshly requested slab should host. The spec leaves
/// this unspecified beyond `size = max(slab_min_size, bucket_class *
/// chunks_per_slab)`; 64 is a reasonable middle ground between slab churn
/// (too few) and wasted reserved-but-unused capacity (too many),
/// consistent with the sizing `disjoint_heap_manager.cpp` delegates to its
/// `Bucket` type.
const CHUNKS_PER_SLAB_TARGET: usize = 64;

fn slab_size_for(chunk_size: usize, params: &DisjointPoolParams) -> usize {
    params.slab_min_size.max(chunk_size * CHUNKS_PER_SLAB_TARGET)
}

pub struct DisjointPool {
    provider: Arc<dyn MemoryProvider>,
    params: DisjointPoolParams,
    bucket_classes: Vec<usize>,
    buckets: Vec<parking_lot::Mutex<Bucket>>,
    pool_id: PoolId,
    /// slab base -> index into `buckets`, so a pointer resolved through
    /// the global tracking table can be routed to the right bucket.
    slab_owner: RwLock<HashMap<usize, usize>>,
    /// Allocations that bypassed bucketing (size above `max_poolable_size`),
    /// keyed by pointer, value is the exact size requested from the
    /// provider.
    unbucketed: parking_lot::Mutex<HashMap<usize, usize>>,
}

impl DisjointPool {
    pub fn new(provider: Arc<dyn MemoryProvider>, params: DisjointPoolParams, pool_id: PoolId) -> UmfResult<Self> {
        params.validate()?;
        let classes = bucket_classes(&params);
        if classes.is_empty() {
            return Err(UmfError::invalid_argument(
                "min_bucket_size exceeds max_poolable_size: no bucket classes",
            ));
        }
        let buckets = classes
            .iter()
            .map(|&class| {
                let slab_size = slab_size_for(class, &params);
                parking_lot::Mutex::new(Bucket::new(class, slab_size, params.capacity))
            })
            .collect();
        Ok(Self {
            provider,
            params,
            bucket_classes: classes,
            buckets,
            pool_id,
            slab_owner: RwLock::new(HashMap::new()),
            unbucketed: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    fn bucket_index_for(&self, effective_min: usize) -> Option<usize> {
        let class = class_for(effective_min, &self.params)?;
        self.bucket_classes.iter().position(|&c| c == class)
    }

    fn alloc_bucketed(&self, index: usize, size: usize) -> UmfResult<NonNull<u8>> {
        let mut bucket = self.buckets[index].lock();
        let (ptr, slab_base, slab_size, is_new_slab) = bucket.alloc(&self.provider)?;
        drop(bucket);

        if is_new_slab {
            let base_addr = slab_base.as_ptr() as usize;
            tracking::global().insert(base_addr, slab_size, self.provider.clone(), self.pool_id)?;
            self.slab_owner.write().insert(base_addr, index);
        }
        let _ = size;
        Ok(ptr)
    }

    fn alloc_unbucketed(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>> {
        let align = if alignment == 0 { 1 } else { alignment };
        let ptr = self.provider.alloc(size, align)?;
        let addr = ptr.as_ptr() as usize;
        if let Err(e) = tracking::global().insert(addr, size, self.provider.clone(), self.pool_id) {
            let _ = self.provider.free(ptr, size);
            return Err(e);
        }
        self.unbucketed.lock().insert(addr, size);
        Ok(ptr)
    }

    fn alloc_impl(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>> {
        if alignment != 0 && !is_power_of_two(alignment) {
            return Err(UmfError::invalid_argument("alignment must be a power of two"));
        }
        let effective_min = size.max(alignment.max(1));
        match self.bucket_index_for(effective_min) {
            Some(index) => self.alloc_bucketed(index, size),
            None => self.alloc_unbucketed(size, alignment),
        }
    }

    fn usable_size_of(&self, ptr: usize) -> Option<usize> {
        if let Some(&size) = self.unbucketed.lock().get(&ptr) {
            return Some(size);
        }
        let entry = tracking::global().find(ptr)?;
        let index = *self.slab_owner.read().get(&entry.base)?;
        Some(self.bucket_classes[index])
    }
}

impl PoolOps for DisjointPool {
    fn malloc(&self, size: usize) -> UmfResult<NonNull<u8>> {
        // Boundary choice (spec §8): malloc(0) is served as a one-byte
        // allocation rather than returning null, so every successful
        // `malloc` result is a valid, freeable pointer.
        self.alloc_impl(size.max(1), 0)
    }

    fn calloc(&self, num: usize, size: usize) -> UmfResult<NonNull<u8>> {
        let total = num
            .checked_mul(size)
            .ok_or_else(|| UmfError::invalid_argument("num * size overflows"))?;
        let ptr = self.alloc_impl(total.max(1), 0)?;
        // SAFETY: ptr is valid for total.max(1) bytes, just allocated.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, total.max(1)) };
        Ok(ptr)
    }

    fn aligned_malloc(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>> {
        if alignment != 0 && !is_power_of_two(alignment) {
            return Err(UmfError::invalid_argument("alignment must be a power of two"));
        }
        self.alloc_impl(size.max(1), alignment)
    }

    fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> UmfResult<NonNull<u8>> {
        let old_usable = self
            .usable_size_of(ptr.as_ptr() as usize)
            .ok_or_else(|| UmfError::invalid_argument("unknown pointer"))?;
        let new_ptr = self.alloc_impl(new_size.max(1), 0)?;
        let copy_len = old_usable.min(new_size);
        // SAFETY: both ranges are distinct, live allocations of at least
        // copy_len bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
        }
        self.free(ptr)?;
        Ok(new_ptr)
    }

    fn free(&self, ptr: NonNull<u8>) -> UmfResult<()> {
        let addr = ptr.as_ptr() as usize;

        if let Some(size) = self.unbucketed.lock().remove(&addr) {
            tracking::global().remove(addr);
            return self.provider.free(ptr, size);
        }

        let entry = tracking::global()
            .find(addr)
            .ok_or_else(|| UmfError::invalid_argument("unknown pointer"))?;
        let index = *self
            .slab_owner
            .read()
            .get(&entry.base)
            .ok_or_else(|| UmfError::invalid_argument("pointer not owned by this pool"))?;

        let outcome = {
            let mut bucket = self.buckets[index].lock();
            bucket.free(entry.base, addr)?
        };
        if let FreeOutcome::Released { base, size } = outcome {
            let base_addr = base.as_ptr() as usize;
            self.slab_owner.write().remove(&base_addr);
            tracking::global().remove(base_addr);
            self.provider.free(base, size)?;
        }
        Ok(())
    }

    fn malloc_usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.usable_size_of(ptr.as_ptr() as usize).unwrap_or(0)
    }
}
