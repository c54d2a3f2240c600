//! A size class within the disjoint pool (spec §3 "Bucket", §4.3
//! "Allocation path within a bucket").

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{UmfError, UmfResult};
use crate::provider::MemoryProvider;

use super::slab::Slab;

/// Outcome of freeing a chunk, telling the caller whether a slab needs to
/// be released back to the provider (and its tracking-table entry
/// removed).
pub(crate) enum FreeOutcome {
    Kept,
    Released { base: NonNull<u8>, size: usize },
}

pub(crate) struct Bucket {
    chunk_size: usize,
    slab_size: usize,
    capacity: usize,
    slabs: Vec<Slab>,
    current: Option<usize>,
    peak_slabs: usize,
}

impl Bucket {
    pub fn new(chunk_size: usize, slab_size: usize, capacity: usize) -> Self {
        Self {
            chunk_size,
            slab_size,
            capacity,
            slabs: Vec::new(),
            current: None,
            peak_slabs: 0,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn empty_slab_count(&self) -> usize {
        self.slabs.iter().filter(|s| s.is_empty()).count()
    }

    /// Allocates one chunk, requesting a new slab from `provider` if
    /// neither the current slab nor any cached slab has room (spec §4.3
    /// "Allocation path within a bucket", steps 1-3). The `bool` in the
    /// result is `true` only when a brand new slab was requested from the
    /// provider, telling the caller it must register the slab's range
    /// with the tracking table.
    pub fn alloc(
        &mut self,
        provider: &Arc<dyn MemoryProvider>,
    ) -> UmfResult<(NonNull<u8>, NonNull<u8>, usize, bool)> {
        if let Some(idx) = self.current {
            if let Some(ptr) = self.slabs[idx].pop_free_chunk() {
                if self.slabs[idx].is_full() {
                    self.current = None;
                }
                let slab = &self.slabs[idx];
                return Ok((ptr, slab.base, slab.size, false));
            }
        }

        if let Some(idx) = self.slabs.iter().position(|s| !s.is_full()) {
            self.current = Some(idx);
            let ptr = self.slabs[idx]
                .pop_free_chunk()
                .expect("position() guaranteed a non-full slab");
            if self.slabs[idx].is_full() {
                self.current = None;
            }
            let slab = &self.slabs[idx];
            return Ok((ptr, slab.base, slab.size, false));
        }

        let base = provider.alloc(self.slab_size, self.chunk_size)?;
        let mut slab = Slab::new(base, self.slab_size, self.chunk_size);
        let ptr = slab
            .pop_free_chunk()
            .expect("a freshly created slab always has room for at least one chunk");
        let slab_base = slab.base;
        let slab_size = slab.size;
        self.slabs.push(slab);
        if !self.slabs.last().unwrap().is_full() {
            self.current = Some(self.slabs.len() - 1);
        }
        self.peak_slabs = self.peak_slabs.max(self.slabs.len());
        Ok((ptr, slab_base, slab_size, true))
    }

    /// Frees the chunk at `ptr` within `slab_base`. If the slab becomes
    /// empty and the bucket is already at capacity for cached empty
    /// slabs, the slab is removed from the bucket and reported to the
    /// caller for release to the provider (spec §4.3 "Free path").
    pub fn free(&mut self, slab_base: usize, ptr: usize) -> UmfResult<FreeOutcome> {
        let idx = self
            .slabs
            .iter()
            .position(|s| s.base.as_ptr() as usize == slab_base)
            .ok_or_else(|| UmfError::invalid_argument("no slab at the given base in this bucket"))?;

        self.slabs[idx].free_ptr(ptr);

        if self.current.is_none() && !self.slabs[idx].is_full() {
            self.current = Some(idx);
        }

        if self.slabs[idx].is_empty() && self.empty_slab_count() > self.capacity {
            let slab = self.slabs.remove(idx);
            if self.current == Some(idx) {
                self.current = None;
            } else if let Some(cur) = self.current {
                if cur > idx {
                    self.current = Some(cur - 1);
                }
            }
            return Ok(FreeOutcome::Released {
                base: slab.base,
                size: slab.size,
            });
        }
        Ok(FreeOutcome::Kept)
    }

    pub fn empty_slabs_in_bound(&self) -> bool {
        self.empty_slab_count() <= self.capacity
    }

    #[cfg(test)]
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fixed::FixedMemoryProvider;
    use crate::config::FixedProviderParams;

    fn provider(size: usize) -> Arc<dyn MemoryProvider> {
        Arc::new(FixedMemoryProvider::new(FixedProviderParams { size }).unwrap())
    }

    #[test]
    fn allocates_within_one_slab_then_grows() {
        let provider = provider(1 << 20);
        let mut bucket = Bucket::new(64, 4096, 2);
        let chunks_per_slab = 4096 / 64;
        let mut ptrs = Vec::new();
        for _ in 0..chunks_per_slab {
            let (ptr, _, _, _) = bucket.alloc(&provider).unwrap();
            ptrs.push(ptr);
        }
        assert_eq!(bucket.slab_count(), 1);
        // One more forces a second slab.
        bucket.alloc(&provider).unwrap();
        assert_eq!(bucket.slab_count(), 2);
    }

    #[test]
    fn releases_slab_past_capacity() {
        let provider = provider(1 << 20);
        let mut bucket = Bucket::new(64, 4096, 0);
        let (ptr, base, _, _) = bucket.alloc(&provider).unwrap();
        assert_eq!(bucket.slab_count(), 1);
        let outcome = bucket
            .free(base.as_ptr() as usize, ptr.as_ptr() as usize)
            .unwrap();
        assert!(matches!(outcome, FreeOutcome::Released { .. }));
        assert_eq!(bucket.slab_count(), 0);
    }

    #[test]
    fn keeps_empty_slab_within_capacity() {
        let provider = provider(1 << 20);
        let mut bucket = Bucket::new(64, 4096, 4);
        let (ptr, base, _, _) = bucket.alloc(&provider).unwrap();
        let outcome = bucket
            .free(base.as_ptr() as usize, ptr.as_ptr() as usize)
            .unwrap();
        assert!(matches!(outcome, FreeOutcome::Kept));
        assert_eq!(bucket.slab_count(), 1);
    }
}
