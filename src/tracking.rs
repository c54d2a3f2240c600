//! Process-wide tracking table (spec §4.4): the address-interval map that
//! lets a bare `ptr` be resolved back to the provider/pool that produced
//! it, for generic `free(ptr)` and for IPC export.
//!
//! Grounded in the teacher's `allocator::manager::GlobalAllocatorManager`
//! (`allocator/manager.rs`): a lazily-initialized, process-lifetime
//! singleton behind `std::sync::OnceLock`, rather than hand-rolled
//! double-checked locking.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::{UmfError, UmfResult};
use crate::provider::MemoryProvider;

/// Opaque identifier for a pool, stable for the pool's lifetime. Pools
/// mint these (their `Arc` allocation address is a convenient source) so
/// that `tracking` does not need to depend on the `pool` module.
pub type PoolId = usize;

/// A tracked address range and the provider/pool that own it (spec §3
/// "Tracking entry").
#[derive(Clone)]
pub struct TrackingEntry {
    pub provider: Arc<dyn MemoryProvider>,
    pub pool: PoolId,
    pub base: usize,
    pub size: usize,
    /// Base address of the entry this one was split from, if any. Purely
    /// informational: lookups key on `base`, not on lineage.
    pub parent: Option<usize>,
}

/// Process-wide address-interval map (spec §4.4).
pub struct TrackingTable {
    entries: RwLock<BTreeMap<usize, TrackingEntry>>,
    active: std::sync::atomic::AtomicBool,
}

impl TrackingTable {
    fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            active: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Inserts a new tracked range. Rejects overlap with any existing
    /// entry (spec §3 invariant: "address ranges never overlap").
    pub fn insert(
        &self,
        base: usize,
        size: usize,
        provider: Arc<dyn MemoryProvider>,
        pool: PoolId,
    ) -> UmfResult<()> {
        let mut entries = self.entries.write();
        if Self::overlaps(&entries, base, size) {
            return Err(UmfError::invalid_argument(
                "tracking insert overlaps an existing range",
            ));
        }
        entries.insert(
            base,
            TrackingEntry {
                provider,
                pool,
                base,
                size,
                parent: None,
            },
        );
        Ok(())
    }

    fn overlaps(entries: &BTreeMap<usize, TrackingEntry>, base: usize, size: usize) -> bool {
        let end = base + size;
        // The one entry that could overlap from below starts at or before
        // `base`; every entry from there on starts at or after `base`.
        if let Some((_, left)) = entries.range(..=base).next_back() {
            if left.base + left.size > base {
                return true;
            }
        }
        if let Some((&next_base, _)) = entries.range(base..).next() {
            if next_base < end {
                return true;
            }
        }
        false
    }

    /// Removes the entry whose range starts exactly at `base`.
    pub fn remove(&self, base: usize) -> Option<TrackingEntry> {
        self.entries.write().remove(&base)
    }

    /// Finds the entry whose range contains `ptr`, by arbitrary address
    /// inside the range (spec §4.4: "lookup by arbitrary address inside a
    /// tracked range, not only base").
    pub fn find(&self, ptr: usize) -> Option<TrackingEntry> {
        let entries = self.entries.read();
        let (_, entry) = entries.range(..=ptr).next_back()?;
        if ptr < entry.base + entry.size {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Splits the entry at `base` into `[base, base+first_size)` and
    /// `[base+first_size, base+old_size)`, both tagged with `base` as
    /// their parent.
    pub fn split(&self, base: usize, first_size: usize) -> UmfResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .remove(&base)
            .ok_or_else(|| UmfError::invalid_argument("split: no tracking entry at base"))?;
        if first_size == 0 || first_size >= entry.size {
            entries.insert(base, entry);
            return Err(UmfError::invalid_argument(
                "split: first_size must be strictly between 0 and the entry's size",
            ));
        }
        let second_base = base + first_size;
        let second_size = entry.size - first_size;
        entries.insert(
            base,
            TrackingEntry {
                provider: entry.provider.clone(),
                pool: entry.pool,
                base,
                size: first_size,
                parent: Some(base),
            },
        );
        entries.insert(
            second_base,
            TrackingEntry {
                provider: entry.provider,
                pool: entry.pool,
                base: second_base,
                size: second_size,
                parent: Some(base),
            },
        );
        Ok(())
    }

    /// Merges two adjacent entries (`low` immediately followed by `high`)
    /// back into one spanning both.
    pub fn merge(&self, low: usize, high: usize) -> UmfResult<()> {
        let mut entries = self.entries.write();
        let low_entry = entries
            .get(&low)
            .ok_or_else(|| UmfError::invalid_argument("merge: no tracking entry at low"))?;
        if low_entry.base + low_entry.size != high {
            return Err(UmfError::invalid_argument(
                "merge: entries are not adjacent",
            ));
        }
        let high_entry = entries
            .get(&high)
            .ok_or_else(|| UmfError::invalid_argument("merge: no tracking entry at high"))?;
        let total = low_entry.size + high_entry.size;
        let provider = low_entry.provider.clone();
        let pool = low_entry.pool;
        entries.remove(&low);
        entries.remove(&high);
        entries.insert(
            low,
            TrackingEntry {
                provider,
                pool,
                base: low,
                size: total,
                parent: None,
            },
        );
        Ok(())
    }

    /// Clears all entries, marking the table inactive. Idempotent (spec
    /// §4.4: "init/teardown is idempotent and thread-safe").
    pub fn teardown(&self) {
        self.entries.write().clear();
        self.active.store(false, Ordering::SeqCst);
    }

    /// Re-activates the table for use after a [`TrackingTable::teardown`].
    /// Idempotent: calling this while already active is a no-op.
    pub fn reinit(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static TABLE: OnceLock<TrackingTable> = OnceLock::new();

/// Returns the process-wide tracking table, creating it on first call
/// (spec §4.4: "initialized once per process, on first use").
pub fn global() -> &'static TrackingTable {
    TABLE.get_or_init(TrackingTable::new)
}

/// Explicit process-wide init hook, idempotent.
pub fn init() {
    global().reinit();
}

/// Explicit process-wide teardown hook, idempotent.
pub fn teardown() {
    global().teardown();
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Mints a fresh, process-unique [`PoolId`] for a newly created pool.
pub fn next_pool_id() -> PoolId {
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::CountingMockProvider;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn provider() -> Arc<dyn MemoryProvider> {
        Arc::new(CountingMockProvider::new(Arc::new(AtomicUsize::new(0))))
    }

    #[test]
    fn insert_find_remove_roundtrip() {
        let table = TrackingTable::new();
        table.insert(0x1000, 0x100, provider(), 7).unwrap();
        let found = table.find(0x1050).unwrap();
        assert_eq!(found.base, 0x1000);
        assert_eq!(found.pool, 7);
        assert!(table.find(0x1200).is_none());
        let removed = table.remove(0x1000).unwrap();
        assert_eq!(removed.size, 0x100);
        assert!(table.find(0x1050).is_none());
    }

    #[test]
    fn insert_rejects_overlap() {
        let table = TrackingTable::new();
        table.insert(0x1000, 0x100, provider(), 1).unwrap();
        assert!(table.insert(0x1050, 0x100, provider(), 1).is_err());
        assert!(table.insert(0x1000, 0x10, provider(), 1).is_err());
        // Adjacent, non-overlapping ranges are fine.
        table.insert(0x1100, 0x100, provider(), 1).unwrap();
    }

    #[test]
    fn split_then_merge_is_a_no_op_on_coverage() {
        let table = TrackingTable::new();
        table.insert(0x2000, 0x200, provider(), 2).unwrap();
        table.split(0x2000, 0x80).unwrap();

        let first = table.find(0x2000).unwrap();
        assert_eq!(first.size, 0x80);
        let second = table.find(0x2080).unwrap();
        assert_eq!(second.base, 0x2080);
        assert_eq!(second.size, 0x180);

        table.merge(0x2000, 0x2080).unwrap();
        let whole = table.find(0x2100).unwrap();
        assert_eq!(whole.base, 0x2000);
        assert_eq!(whole.size, 0x200);
    }

    #[test]
    fn merge_requires_adjacency() {
        let table = TrackingTable::new();
        table.insert(0x3000, 0x100, provider(), 1).unwrap();
        table.insert(0x3200, 0x100, provider(), 1).unwrap();
        assert!(table.merge(0x3000, 0x3200).is_err());
    }

    #[test]
    fn teardown_then_reinit_is_idempotent() {
        let table = TrackingTable::new();
        table.insert(0x4000, 0x10, provider(), 1).unwrap();
        table.teardown();
        table.teardown();
        assert!(table.is_empty());
        assert!(!table.is_active());
        table.reinit();
        table.reinit();
        assert!(table.is_active());
    }

    proptest! {
        /// Spec §3 invariant: tracked address ranges never overlap, and
        /// lookup by any address inside a range resolves to exactly that
        /// range, regardless of insertion order.
        #[test]
        fn no_overlap_and_lookup_resolves_the_right_block(
            block_size in 1usize..=512,
            count in 1usize..=48,
            shuffle_seed in 0u64..10_000,
        ) {
            const GAP: usize = 8;
            const START: usize = 0x1000_0000;
            let stride = block_size + GAP;

            let mut order: Vec<usize> = (0..count).collect();
            for i in (1..order.len()).rev() {
                let j = (shuffle_seed as usize).wrapping_add(i * 2654435761).wrapping_mul(7) % (i + 1);
                order.swap(i, j);
            }

            let table = TrackingTable::new();
            for &i in &order {
                table
                    .insert(START + i * stride, block_size, provider(), i)
                    .unwrap();
            }

            for i in 0..count {
                let base = START + i * stride;
                let found = table.find(base).unwrap();
                prop_assert_eq!(found.base, base);
                prop_assert_eq!(found.pool, i);
                let found_end = table.find(base + block_size - 1).unwrap();
                prop_assert_eq!(found_end.base, base);
                if GAP > 0 {
                    prop_assert!(table.find(base + block_size).is_none());
                }
            }
        }
    }
}
