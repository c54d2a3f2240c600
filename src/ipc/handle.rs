//! Consumer-side open-handle bookkeeping (spec §3 "Open-handle record").
//!
//! Grounded in the teacher's `DashMap`-backed `AllocatorManager` registry
//! (`allocator/manager.rs`): a concurrent map keyed by fingerprint, with a
//! secondary address-ordered index so `close_ipc_handle(ptr)` can resolve
//! a bare pointer back to its record the same way the tracking table
//! resolves allocations.

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{UmfError, UmfResult};
use crate::tracking::PoolId;

/// One imported mapping: the opaque bytes it was opened from (kept to
/// disambiguate fingerprint collisions), the local base address it was
/// mapped to, and the refcount of outstanding `open_ipc_handle` calls
/// sharing it (spec §8 "Refcount law").
pub struct OpenRecord {
    pub opaque: Vec<u8>,
    pub mapped_base: usize,
    pub base_size: usize,
    pub refcount: usize,
    pub owning_pool: PoolId,
    pub producer_pid: i32,
}

/// Per-process table of currently open IPC mappings.
#[derive(Default)]
pub struct OpenHandleTable {
    by_fingerprint: DashMap<u64, Mutex<Vec<OpenRecord>>>,
    by_base: parking_lot::RwLock<BTreeMap<usize, (u64, usize)>>,
}

impl OpenHandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks for an existing record whose opaque bytes equal `opaque`,
    /// bumping its refcount on a hit.
    pub fn find_and_retain(&self, fingerprint: u64, opaque: &[u8]) -> Option<(usize, usize)> {
        let bucket = self.by_fingerprint.get(&fingerprint)?;
        let mut records = bucket.lock();
        let record = records.iter_mut().find(|r| r.opaque == opaque)?;
        record.refcount += 1;
        Some((record.mapped_base, record.base_size))
    }

    /// Registers a freshly opened mapping with refcount 1.
    pub fn insert(
        &self,
        fingerprint: u64,
        opaque: Vec<u8>,
        mapped_base: usize,
        base_size: usize,
        owning_pool: PoolId,
        producer_pid: i32,
    ) {
        let bucket = self
            .by_fingerprint
            .entry(fingerprint)
            .or_insert_with(|| Mutex::new(Vec::new()));
        bucket.lock().push(OpenRecord {
            opaque,
            mapped_base,
            base_size,
            refcount: 1,
            owning_pool,
            producer_pid,
        });
        self.by_base
            .write()
            .insert(mapped_base, (fingerprint, base_size));
    }

    /// Resolves `ptr` to its owning record's `(fingerprint, mapped_base,
    /// base_size, owning_pool)`, by arbitrary address inside the mapped
    /// range.
    pub fn locate(&self, ptr: usize) -> UmfResult<(u64, usize, usize, PoolId)> {
        let by_base = self.by_base.read();
        let (&base, &(fingerprint, base_size)) = by_base
            .range(..=ptr)
            .next_back()
            .ok_or_else(|| UmfError::invalid_argument("close_ipc_handle: unknown pointer"))?;
        if ptr >= base + base_size {
            return Err(UmfError::invalid_argument("close_ipc_handle: unknown pointer"));
        }
        let bucket = self
            .by_fingerprint
            .get(&fingerprint)
            .ok_or_else(|| UmfError::invalid_argument("close_ipc_handle: record missing"))?;
        let owning_pool = bucket
            .lock()
            .iter()
            .find(|r| r.mapped_base == base)
            .map(|r| r.owning_pool)
            .ok_or_else(|| UmfError::invalid_argument("close_ipc_handle: record missing"))?;
        Ok((fingerprint, base, base_size, owning_pool))
    }

    /// Decrements the refcount for the record at `mapped_base`, returning
    /// `true` if it dropped to zero (the caller must then release the
    /// mapping and remove it via [`OpenHandleTable::remove`]).
    pub fn release(&self, fingerprint: u64, mapped_base: usize) -> UmfResult<bool> {
        let bucket = self
            .by_fingerprint
            .get(&fingerprint)
            .ok_or_else(|| UmfError::invalid_argument("release: no such fingerprint bucket"))?;
        let mut records = bucket.lock();
        let record = records
            .iter_mut()
            .find(|r| r.mapped_base == mapped_base)
            .ok_or_else(|| UmfError::invalid_argument("release: no such record"))?;
        record.refcount -= 1;
        Ok(record.refcount == 0)
    }

    /// Removes a fully-released record.
    pub fn remove(&self, fingerprint: u64, mapped_base: usize) {
        if let Some(bucket) = self.by_fingerprint.get(&fingerprint) {
            bucket.lock().retain(|r| r.mapped_base != mapped_base);
        }
        self.by_base.write().remove(&mapped_base);
    }
}
