//! IPC engine (spec §4.5): producer-side handle export and consumer-side
//! handle import, plus the UMF-level header wrapping that is independent
//! of which provider backs either side.
//!
//! Grounded in
//! `examples/original_source/examples/basic/provider_ipc_level_zero_getpidfd.c`'s
//! producer/consumer shape, generalized from one device backend to any
//! `MemoryProvider`.

pub mod handle;
pub mod wire;

use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::error::{UmfError, UmfResult};
use crate::pool::Pool;
use crate::provider::MemoryProvider;
use crate::tracking;
use handle::OpenHandleTable;
use wire::{fingerprint, IpcHeader, HEADER_SIZE};

static OPEN_HANDLES: OnceLock<OpenHandleTable> = OnceLock::new();

fn open_handles() -> &'static OpenHandleTable {
    OPEN_HANDLES.get_or_init(OpenHandleTable::new)
}

/// Producer-side bookkeeping so that `put_ipc_handle(blob)` — which the
/// spec gives no pool/pointer argument — can still recover which provider
/// originally emitted a given blob, and so `open_ipc_handle` can check the
/// producer's `get_name()` against the consumer's (spec §7). Keyed by a
/// fingerprint of the opaque (post-header) portion `get_ipc_handle`
/// produced, the same key `open_handles` uses; that portion is unique per
/// export call in practice (e.g. each export dup's a fresh fd).
static PRODUCER_PROVIDERS: OnceLock<DashMap<u64, Arc<dyn MemoryProvider>>> = OnceLock::new();

fn producer_providers() -> &'static DashMap<u64, Arc<dyn MemoryProvider>> {
    PRODUCER_PROVIDERS.get_or_init(DashMap::new)
}

/// Producer side: exports an IPC handle for `ptr` (spec §4.5, steps 1-6).
pub fn get_ipc_handle(ptr: NonNull<u8>) -> UmfResult<Vec<u8>> {
    let addr = ptr.as_ptr() as usize;
    let entry = tracking::global()
        .find(addr)
        .ok_or_else(|| UmfError::invalid_argument("get_ipc_handle: pointer is not tracked"))?;

    let n_p = entry.provider.get_ipc_handle_size()?;
    let mut blob = vec![0u8; HEADER_SIZE + n_p];

    let header = IpcHeader {
        pid: std::process::id() as i32,
        base_size: entry.size as u64,
        offset: (addr - entry.base) as u64,
    };
    header.encode_into(&mut blob[..HEADER_SIZE])?;

    let base_ptr = NonNull::new(entry.base as *mut u8).expect("tracking entry base is non-null");
    entry
        .provider
        .get_ipc_handle(base_ptr, entry.size, &mut blob[HEADER_SIZE..])?;

    // Keyed by a fingerprint over the opaque portion only, the same key
    // `open_ipc_handle`'s compatibility check and `open_handles` use — the
    // header varies per-export (offset/pid) even for the same underlying
    // provider, so keying on the full blob would never match back up.
    producer_providers().insert(wire::fingerprint(&blob[HEADER_SIZE..]), entry.provider.clone());
    Ok(blob)
}

/// Producer side: releases resources tied to a blob from
/// [`get_ipc_handle`] (spec §4.5 "inverts step 5... then frees the blob").
/// Freeing the blob itself is implicit in Rust (the caller drops its
/// `Vec<u8>`); this only runs the provider-side teardown.
pub fn put_ipc_handle(blob: &[u8]) -> UmfResult<()> {
    if blob.len() < HEADER_SIZE {
        return Err(UmfError::invalid_argument("put_ipc_handle: blob shorter than the header"));
    }
    let key = wire::fingerprint(&blob[HEADER_SIZE..]);
    let (_, provider) = producer_providers()
        .remove(&key)
        .ok_or_else(|| UmfError::invalid_argument("put_ipc_handle: unknown blob"))?;
    provider.put_ipc_handle(&blob[HEADER_SIZE..])
}

/// Consumer side: imports a handle into `pool`'s address space (spec
/// §4.5, steps 1-6).
pub fn open_ipc_handle(pool: &Arc<Pool>, blob: &[u8]) -> UmfResult<NonNull<u8>> {
    let provider = pool
        .providers()
        .first()
        .ok_or_else(|| UmfError::invalid_argument("open_ipc_handle: pool has no provider"))?;

    let header = IpcHeader::decode(blob)?;
    let opaque = &blob[HEADER_SIZE..];

    let fp = fingerprint(opaque);

    // Compatibility check (spec §7): both the handle size and the
    // provider name must match before any backend dispatch. The wire
    // format itself carries no name field, so the producer's name is
    // recovered from the `producer_providers` bookkeeping `get_ipc_handle`
    // populated, keyed by the same fingerprint.
    let expected_n_p = provider.get_ipc_handle_size()?;
    if expected_n_p != opaque.len() {
        return Err(UmfError::invalid_argument(
            "open_ipc_handle: provider handle size mismatch",
        ));
    }
    if let Some(producer_provider) = producer_providers().get(&fp) {
        if producer_provider.get_name() != provider.get_name() {
            return Err(UmfError::invalid_argument(
                "open_ipc_handle: provider name mismatch",
            ));
        }
    }

    if let Some((mapped_base, _base_size)) = open_handles().find_and_retain(fp, opaque) {
        let ptr = (mapped_base as u64 + header.offset) as usize;
        return NonNull::new(ptr as *mut u8).ok_or_else(|| UmfError::unknown("mapped to a null pointer"));
    }

    let base = provider.open_ipc_handle(opaque)?;
    let mapped_base = base.as_ptr() as usize;
    open_handles().insert(
        fp,
        opaque.to_vec(),
        mapped_base,
        header.base_size as usize,
        pool.id(),
        header.pid,
    );
    let ptr = (mapped_base as u64 + header.offset) as usize;
    NonNull::new(ptr as *mut u8).ok_or_else(|| UmfError::unknown("mapped to a null pointer"))
}

/// Consumer side: releases a mapping previously returned by
/// [`open_ipc_handle`] (spec §4.5).
pub fn close_ipc_handle(ptr: NonNull<u8>) -> UmfResult<()> {
    let addr = ptr.as_ptr() as usize;
    let (fp, mapped_base, base_size, owning_pool) = open_handles().locate(addr)?;
    let should_release = open_handles().release(fp, mapped_base)?;
    if should_release {
        let pool = crate::pool::get_pool(owning_pool)
            .ok_or_else(|| UmfError::unknown("owning pool no longer exists"))?;
        let provider = pool
            .providers()
            .first()
            .ok_or_else(|| UmfError::unknown("pool has no provider"))?;
        let base_ptr =
            NonNull::new(mapped_base as *mut u8).expect("mapped_base was a valid pointer");
        provider.close_ipc_handle(base_ptr, base_size)?;
        open_handles().remove(fp, mapped_base);
    }
    Ok(())
}
