//! Unified Memory Framework: a portable allocator layer composing
//! *memory providers* (sources of raw, coarse-grain allocations), *memory
//! pools* (fine-grain, cached sub-allocators stacked on providers), and a
//! cross-process **IPC handle** mechanism letting one process export an
//! allocation and another open it by reference onto the same physical
//! memory.
//!
//! Grounded in the teacher crate's top-level shape
//! (`nebula-memory`'s `lib.rs`): a small set of flat modules, a process
//! lifecycle pair (`init`/`shutdown`), and re-exports of the handful of
//! free functions that form the library's generic surface.

pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod pool;
pub mod provider;
pub mod tracking;
pub mod utils;

pub use error::{get_last_allocation_error, ResultCode, UmfError, UmfResult};
pub use ipc::{close_ipc_handle, get_ipc_handle, open_ipc_handle, put_ipc_handle};
pub use pool::{free, get_pool_by_ptr, pool_create, pool_destroy, Pool, PoolCreateFlags};
pub use provider::{provider_create, provider_destroy, MemoryProvider, ProviderHandle};

/// Brings up process-wide state: the logging subscriber and the tracking
/// table. Idempotent and safe to call more than once, mirroring the
/// teacher's `nebula_memory::init()`.
pub fn init() {
    logging::init();
    tracking::init();
}

/// Tears down process-wide state. Idempotent; a subsequent [`init`] call
/// reactivates the tracking table (spec §4.4: "init/teardown is
/// idempotent and thread-safe").
pub fn shutdown() {
    tracking::teardown();
}
