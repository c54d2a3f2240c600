//! End-to-end scenarios (spec §8 "End-to-end scenarios", six numbered
//! cases), driven only through the crate's public API the way a consumer
//! program would use it.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use umf::config::{DisjointPoolParams, FixedProviderParams, OsProviderParams};
use umf::provider::fixed::FixedMemoryProvider;
use umf::provider::os::OsMemoryProvider;
use umf::provider::wrapping::{UpstreamRef, WrappingProvider};
use umf::{pool_create, provider_create, provider_destroy, MemoryProvider, PoolCreateFlags, UmfResult};

fn small_bucket_params(min_bucket_size: usize, max_poolable_size: usize, capacity: usize) -> DisjointPoolParams {
    DisjointPoolParams {
        slab_min_size: max_poolable_size,
        max_poolable_size,
        capacity,
        min_bucket_size,
    }
}

/// Scenario 1: disjoint allocates 128 x 32 KiB from a fixed-buffer
/// provider backed by a 4 MiB buffer.
#[test]
fn scenario_1_fixed_buffer_128_allocations_then_oom_then_recovery() {
    let provider: Arc<dyn MemoryProvider> =
        Arc::new(FixedMemoryProvider::new(FixedProviderParams { size: 4 * 1024 * 1024 }).unwrap());
    let params = small_bucket_params(32 * 1024, 4 * 1024 * 1024, 1);
    let pool = pool_create(vec![provider], params, PoolCreateFlags::default()).unwrap();

    let mut ptrs = Vec::new();
    for _ in 0..128 {
        ptrs.push(pool.malloc(32 * 1024).unwrap());
    }
    assert!(pool.malloc(32 * 1024).is_err());

    let freed = ptrs.remove(0);
    pool.free(freed).unwrap();
    pool.malloc(32 * 1024).unwrap();

    for ptr in ptrs {
        pool.free(ptr).unwrap();
    }
}

/// Scenario 2: geometric stress at two size classes, both well above
/// `max_poolable_size` so every call bypasses buckets and goes straight
/// to the provider; peak bytes stay under the hard limit.
#[test]
fn scenario_2_geometric_stress_stays_under_hard_limit() {
    const HARD_LIMIT: usize = 1024 * 1024 * 1024;
    let provider: Arc<dyn MemoryProvider> =
        Arc::new(OsMemoryProvider::new(OsProviderParams::default()).unwrap());
    let params = small_bucket_params(64, 4096, 4);
    let pool = pool_create(vec![provider], params, PoolCreateFlags::default()).unwrap();

    let run = |pool: &umf::Pool, size: usize, repeats: usize| {
        let mut peak = 0usize;
        for _ in 0..repeats {
            let mut ptrs = Vec::new();
            for _ in 0..6 {
                let ptr = pool.malloc(size).unwrap();
                ptrs.push(ptr);
            }
            peak = peak.max(ptrs.len() * size);
            for ptr in ptrs {
                pool.free(ptr).unwrap();
            }
        }
        peak
    };

    let peak_a = run(&pool, 74_659 * 1024, 2);
    let peak_b = run(&pool, 8_206 * 1024, 2);
    assert!(peak_a <= HARD_LIMIT);
    assert!(peak_b <= HARD_LIMIT);
}

/// Scenario 3: IPC round-trip between a producer pool and a consumer pool.
#[test]
fn scenario_3_ipc_round_trip_observes_consumer_writes() {
    let producer_provider: Arc<dyn MemoryProvider> =
        Arc::new(OsMemoryProvider::new(OsProviderParams::default()).unwrap());
    let consumer_provider: Arc<dyn MemoryProvider> =
        Arc::new(OsMemoryProvider::new(OsProviderParams::default()).unwrap());
    let params = small_bucket_params(64, 4096, 4);
    let producer_pool = pool_create(vec![producer_provider], params, PoolCreateFlags::default()).unwrap();
    let consumer_pool = pool_create(vec![consumer_provider], params, PoolCreateFlags::default()).unwrap();

    let ptr = producer_pool.malloc(1024).unwrap();
    let value: u64 = 0xDEAD_BEEF_0123_4567;
    unsafe { (ptr.as_ptr() as *mut u64).write_unaligned(value) };

    let blob = umf::get_ipc_handle(ptr).unwrap();
    let opened = umf::open_ipc_handle(&consumer_pool, &blob).unwrap();
    let read = unsafe { (opened.as_ptr() as *const u64).read_unaligned() };
    assert_eq!(read, value);

    let halved = value / 2;
    unsafe { (opened.as_ptr() as *mut u64).write_unaligned(halved) };
    let observed = unsafe { (ptr.as_ptr() as *const u64).read_unaligned() };
    assert_eq!(observed, halved);

    umf::close_ipc_handle(opened).unwrap();
    umf::put_ipc_handle(&blob).unwrap();
    producer_pool.free(ptr).unwrap();
}

/// Scenario 4: one 4 MiB region exported as 128 separate 32 KiB-strided
/// IPC handles; the consumer opens all of them and sees the producer's
/// fill pattern everywhere.
#[test]
fn scenario_4_multi_handle_batch_over_one_region() {
    const STRIDE: usize = 32 * 1024;
    const COUNT: usize = 128;
    const PATTERN: u8 = 0x42;

    let producer_provider: Arc<dyn MemoryProvider> =
        Arc::new(OsMemoryProvider::new(OsProviderParams::default()).unwrap());
    let consumer_provider: Arc<dyn MemoryProvider> =
        Arc::new(OsMemoryProvider::new(OsProviderParams::default()).unwrap());
    let params = small_bucket_params(64, 4096, 4);
    let producer_pool = pool_create(vec![producer_provider], params, PoolCreateFlags::default()).unwrap();
    let consumer_pool = pool_create(vec![consumer_provider], params, PoolCreateFlags::default()).unwrap();

    let base = producer_pool.malloc(STRIDE * COUNT).unwrap();
    unsafe { std::ptr::write_bytes(base.as_ptr(), PATTERN, STRIDE * COUNT) };

    let mut blobs = Vec::with_capacity(COUNT);
    for i in 0..COUNT {
        // SAFETY: offset i*STRIDE stays within the STRIDE*COUNT region
        // just allocated.
        let at = unsafe { NonNull::new_unchecked(base.as_ptr().add(i * STRIDE)) };
        blobs.push(umf::get_ipc_handle(at).unwrap());
    }

    let mut opened = Vec::with_capacity(COUNT);
    for blob in &blobs {
        let ptr = umf::open_ipc_handle(&consumer_pool, blob).unwrap();
        assert_eq!(unsafe { *ptr.as_ptr() }, PATTERN);
        opened.push(ptr);
    }

    for ptr in opened {
        umf::close_ipc_handle(ptr).unwrap();
    }
    for blob in &blobs {
        umf::put_ipc_handle(blob).unwrap();
    }
    producer_pool.free(base).unwrap();
}

/// Scenario 5: a provider whose IPC sub-vtable is absent; `NOT_SUPPORTED`
/// propagates unchanged and all resources are still released cleanly.
#[test]
fn scenario_5_not_supported_path_is_a_clean_skip() {
    let provider: Arc<dyn MemoryProvider> =
        Arc::new(FixedMemoryProvider::new(FixedProviderParams { size: 1 << 20 }).unwrap());
    let params = small_bucket_params(64, 4096, 4);
    let pool = pool_create(vec![provider], params, PoolCreateFlags::default()).unwrap();

    let ptr = pool.malloc(256).unwrap();
    let result = umf::get_ipc_handle(ptr);
    assert!(result.is_err());
    assert!(result.unwrap_err().is_not_supported());

    pool.free(ptr).unwrap();
}

/// A minimal heap-backed provider used only to verify ownership semantics
/// (no production provider registers a finalize counter).
struct CountingProvider {
    calls: Arc<AtomicUsize>,
    live: parking_lot::Mutex<Vec<(NonNull<u8>, std::alloc::Layout)>>,
}

unsafe impl Send for CountingProvider {}
unsafe impl Sync for CountingProvider {}

impl CountingProvider {
    fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            live: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl MemoryProvider for CountingProvider {
    fn get_name(&self) -> &str {
        "scenario-counting-provider"
    }

    fn alloc(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>> {
        let align = if alignment == 0 { 8 } else { alignment };
        let layout = std::alloc::Layout::from_size_align(size.max(1), align).unwrap();
        let raw = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(raw).unwrap();
        self.live.lock().push((ptr, layout));
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>, _size: usize) -> UmfResult<()> {
        let mut live = self.live.lock();
        let pos = live.iter().position(|(p, _)| *p == ptr).unwrap();
        let (p, layout) = live.remove(pos);
        unsafe { std::alloc::dealloc(p.as_ptr(), layout) };
        Ok(())
    }

    fn finalize(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scenario 6: a wrapping provider with `own_upstream = true` destroys
/// its device provider exactly once.
#[test]
fn scenario_6_wrapper_destroys_owned_upstream_exactly_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let device: Arc<dyn MemoryProvider> = Arc::new(CountingProvider::new(counter.clone()));
    let wrapper = WrappingProvider::new(UpstreamRef::Owned(device), None);

    let handle = provider_create(wrapper);
    provider_destroy(&handle);

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
