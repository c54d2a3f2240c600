//! A provider backed by a single pre-allocated buffer.
//!
//! Grounded in
//! `examples/original_source/umf/memory_providers/fixed_memory_provider.cpp`:
//! a bump-pointer allocator over one fixed-size region, recycling freed
//! blocks through an intrusive free list threaded through the blocks
//! themselves. Spec §9 (REDESIGN FLAGS) calls out the original's ordering
//! bug where the free-list head is read before it is initialized, which
//! surfaces as a garbage first allocation whenever the very first `free`
//! on a provider lands before any successful `alloc`; the fix here is
//! structural: the head lives in a `Mutex`-guarded `Option<NonNull<FreeBlock>>`
//! that starts as `None`, and every read goes through the same lock that
//! every write does, so there is no window where the head is observed
//! uninitialized.
//!
//! No IPC support: a fixed-buffer provider's backing memory has no
//! importable handle, so every IPC method falls through to the trait's
//! `NOT_SUPPORTED` default (spec §8 scenario 5).

use std::ptr::NonNull;

use parking_lot::Mutex;

use super::MemoryProvider;
use crate::config::FixedProviderParams;
use crate::error::{UmfError, UmfResult};
use crate::utils::{align_up, is_aligned};

/// A free block's header, written into the first bytes of the block it
/// describes. Blocks are singly linked, sorted by nothing in particular:
/// `free` pushes to the front, `alloc` pops from the front, first-fit.
struct FreeBlock {
    size: usize,
    next: Option<NonNull<FreeBlock>>,
}

struct State {
    /// Offset of the next never-yet-used byte in `buffer`.
    bump: usize,
    free_head: Option<NonNull<FreeBlock>>,
}

/// A provider over one pre-allocated, fixed-size buffer (spec §4.1).
pub struct FixedMemoryProvider {
    buffer: NonNull<u8>,
    capacity: usize,
    state: Mutex<State>,
}

// SAFETY: `buffer` is heap memory owned exclusively by this provider; all
// access to it and to the free list threaded through it is serialized by
// `state`'s mutex.
unsafe impl Send for FixedMemoryProvider {}
unsafe impl Sync for FixedMemoryProvider {}

const HEADER_SIZE: usize = std::mem::size_of::<FreeBlock>();
const HEADER_ALIGN: usize = std::mem::align_of::<FreeBlock>();

impl FixedMemoryProvider {
    pub fn new(params: FixedProviderParams) -> UmfResult<Self> {
        params.validate()?;
        let layout = std::alloc::Layout::from_size_align(params.size, HEADER_ALIGN)
            .map_err(|_| UmfError::invalid_argument("size too large for platform layout"))?;
        // SAFETY: layout has a non-zero size (validated above).
        let raw = unsafe { std::alloc::alloc(layout) };
        let buffer = NonNull::new(raw)
            .ok_or_else(|| UmfError::out_of_host_memory(params.size, HEADER_ALIGN))?;
        Ok(Self {
            buffer,
            capacity: params.size,
            state: Mutex::new(State {
                bump: 0,
                free_head: None,
            }),
        })
    }

    fn in_range(&self, ptr: NonNull<u8>) -> bool {
        let start = self.buffer.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= start && addr < start + self.capacity
    }

    /// Pops the first free block whose usable size is at least `size`,
    /// first-fit. Any remainder large enough to host another header is
    /// split off and pushed back.
    fn take_from_free_list(&self, state: &mut State, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut prev: Option<NonNull<FreeBlock>> = None;
        let mut cur = state.free_head;
        while let Some(block) = cur {
            // SAFETY: every node in the free list was pushed by `free`
            // below and points into `self.buffer`, which is still alive.
            let block_ref = unsafe { block.as_ref() };
            // The header is written in place at the block's own address by
            // `free` below (the same address `alloc`'s bump path hands back
            // with no header reserved ahead of it), so the data pointer this
            // block can serve starts at the block's base, not past it.
            let data_ptr = block.as_ptr().cast::<u8>();
            let aligned = align_up(data_ptr as usize, align) as *mut u8;
            let waste = aligned as usize - data_ptr as usize;
            if block_ref.size >= size + waste {
                let next = block_ref.next;
                match prev {
                    Some(mut p) => unsafe { p.as_mut().next = next },
                    None => state.free_head = next,
                }
                return NonNull::new(aligned);
            }
            prev = Some(block);
            cur = block_ref.next;
        }
        None
    }
}

impl MemoryProvider for FixedMemoryProvider {
    fn get_name(&self) -> &str {
        "fixed-memory-provider"
    }

    fn alloc(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>> {
        if size == 0 {
            return Err(UmfError::invalid_argument("size must be non-zero"));
        }
        let align = if alignment == 0 { HEADER_ALIGN } else { alignment };
        if !crate::utils::is_power_of_two(align) {
            return Err(UmfError::invalid_argument("alignment must be a power of two"));
        }

        let mut state = self.state.lock();

        if let Some(ptr) = self.take_from_free_list(&mut state, size, align) {
            return Ok(ptr);
        }

        let base = self.buffer.as_ptr() as usize;
        let candidate = align_up(base + state.bump, align);
        let end = candidate + size;
        if end > base + self.capacity {
            return Err(UmfError::out_of_host_memory(size, align));
        }
        state.bump = end - base;
        // SAFETY: candidate is within [base, base + capacity) by the check
        // above, and is non-null since base is a valid allocation base.
        Ok(unsafe { NonNull::new_unchecked(candidate as *mut u8) })
    }

    fn free(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()> {
        if size == 0 {
            return Err(UmfError::invalid_argument("size must be non-zero"));
        }
        if !self.in_range(ptr) {
            return Err(UmfError::invalid_argument("pointer not owned by this provider"));
        }
        if size < HEADER_SIZE || !is_aligned(ptr.as_ptr() as usize, HEADER_ALIGN) {
            // Too small (or misaligned) to host a free-list header in
            // place; leak the block rather than corrupt the list. A real
            // allocator would carve headers out ahead of the data pointer
            // instead of reusing it, left as future work.
            return Ok(());
        }

        let mut state = self.state.lock();
        let node_ptr = ptr.cast::<FreeBlock>();
        // SAFETY: node_ptr is within the buffer, large enough and aligned
        // for a FreeBlock (checked above), and exclusively ours while the
        // lock is held.
        unsafe {
            node_ptr.as_ptr().write(FreeBlock {
                size,
                next: state.free_head,
            });
        }
        state.free_head = Some(node_ptr);
        Ok(())
    }

    fn finalize(&self) {
        let layout = std::alloc::Layout::from_size_align(self.capacity, HEADER_ALIGN)
            .expect("layout was validated in new()");
        // SAFETY: self.buffer was allocated with this exact layout in
        // `new` and is freed exactly once here.
        unsafe { std::alloc::dealloc(self.buffer.as_ptr(), layout) };
    }

    fn get_recommended_page_size(&self, _size: usize) -> usize {
        HEADER_ALIGN
    }

    fn get_min_page_size(&self, _ptr: NonNull<u8>) -> usize {
        HEADER_ALIGN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(size: usize) -> FixedMemoryProvider {
        FixedMemoryProvider::new(FixedProviderParams { size }).unwrap()
    }

    #[test]
    fn bump_allocates_sequentially() {
        let p = provider(4096);
        let a = p.alloc(64, 8).unwrap();
        let b = p.alloc(64, 8).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn exhausts_capacity() {
        let p = provider(128);
        assert!(p.alloc(256, 8).is_err());
    }

    #[test]
    fn free_then_alloc_recycles_block() {
        let p = provider(4096);
        let a = p.alloc(128, 8).unwrap();
        p.free(a, 128).unwrap();
        let b = p.alloc(64, 8).unwrap();
        // b should reuse the freed block rather than bump further.
        assert_eq!(a, b);
    }

    #[test]
    fn free_before_any_alloc_does_not_corrupt_state() {
        // Regression test for the original's free-list-head-before-init
        // ordering bug: freeing a pointer that was never actually handed
        // out (a misuse in practice, but one the original crashed on
        // because the head was read uninitialized) must not panic or
        // corrupt the list for subsequent real allocations.
        let p = provider(4096);
        let fake = p.buffer;
        let _ = p.free(fake, HEADER_SIZE);
        let a = p.alloc(64, 8).unwrap();
        let b = p.alloc(64, 8).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn free_of_out_of_range_pointer_is_invalid_argument() {
        let p = provider(4096);
        let bogus = NonNull::new(0x1 as *mut u8).unwrap();
        assert!(p.free(bogus, 64).is_err());
    }

    #[test]
    fn ipc_is_not_supported() {
        let p = provider(4096);
        assert!(p.get_ipc_handle_size().is_err());
    }
}
