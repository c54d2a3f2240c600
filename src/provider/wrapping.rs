//! The upstream-wrapping provider pattern (spec §4.2): a provider that
//! forwards `alloc`/`free` to another provider it holds (owned or
//! borrowed) while rewriting the IPC blob on the way in or out.
//!
//! Grounded in
//! `examples/original_source/umf/memory_providers/provider_ipc_level_zero_getpidfd.c`:
//! the original wraps a device provider to translate an IPC handle that
//! embeds a raw file descriptor, valid only within the exporting process,
//! into one valid in the importing process via `pidfd_getfd`. [`PidFdTranslator`]
//! reimplements that translation for this crate's fd-based
//! [`super::os::OsMemoryProvider`] handles; other upstreams would supply a
//! different [`IpcHandleTranslator`].

use std::ptr::NonNull;
use std::sync::Arc;

use super::MemoryProvider;
use crate::error::{UmfError, UmfResult};

/// Either an owned upstream provider (this wrapper calls `finalize` on it
/// when the wrapper itself is finalized) or a borrowed, shared one (the
/// caller retains ownership).
pub enum UpstreamRef {
    Owned(Arc<dyn MemoryProvider>),
    Shared(Arc<dyn MemoryProvider>),
}

impl UpstreamRef {
    fn provider(&self) -> &Arc<dyn MemoryProvider> {
        match self {
            Self::Owned(p) | Self::Shared(p) => p,
        }
    }
}

/// Rewrites an IPC blob produced by one process's provider into one usable
/// by another process's provider of the same kind (spec §4.2).
pub trait IpcHandleTranslator: Send + Sync {
    /// Translates a blob captured by `get_ipc_handle` in the exporting
    /// process into one this process's `open_ipc_handle` can consume.
    fn translate_for_import(&self, blob: &[u8]) -> UmfResult<Vec<u8>>;
}

/// A provider that wraps an upstream provider, translating IPC handles
/// through a [`IpcHandleTranslator`] and forwarding everything else.
pub struct WrappingProvider {
    upstream: UpstreamRef,
    translator: Option<Box<dyn IpcHandleTranslator>>,
}

impl WrappingProvider {
    pub fn new(upstream: UpstreamRef, translator: Option<Box<dyn IpcHandleTranslator>>) -> Self {
        Self {
            upstream,
            translator,
        }
    }
}

impl MemoryProvider for WrappingProvider {
    fn get_name(&self) -> &str {
        self.upstream.provider().get_name()
    }

    fn alloc(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>> {
        self.upstream.provider().alloc(size, alignment)
    }

    fn free(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()> {
        self.upstream.provider().free(ptr, size)
    }

    fn finalize(&self) {
        if let UpstreamRef::Owned(p) = &self.upstream {
            p.finalize();
        }
    }

    fn get_last_native_error(&self) -> (String, i32) {
        self.upstream.provider().get_last_native_error()
    }

    fn get_recommended_page_size(&self, size: usize) -> usize {
        self.upstream.provider().get_recommended_page_size(size)
    }

    fn get_min_page_size(&self, ptr: NonNull<u8>) -> usize {
        self.upstream.provider().get_min_page_size(ptr)
    }

    fn purge_lazy(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()> {
        self.upstream.provider().purge_lazy(ptr, size)
    }

    fn purge_force(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()> {
        self.upstream.provider().purge_force(ptr, size)
    }

    fn allocation_split(&self, ptr: NonNull<u8>, total: usize, first: usize) -> UmfResult<()> {
        self.upstream.provider().allocation_split(ptr, total, first)
    }

    fn allocation_merge(&self, low: NonNull<u8>, high: NonNull<u8>, total: usize) -> UmfResult<()> {
        self.upstream.provider().allocation_merge(low, high, total)
    }

    fn get_ipc_handle_size(&self) -> UmfResult<usize> {
        self.upstream.provider().get_ipc_handle_size()
    }

    fn get_ipc_handle(&self, ptr: NonNull<u8>, size: usize, out: &mut [u8]) -> UmfResult<()> {
        self.upstream.provider().get_ipc_handle(ptr, size, out)
    }

    fn put_ipc_handle(&self, blob: &[u8]) -> UmfResult<()> {
        self.upstream.provider().put_ipc_handle(blob)
    }

    fn open_ipc_handle(&self, blob: &[u8]) -> UmfResult<NonNull<u8>> {
        match &self.translator {
            Some(translator) => {
                let translated = translator.translate_for_import(blob)?;
                self.upstream.provider().open_ipc_handle(&translated)
            }
            None => self.upstream.provider().open_ipc_handle(blob),
        }
    }

    fn close_ipc_handle(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()> {
        self.upstream.provider().close_ipc_handle(ptr, size)
    }
}

/// Translates a raw-fd IPC blob between processes using Linux's
/// `pidfd_open`/`pidfd_getfd` pair: given the exporting process's pid and
/// the fd number it sent, duplicate that fd into the calling process.
///
/// Requires the `pidfd` feature (both syscalls are Linux-only and
/// unavailable before kernel 5.6).
#[cfg(all(target_os = "linux", feature = "pidfd"))]
pub struct PidFdTranslator {
    pub exporter_pid: u32,
}

#[cfg(all(target_os = "linux", feature = "pidfd"))]
impl IpcHandleTranslator for PidFdTranslator {
    fn translate_for_import(&self, blob: &[u8]) -> UmfResult<Vec<u8>> {
        let remote_fd = blob
            .get(0..4)
            .and_then(|b| b.try_into().ok())
            .map(i32::from_le_bytes)
            .ok_or_else(|| UmfError::invalid_argument("ipc blob too short for a raw fd"))?;

        // SAFETY: pidfd_open/pidfd_getfd are plain syscalls; no pointers
        // are passed besides the flags argument, which is always 0 here.
        let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, self.exporter_pid, 0) };
        if pidfd < 0 {
            return Err(UmfError::provider_specific(
                "pidfd-translator",
                "pidfd_open failed",
                std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
            ));
        }
        let local_fd = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd, remote_fd, 0) };
        unsafe { libc::close(pidfd as i32) };
        if local_fd < 0 {
            return Err(UmfError::provider_specific(
                "pidfd-translator",
                "pidfd_getfd failed",
                std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
            ));
        }
        Ok((local_fd as i32).to_le_bytes().to_vec())
    }
}

/// Convenience constructor for the one concrete wrapping-provider example
/// this crate ships: a [`WrappingProvider`] paired with a
/// [`PidFdTranslator`], standing in for the device-backed wrapping
/// providers the original implements (L0/CUDA are out of scope here, per
/// spec's Non-goals).
#[cfg(all(target_os = "linux", feature = "pidfd"))]
pub fn pidfd_ipc_provider(upstream: UpstreamRef, exporter_pid: u32) -> WrappingProvider {
    WrappingProvider::new(upstream, Some(Box::new(PidFdTranslator { exporter_pid })))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::super::mock::CountingMockProvider;
    use super::*;

    #[test]
    fn owned_upstream_is_finalized_exactly_once() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let upstream: Arc<dyn MemoryProvider> =
            Arc::new(CountingMockProvider::new(counter.clone()));
        let wrapper = WrappingProvider::new(UpstreamRef::Owned(upstream), None);
        wrapper.finalize();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shared_upstream_is_not_finalized_by_wrapper() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let upstream: Arc<dyn MemoryProvider> =
            Arc::new(CountingMockProvider::new(counter.clone()));
        let wrapper = WrappingProvider::new(UpstreamRef::Shared(upstream.clone()), None);
        wrapper.finalize();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        upstream.finalize();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn alloc_and_free_forward_to_upstream() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let upstream: Arc<dyn MemoryProvider> = Arc::new(CountingMockProvider::new(counter));
        let wrapper = WrappingProvider::new(UpstreamRef::Shared(upstream), None);
        let ptr = wrapper.alloc(64, 8).unwrap();
        wrapper.free(ptr, 64).unwrap();
    }
}
