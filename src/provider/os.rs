//! Host RAM provider.
//!
//! Grounded in the teacher's `platform/linux.rs` + `platform/windows.rs`
//! split (dispatch on `target_os` via `cfg_if`) and in
//! `examples/original_source/umf/memory_providers/ze_memory_provider.cpp`'s
//! shape of "one provider struct per backend, same vtable". Every
//! allocation is backed by a shareable mapping (`memfd_create`+`mmap` on
//! Linux, `shm_open`+`mmap` on macOS, `VirtualAlloc` with no IPC support on
//! Windows) so that IPC handles can be real file-descriptor transfers
//! rather than a fiction, letting `get_ipc_handle`/`open_ipc_handle`
//! round-trip real shared physical memory within a single test process.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use super::MemoryProvider;
use crate::config::OsProviderParams;
use crate::error::{UmfError, UmfResult};

const DEFAULT_PAGE_SIZE: usize = 4096;

/// One backing mapping: the fd it was created from (if any — anonymous,
/// non-shareable mappings have none) and its length.
struct Mapping {
    fd: Option<i32>,
    size: usize,
}

/// Host RAM provider (spec §4.1 "provider vtable", concrete backend).
pub struct OsMemoryProvider {
    params: OsProviderParams,
    mappings: Mutex<HashMap<usize, Mapping>>,
    last_error: Mutex<(String, i32)>,
}

// Unique suffix for POSIX shared-memory object names (macOS path only).
static SHM_NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

impl OsMemoryProvider {
    /// Constructs a new provider (spec's `initialize`).
    pub fn new(params: OsProviderParams) -> UmfResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            mappings: Mutex::new(HashMap::new()),
            last_error: Mutex::new((String::new(), 0)),
        })
    }

    fn record_native_error(&self, message: impl Into<String>, code: i32) {
        *self.last_error.lock() = (message.into(), code);
    }

    fn page_size(&self) -> usize {
        self.params.requested_alignment.unwrap_or_else(|| {
            #[cfg(unix)]
            {
                // SAFETY: sysconf with a valid name is always safe to call.
                let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                if n > 0 {
                    return n as usize;
                }
            }
            DEFAULT_PAGE_SIZE
        })
    }

    #[cfg(target_os = "linux")]
    fn create_shareable_fd(&self, size: usize) -> Option<i32> {
        let name = std::ffi::CString::new("umf-os-provider").ok()?;
        // SAFETY: memfd_create is a plain syscall; name is a valid, NUL
        // terminated C string.
        let fd = unsafe { libc::syscall(libc::SYS_memfd_create, name.as_ptr(), 0) } as i32;
        if fd < 0 {
            return None;
        }
        // SAFETY: fd was just created and is owned by us here.
        let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if rc != 0 {
            unsafe { libc::close(fd) };
            return None;
        }
        Some(fd)
    }

    #[cfg(target_os = "macos")]
    fn create_shareable_fd(&self, size: usize) -> Option<i32> {
        let id = SHM_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("/umf-os-provider-{}-{id}\0", std::process::id());
        // SAFETY: name is NUL terminated.
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr().cast(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        // Unlink immediately: the fd keeps the object alive for as long as
        // it (or a mapping derived from it) stays open, same pattern as an
        // anonymous memfd.
        unsafe { libc::shm_unlink(name.as_ptr().cast()) };
        if fd < 0 {
            return None;
        }
        // SAFETY: fd was just created and is owned by us here.
        let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if rc != 0 {
            unsafe { libc::close(fd) };
            return None;
        }
        Some(fd)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn create_shareable_fd(&self, _size: usize) -> Option<i32> {
        None
    }
}

#[cfg(unix)]
impl MemoryProvider for OsMemoryProvider {
    fn get_name(&self) -> &str {
        "os-memory-provider"
    }

    fn alloc(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>> {
        if size == 0 {
            return Err(UmfError::invalid_argument("size must be non-zero"));
        }
        let page = self.page_size();
        let mapped_size = crate::utils::align_up(size, page);
        let align = if alignment == 0 { page } else { alignment };
        if !crate::utils::is_power_of_two(align) {
            return Err(UmfError::invalid_argument("alignment must be a power of two"));
        }

        let fd = self.create_shareable_fd(mapped_size);
        let (addr, used_fd) = if let Some(fd) = fd {
            // SAFETY: fd is a valid, sized file descriptor we just created.
            let addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    mapped_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            (addr, Some(fd))
        } else {
            // SAFETY: standard anonymous private mapping request.
            let addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    mapped_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            (addr, None)
        };

        if addr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error();
            self.record_native_error(errno.to_string(), errno.raw_os_error().unwrap_or(-1));
            if let Some(fd) = used_fd {
                unsafe { libc::close(fd) };
            }
            return Err(UmfError::out_of_host_memory(size, align));
        }

        let ptr = NonNull::new(addr.cast::<u8>()).expect("mmap succeeded but returned null");
        self.mappings.lock().insert(
            ptr.as_ptr() as usize,
            Mapping {
                fd: used_fd,
                size: mapped_size,
            },
        );
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>, _size: usize) -> UmfResult<()> {
        let mapping = self
            .mappings
            .lock()
            .remove(&(ptr.as_ptr() as usize))
            .ok_or_else(|| UmfError::invalid_argument("unknown pointer"))?;
        // SAFETY: mapping.size is the exact length mmap returned for ptr.
        let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), mapping.size) };
        if let Some(fd) = mapping.fd {
            unsafe { libc::close(fd) };
        }
        if rc != 0 {
            let errno = std::io::Error::last_os_error();
            self.record_native_error(errno.to_string(), errno.raw_os_error().unwrap_or(-1));
            return Err(UmfError::provider_specific(
                self.get_name(),
                "munmap failed",
                errno.raw_os_error().unwrap_or(-1),
            ));
        }
        Ok(())
    }

    fn finalize(&self) {
        let mut mappings = self.mappings.lock();
        for (addr, mapping) in mappings.drain() {
            // SAFETY: addr/mapping.size came from a successful mmap that
            // has not yet been unmapped (we are draining the table once).
            unsafe { libc::munmap(addr as *mut libc::c_void, mapping.size) };
            if let Some(fd) = mapping.fd {
                unsafe { libc::close(fd) };
            }
        }
    }

    fn get_last_native_error(&self) -> (String, i32) {
        self.last_error.lock().clone()
    }

    fn get_recommended_page_size(&self, _size: usize) -> usize {
        self.page_size()
    }

    fn get_min_page_size(&self, _ptr: NonNull<u8>) -> usize {
        self.page_size()
    }

    fn purge_lazy(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()> {
        // SAFETY: caller guarantees ptr/size describe a live mapping.
        let rc = unsafe { libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_FREE) };
        if rc == 0 {
            Ok(())
        } else {
            Err(UmfError::provider_specific(self.get_name(), "madvise(MADV_FREE)", rc))
        }
    }

    fn purge_force(&self, ptr: NonNull<u8>, size: usize) -> UmfResult<()> {
        // SAFETY: caller guarantees ptr/size describe a live mapping.
        let rc = unsafe { libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED) };
        if rc == 0 {
            Ok(())
        } else {
            Err(UmfError::provider_specific(self.get_name(), "madvise(MADV_DONTNEED)", rc))
        }
    }

    fn get_ipc_handle_size(&self) -> UmfResult<usize> {
        Ok(std::mem::size_of::<i32>())
    }

    fn get_ipc_handle(&self, ptr: NonNull<u8>, _size: usize, out: &mut [u8]) -> UmfResult<()> {
        let fd = self
            .mappings
            .lock()
            .get(&(ptr.as_ptr() as usize))
            .and_then(|m| m.fd)
            .ok_or_else(|| UmfError::not_supported("ipc (mapping has no backing fd)"))?;
        // SAFETY: fd is open and owned by this provider.
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(UmfError::provider_specific(self.get_name(), "dup failed", -1));
        }
        if out.len() < 4 {
            unsafe { libc::close(dup_fd) };
            return Err(UmfError::invalid_argument("output blob too small"));
        }
        out[0..4].copy_from_slice(&dup_fd.to_le_bytes());
        Ok(())
    }

    fn put_ipc_handle(&self, blob: &[u8]) -> UmfResult<()> {
        let fd = parse_fd(blob)?;
        // SAFETY: fd was produced by get_ipc_handle's dup and is still open.
        unsafe { libc::close(fd) };
        Ok(())
    }

    fn open_ipc_handle(&self, blob: &[u8]) -> UmfResult<NonNull<u8>> {
        let fd = parse_fd(blob)?;
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is a valid, open file descriptor.
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            unsafe { libc::close(fd) };
            return Err(UmfError::invalid_argument("fstat on ipc fd failed"));
        }
        let size = stat.st_size as usize;
        // SAFETY: fd is valid and sized; mapping it MAP_SHARED is safe.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // The mapping now holds its own reference to the backing object;
        // our local fd copy can be closed.
        unsafe { libc::close(fd) };
        if addr == libc::MAP_FAILED {
            return Err(UmfError::provider_specific(self.get_name(), "mmap failed", -1));
        }
        let ptr = NonNull::new(addr.cast::<u8>()).expect("mmap succeeded but returned null");
        self.mappings
            .lock()
            .insert(ptr.as_ptr() as usize, Mapping { fd: None, size });
        Ok(ptr)
    }

    fn close_ipc_handle(&self, ptr: NonNull<u8>, _size: usize) -> UmfResult<()> {
        let mapping = self
            .mappings
            .lock()
            .remove(&(ptr.as_ptr() as usize))
            .ok_or_else(|| UmfError::invalid_argument("unknown ipc mapping"))?;
        // SAFETY: mapping.size is the length mmap returned for ptr.
        unsafe { libc::munmap(ptr.as_ptr().cast(), mapping.size) };
        Ok(())
    }
}

#[cfg(unix)]
fn parse_fd(blob: &[u8]) -> UmfResult<i32> {
    let bytes: [u8; 4] = blob
        .get(0..4)
        .ok_or_else(|| UmfError::invalid_argument("ipc blob too short"))?
        .try_into()
        .unwrap();
    Ok(i32::from_le_bytes(bytes))
}

#[cfg(windows)]
impl MemoryProvider for OsMemoryProvider {
    fn get_name(&self) -> &str {
        "os-memory-provider"
    }

    fn alloc(&self, size: usize, alignment: usize) -> UmfResult<NonNull<u8>> {
        let _ = alignment;
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
        if size == 0 {
            return Err(UmfError::invalid_argument("size must be non-zero"));
        }
        // SAFETY: standard VirtualAlloc request for a fresh region.
        let addr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| UmfError::out_of_host_memory(size, alignment.max(1)))?;
        self.mappings
            .lock()
            .insert(ptr.as_ptr() as usize, Mapping { fd: None, size });
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>, _size: usize) -> UmfResult<()> {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;
        self.mappings
            .lock()
            .remove(&(ptr.as_ptr() as usize))
            .ok_or_else(|| UmfError::invalid_argument("unknown pointer"))?;
        // SAFETY: ptr was returned by a prior VirtualAlloc and is released
        // in full (size 0 + MEM_RELEASE).
        unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) };
        Ok(())
    }

    fn finalize(&self) {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;
        let mut mappings = self.mappings.lock();
        for (addr, _mapping) in mappings.drain() {
            unsafe { VirtualFree(addr as *mut _, 0, MEM_RELEASE) };
        }
    }

    fn get_last_native_error(&self) -> (String, i32) {
        self.last_error.lock().clone()
    }
    // IPC is not implemented for the Windows path: a faithful port would
    // wrap CreateFileMapping/DuplicateHandle, which is out of scope here
    // (spec's device-specific backends are non-goals, and a host-memory
    // IPC bridge on Windows would need the same treatment).
}
