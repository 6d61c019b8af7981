//! Executable-memory management.
//!
//! A three-operation abstraction over the host's virtual-memory APIs plus an
//! owning wrapper that runs the full W^X lifecycle: allocate a writable
//! region, copy code in, re-protect as read+execute, and release on drop.
//! A region is never writable and executable at the same time from the
//! perspective of the calling thread.

use thiserror::Error;

/// Failures from the host memory APIs.
#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    /// The host refused to allocate a page-backed region.
    #[error("executable page allocation failed: {0}")]
    AllocationFailed(String),

    /// The transition to read+execute failed.
    #[error("page protection change failed: {0}")]
    ProtectionFailed(String),

    /// Nothing to install.
    #[error("cannot install an empty code buffer")]
    EmptyCode,
}

/// An owned executable mapping. Dropping the region unmaps it.
#[derive(Debug)]
pub struct ExecutableRegion {
    ptr: *mut u8,
    len: usize,
}

impl ExecutableRegion {
    /// Run the full W^X lifecycle over `code`: allocate writable, copy,
    /// commit as read+execute (with instruction-cache maintenance where the
    /// architecture needs it).
    ///
    /// On a commit failure the region is released before the error returns,
    /// so no half-initialized mapping ever escapes.
    pub fn install(code: &[u8]) -> Result<Self, MemoryError> {
        if code.is_empty() {
            return Err(MemoryError::EmptyCode);
        }
        let ptr = allocate_writable(code.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }
        if let Err(e) = commit_executable(ptr, code.len()) {
            release(ptr, code.len());
            return Err(e);
        }
        Ok(Self {
            ptr,
            len: code.len(),
        })
    }

    /// Base address of the executable mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Length of the installed code in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        release(self.ptr, self.len);
    }
}

/// Allocate a page-aligned region of at least `len` bytes, readable and
/// writable, not executable from this thread's perspective.
#[cfg(all(unix, not(target_os = "macos")))]
pub fn allocate_writable(len: usize) -> Result<*mut u8, MemoryError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(ptr as *mut u8)
}

/// On Apple hosts the mapping must carry the JIT affordance from the start;
/// writability is then controlled per thread via the JIT write-protection
/// toggle rather than `mprotect`.
#[cfg(target_os = "macos")]
pub fn allocate_writable(len: usize) -> Result<*mut u8, MemoryError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    unsafe {
        if pthread_jit_write_protect_supported_np() != 0 {
            pthread_jit_write_protect_np(0);
        }
    }
    Ok(ptr as *mut u8)
}

#[cfg(windows)]
pub fn allocate_writable(len: usize) -> Result<*mut u8, MemoryError> {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    if ptr.is_null() {
        return Err(MemoryError::AllocationFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(ptr as *mut u8)
}

#[cfg(not(any(unix, windows)))]
pub fn allocate_writable(_len: usize) -> Result<*mut u8, MemoryError> {
    Err(MemoryError::AllocationFailed(
        "executable memory is not supported on this platform".to_string(),
    ))
}

/// Transition `[ptr, ptr+len)` to read+execute, removing write access.
///
/// Architectures with split instruction caches (AArch64) get their i-cache
/// invalidated over the range before the protection change, so the first
/// call into the region observes the bytes just written. Idempotent for a
/// region that is already executable.
#[cfg(all(unix, not(target_os = "macos")))]
pub fn commit_executable(ptr: *mut u8, len: usize) -> Result<(), MemoryError> {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        __clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
    }
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(MemoryError::ProtectionFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
pub fn commit_executable(ptr: *mut u8, len: usize) -> Result<(), MemoryError> {
    unsafe {
        sys_icache_invalidate(ptr as *mut libc::c_void, len);
        if pthread_jit_write_protect_supported_np() != 0 {
            pthread_jit_write_protect_np(1);
        }
    }
    Ok(())
}

#[cfg(windows)]
pub fn commit_executable(ptr: *mut u8, len: usize) -> Result<(), MemoryError> {
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READ};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    let mut old = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *const _, len, PAGE_EXECUTE_READ, &mut old) };
    if ok == 0 {
        return Err(MemoryError::ProtectionFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), ptr as *const _, len);
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub fn commit_executable(_ptr: *mut u8, _len: usize) -> Result<(), MemoryError> {
    Err(MemoryError::ProtectionFailed(
        "executable memory is not supported on this platform".to_string(),
    ))
}

/// Release a region. No-op on a null base.
#[cfg(unix)]
pub fn release(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        libc::munmap(ptr as *mut _, len);
    }
}

#[cfg(windows)]
pub fn release(ptr: *mut u8, _len: usize) {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

    if ptr.is_null() {
        return;
    }
    unsafe {
        VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
    }
}

#[cfg(not(any(unix, windows)))]
pub fn release(_ptr: *mut u8, _len: usize) {}

#[cfg(target_os = "macos")]
extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}
