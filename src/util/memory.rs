//! The OS memory seam: anonymous mappings, unmapping, and returning page
//! ranges to the OS via `madvise`.
//!
//! Calls that can fail return `std::io::Result` carrying the OS errno.

use std::io::Result;

use crate::util::address::Address;
use crate::util::conversions;
use crate::util::options::{MadviseMode, OPTIONS};

lazy_static! {
    static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
    static ref PAGE_SIZE_LOG: usize = conversions::log2(*PAGE_SIZE);
}

/// The OS page size, queried once per process. Always a power of two.
pub fn page_size_cached() -> usize {
    *PAGE_SIZE
}

/// log2 of [`page_size_cached`].
pub fn page_size_log_cached() -> usize {
    *PAGE_SIZE_LOG
}

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

/// Set a range of memory to the given value. Similar to memset.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes::<u8>(start.to_mut_ptr(), val, len);
    }
}

/// Map an anonymous, private, read-write range of `size` bytes. The kernel
/// hands the range back zero-filled. On Linux the mapping is labeled with
/// `name` so it can be told apart in `/proc/self/maps`.
pub fn map_anon(size: usize, name: &str) -> Result<Address> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    let start = Address::from_mut_ptr(ptr);
    set_vma_name(start, size, name);
    Ok(start)
}

/// Unmap a range previously obtained from [`map_anon`].
pub fn unmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Tell the OS that the pages in `[start, start + size)` hold no data worth
/// keeping. With `MADV_DONTNEED` the pages are dropped immediately and the
/// next touch faults in a zero page; with `MADV_FREE` the kernel reclaims
/// them lazily under memory pressure. Both bounds must be page aligned.
pub fn release_pages(start: Address, size: usize) -> Result<()> {
    debug_assert!(start.is_aligned_to(page_size_cached()));
    debug_assert!(conversions::raw_is_aligned(size, page_size_cached()));
    let advice = match OPTIONS.madvise_mode {
        MadviseMode::DontNeed => libc::MADV_DONTNEED,
        MadviseMode::Free => libc::MADV_FREE,
    };
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, advice) },
        0,
    )
}

// `PR_SET_VMA_ANON_NAME` is only honored on Linux 5.17+; older kernels
// return `EINVAL`. The name is purely a debugging aid either way, so
// failures are logged, not surfaced.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_vma_name(start: Address, size: usize, name: &str) {
    let anno_cstr = match std::ffi::CString::new(name) {
        Ok(s) => s,
        Err(_) => return,
    };
    let result = wrap_libc_call(
        &|| unsafe {
            libc::prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME,
                start.to_ptr::<libc::c_void>(),
                size,
                anno_cstr.as_ptr(),
            )
        },
        0,
    );
    if let Err(e) = result {
        debug!("Error while calling prctl: {}", e);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_vma_name(_start: Address, _size: usize, _name: &str) {}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
