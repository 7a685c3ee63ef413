//! Host memory backend for Unix-like systems (Linux, macOS, BSD).
//!
//! Reservations are `PROT_NONE` anonymous mappings; committing a range is an
//! `mprotect` to the requested protection, after which the kernel backs the
//! pages with zero-filled memory on first touch.

use std::ptr::{self, NonNull};

use crate::backend::{align_to_page, HostMemory, Protection};
use crate::error::{Error, Result};
use crate::probe::HostCapacity;
use crate::debug_arena;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

/// Backend built on `mmap`/`mprotect`/`munmap`.
#[derive(Debug, Clone, Copy)]
pub struct MmapHost {
    page_size: usize,
}

impl MmapHost {
    /// Create a backend for the running host.
    pub fn new() -> Self {
        Self {
            page_size: page_size(),
        }
    }
}

impl Default for MmapHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Query the host page size, falling back to 4 KiB.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        crate::probe::DEFAULT_PAGE_SIZE
    }
}

/// Query the total physical memory of the host in bytes.
#[cfg(target_os = "macos")]
pub fn physical_memory() -> Option<u64> {
    let mut total: u64 = 0;
    let mut len = std::mem::size_of::<u64>();
    let ret = unsafe {
        libc::sysctlbyname(
            c"hw.memsize".as_ptr(),
            &mut total as *mut u64 as *mut libc::c_void,
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    (ret == 0 && total > 0).then_some(total)
}

/// Query the total physical memory of the host in bytes.
#[cfg(not(target_os = "macos"))]
pub fn physical_memory() -> Option<u64> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if pages <= 0 {
        return None;
    }
    Some(pages as u64 * page_size() as u64)
}

fn to_prot(protection: Protection) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if protection.contains(Protection::READ) {
        prot |= libc::PROT_READ;
    }
    if protection.contains(Protection::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if protection.contains(Protection::EXECUTE) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// `mprotect`, retrying without execute permission when the host refuses it.
unsafe fn protect(addr: *mut libc::c_void, len: usize, protection: Protection) -> Result<Protection> {
    if unsafe { libc::mprotect(addr, len, to_prot(protection)) } == 0 {
        return Ok(protection);
    }
    let err = std::io::Error::last_os_error();
    if protection.contains(Protection::EXECUTE) {
        let fallback = protection - Protection::EXECUTE;
        if unsafe { libc::mprotect(addr, len, to_prot(fallback)) } == 0 {
            debug_arena!("mprotect({:p}, {:#x}): exec refused ({}), using {}", addr, len, err, fallback);
            return Ok(fallback);
        }
    }
    Err(Error::Host(err))
}

impl HostMemory for MmapHost {
    fn capacity(&self) -> HostCapacity {
        HostCapacity {
            page_size: self.page_size,
            total_physical: physical_memory().unwrap_or(crate::probe::DEFAULT_PHYSICAL_MEMORY),
        }
    }

    fn reserve(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }
        let size = align_to_page(size, self.page_size);

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                RESERVE_FLAGS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::Host(std::io::Error::last_os_error()));
        }

        NonNull::new(ptr as *mut u8).ok_or_else(|| Error::allocation_failed(size))
    }

    fn commit(&self, addr: NonNull<u8>, len: usize, protection: Protection) -> Result<Protection> {
        unsafe { protect(addr.as_ptr() as *mut libc::c_void, len, protection) }
    }

    fn release(&self, addr: NonNull<u8>, len: usize) {
        unsafe {
            libc::munmap(addr.as_ptr() as *mut libc::c_void, align_to_page(len, self.page_size));
        }
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<(NonNull<u8>, Protection)> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }
        let aligned_size = align_to_page(size, self.page_size);

        // Allocate page-aligned, zero-filled memory
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::allocation_failed(size));
        }

        let applied = if protection == Protection::READ_WRITE {
            protection
        } else {
            match unsafe { protect(ptr, aligned_size, protection) } {
                Ok(applied) => applied,
                Err(e) => {
                    unsafe { libc::munmap(ptr, aligned_size) };
                    return Err(e);
                }
            }
        };

        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| Error::allocation_failed(size))?;
        Ok((ptr, applied))
    }

    fn deallocate(&self, addr: NonNull<u8>, len: usize) {
        unsafe {
            libc::munmap(addr.as_ptr() as *mut libc::c_void, align_to_page(len, self.page_size));
        }
    }

    fn name(&self) -> &'static str {
        "mmap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn test_physical_memory_reported() {
        assert!(physical_memory().unwrap_or(0) > 0);
    }

    #[test]
    fn test_reserve_commit_release() {
        let host = MmapHost::new();
        let size = 64 * host.page_size;
        let base = host.reserve(size).unwrap();

        let applied = host.commit(base, host.page_size, Protection::READ_WRITE).unwrap();
        assert_eq!(applied, Protection::READ_WRITE);

        unsafe {
            base.as_ptr().write(42);
            assert_eq!(base.as_ptr().read(), 42);
        }

        host.release(base, size);
    }

    #[test]
    fn test_reserve_zero_rejected() {
        let host = MmapHost::new();
        assert!(matches!(host.reserve(0), Err(Error::InvalidSize(0))));
    }

    #[test]
    fn test_allocate_zeroed() {
        let host = MmapHost::new();
        let (ptr, applied) = host.allocate(5000, Protection::READ_WRITE).unwrap();
        assert_eq!(applied, Protection::READ_WRITE);

        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 5000) };
        assert!(bytes.iter().all(|&b| b == 0));

        host.deallocate(ptr, 5000);
    }
}
