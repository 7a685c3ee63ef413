//! Host memory backend for Windows.
//!
//! Reservations use `MEM_RESERVE`; committing a range is a `MEM_COMMIT` of the
//! same pages, which hands back zero-filled memory.

use std::ffi::c_void;
use std::ptr::NonNull;

use windows::Win32::System::Memory::*;
use windows::Win32::System::SystemInformation::{
    GetSystemInfo, GlobalMemoryStatusEx, MEMORYSTATUSEX, SYSTEM_INFO,
};

use crate::backend::{align_to_page, HostMemory, Protection};
use crate::error::{Error, Result};
use crate::probe::HostCapacity;
use crate::debug_arena;

/// Backend built on `VirtualAlloc`/`VirtualFree`.
#[derive(Debug, Clone, Copy)]
pub struct VirtualAllocHost {
    page_size: usize,
}

impl VirtualAllocHost {
    /// Create a backend for the running host.
    pub fn new() -> Self {
        Self {
            page_size: page_size(),
        }
    }
}

impl Default for VirtualAllocHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Query the host page size, falling back to 4 KiB.
pub fn page_size() -> usize {
    let mut info = SYSTEM_INFO::default();
    unsafe { GetSystemInfo(&mut info) };
    if info.dwPageSize > 0 {
        info.dwPageSize as usize
    } else {
        crate::probe::DEFAULT_PAGE_SIZE
    }
}

/// Query the total physical memory of the host in bytes.
pub fn physical_memory() -> Option<u64> {
    let mut status = MEMORYSTATUSEX {
        dwLength: std::mem::size_of::<MEMORYSTATUSEX>() as u32,
        ..Default::default()
    };
    unsafe { GlobalMemoryStatusEx(&mut status) }.ok()?;
    (status.ullTotalPhys > 0).then_some(status.ullTotalPhys)
}

fn to_page_flags(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    let read = protection.contains(Protection::READ);
    let write = protection.contains(Protection::WRITE);
    let exec = protection.contains(Protection::EXECUTE);
    match (read || write, write, exec) {
        (_, true, true) => PAGE_EXECUTE_READWRITE,
        (_, true, false) => PAGE_READWRITE,
        (true, false, true) => PAGE_EXECUTE_READ,
        (true, false, false) => PAGE_READONLY,
        (false, false, true) => PAGE_EXECUTE,
        (false, false, false) => PAGE_NOACCESS,
    }
}

impl HostMemory for VirtualAllocHost {
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

        let ptr = unsafe { VirtualAlloc(None, size, MEM_RESERVE, PAGE_READWRITE) };
        NonNull::new(ptr as *mut u8).ok_or_else(|| Error::Host(std::io::Error::last_os_error()))
    }

    fn commit(&self, addr: NonNull<u8>, len: usize, protection: Protection) -> Result<Protection> {
        let target = Some(addr.as_ptr() as *const c_void);
        let ptr = unsafe { VirtualAlloc(target, len, MEM_COMMIT, to_page_flags(protection)) };
        if !ptr.is_null() {
            return Ok(protection);
        }
        let err = std::io::Error::last_os_error();
        if protection.contains(Protection::EXECUTE) {
            let fallback = protection - Protection::EXECUTE;
            let ptr = unsafe { VirtualAlloc(target, len, MEM_COMMIT, to_page_flags(fallback)) };
            if !ptr.is_null() {
                debug_arena!("VirtualAlloc({:p}, {:#x}): exec refused ({}), using {}", addr, len, err, fallback);
                return Ok(fallback);
            }
        }
        Err(Error::Host(err))
    }

    fn protect(&self, addr: NonNull<u8>, len: usize, protection: Protection) -> Result<Protection> {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        let target = addr.as_ptr() as *const c_void;
        if unsafe { VirtualProtect(target, len, to_page_flags(protection), &mut old) }.is_ok() {
            return Ok(protection);
        }
        if protection.contains(Protection::EXECUTE) {
            let fallback = protection - Protection::EXECUTE;
            unsafe { VirtualProtect(target, len, to_page_flags(fallback), &mut old) }
                .map_err(|e| Error::Host(std::io::Error::other(e)))?;
            return Ok(fallback);
        }
        Err(Error::Host(std::io::Error::last_os_error()))
    }

    fn release(&self, addr: NonNull<u8>, _len: usize) {
        unsafe {
            let _ = VirtualFree(addr.as_ptr() as *mut c_void, 0, MEM_RELEASE);
        }
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<(NonNull<u8>, Protection)> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }

        let mut applied = protection;
        let mut ptr = unsafe {
            VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, to_page_flags(protection))
        };
        if ptr.is_null() && protection.contains(Protection::EXECUTE) {
            applied = protection - Protection::EXECUTE;
            ptr = unsafe { VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, to_page_flags(applied)) };
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| Error::allocation_failed(size))?;
        Ok((ptr, applied))
    }

    fn deallocate(&self, addr: NonNull<u8>, _len: usize) {
        unsafe {
            let _ = VirtualFree(addr.as_ptr() as *mut c_void, 0, MEM_RELEASE);
        }
    }

    fn name(&self) -> &'static str {
        "virtualalloc"
    }
}
