//! Host virtual-memory backend abstraction.
//!
//! This module defines the capability trait that every platform backend must
//! implement (reserve address space, commit pages with a protection, release,
//! and standalone allocations), and provides the logic to select the backend
//! for the current platform.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::Result;
use crate::probe::HostCapacity;

// Platform-specific backend modules
#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod win32;

bitflags! {
    /// Page protection applied to committed guest memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ    = 1;
        const WRITE   = 2;
        const EXECUTE = 4;

        const READ_WRITE         = Self::READ.bits() | Self::WRITE.bits();
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Self::READ) { 'r' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'w' } else { '-' };
        let x = if self.contains(Self::EXECUTE) { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

/// Trait that all host memory backends must implement.
///
/// The arena manager and the segment registry only ever talk to the host
/// through this interface, so tests can wrap the native backend to inject
/// failures.
pub trait HostMemory: Send + Sync {
    /// Page size and physical memory of the host.
    fn capacity(&self) -> HostCapacity;

    /// Reserve `size` bytes of contiguous address space without backing it.
    fn reserve(&self, size: usize) -> Result<NonNull<u8>>;

    /// Back `[addr, addr + len)` of a reservation with accessible pages.
    ///
    /// Returns the protection that was actually applied; hosts that refuse
    /// executable pages fall back to read/write.
    fn commit(&self, addr: NonNull<u8>, len: usize, protection: Protection) -> Result<Protection>;

    /// Change the protection of already committed pages.
    fn protect(&self, addr: NonNull<u8>, len: usize, protection: Protection) -> Result<Protection> {
        self.commit(addr, len, protection)
    }

    /// Release a whole reservation made by [`HostMemory::reserve`].
    fn release(&self, addr: NonNull<u8>, len: usize);

    /// Allocate a standalone, zero-initialized block outside any reservation.
    fn allocate(&self, size: usize, protection: Protection) -> Result<(NonNull<u8>, Protection)>;

    /// Free a block returned by [`HostMemory::allocate`].
    fn deallocate(&self, addr: NonNull<u8>, len: usize);

    /// Get the backend name (e.g., "mmap", "virtualalloc").
    fn name(&self) -> &'static str;
}

/// Create the backend for the current platform.
pub fn native() -> Arc<dyn HostMemory> {
    #[cfg(unix)]
    {
        Arc::new(unix::MmapHost::new())
    }

    #[cfg(windows)]
    {
        Arc::new(win32::VirtualAllocHost::new())
    }
}

/// Get the name of the backend for this platform.
pub fn name() -> &'static str {
    #[cfg(unix)]
    {
        "mmap"
    }

    #[cfg(windows)]
    {
        "virtualalloc"
    }
}

/// Round `size` up to a multiple of `page_size` (a power of two).
#[inline]
pub const fn align_to_page(size: usize, page_size: usize) -> usize {
    (size + page_size - 1) & !(page_size - 1)
}

/// An address-space reservation, released when dropped.
pub struct Reservation {
    host: Arc<dyn HostMemory>,
    base: NonNull<u8>,
    len: usize,
}

// Safety: the reservation only hands out raw addresses; access to the pages is
// coordinated by the owners of the segments carved from it.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    /// Reserve `len` bytes through `host`.
    pub fn new(host: &Arc<dyn HostMemory>, len: usize) -> Result<Self> {
        let base = host.reserve(len)?;
        Ok(Self {
            host: Arc::clone(host),
            base,
            len,
        })
    }

    /// First byte of the reservation.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Base address as an integer.
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.start() + self.len
    }

    /// Size of the reservation in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if an address falls within this reservation.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Check if `[addr, addr + len)` lies entirely within this reservation.
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(range_end) => addr >= self.start() && range_end <= self.end(),
            None => false,
        }
    }

    /// Commit the pages covering `[addr, addr + len)`.
    pub fn commit(&self, addr: usize, len: usize, protection: Protection) -> Result<Protection> {
        let (ptr, len) = self.page_span(addr, len);
        self.host.commit(ptr, len, protection)
    }

    /// Re-protect the committed pages covering `[addr, addr + len)`.
    pub fn protect(&self, addr: usize, len: usize, protection: Protection) -> Result<Protection> {
        let (ptr, len) = self.page_span(addr, len);
        self.host.protect(ptr, len, protection)
    }

    fn page_span(&self, addr: usize, len: usize) -> (NonNull<u8>, usize) {
        let page_size = self.host.capacity().page_size;
        let first = (addr & !(page_size - 1)).max(self.start());
        let last = align_to_page(addr + len, page_size).min(self.end());
        // first is clamped into a non-null reservation
        let ptr = NonNull::new(first as *mut u8).unwrap_or(self.base);
        (ptr, last.saturating_sub(first))
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("host", &self.host.name())
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.host.release(self.base, self.len);
    }
}

/// A standalone host block owned by one segment, freed when dropped.
pub struct HostBlock {
    host: Arc<dyn HostMemory>,
    ptr: NonNull<u8>,
    len: usize,
    protection: Protection,
}

// Safety: HostBlock owns its allocation and can be sent between threads
unsafe impl Send for HostBlock {}
unsafe impl Sync for HostBlock {}

impl HostBlock {
    /// Allocate a zeroed block of at least `len` bytes.
    pub fn new(host: &Arc<dyn HostMemory>, len: usize, protection: Protection) -> Result<Self> {
        let (ptr, protection) = host.allocate(len, protection)?;
        Ok(Self {
            host: Arc::clone(host),
            ptr,
            len,
            protection,
        })
    }

    /// Get a raw pointer to the block.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Get the size of the block in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Protection the host actually applied.
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Change the protection of the whole block.
    pub fn protect(&mut self, protection: Protection) -> Result<Protection> {
        self.protection = self.host.protect(self.ptr, self.len, protection)?;
        Ok(self.protection)
    }
}

impl fmt::Debug for HostBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBlock")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("protection", &self.protection)
            .finish()
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        self.host.deallocate(self.ptr, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        assert_eq!(align_to_page(1, 4096), 4096);
        assert_eq!(align_to_page(4096, 4096), 4096);
        assert_eq!(align_to_page(4097, 4096), 8192);
        assert_eq!(align_to_page(0, 4096), 0);
    }

    #[test]
    fn test_protection_display() {
        assert_eq!(Protection::READ_WRITE.to_string(), "rw-");
        assert_eq!(Protection::READ_WRITE_EXECUTE.to_string(), "rwx");
        assert_eq!(Protection::READ.to_string(), "r--");
    }

    #[test]
    fn test_reservation_bounds() {
        let host = native();
        let page = host.capacity().page_size;
        let res = Reservation::new(&host, 16 * page).unwrap();
        assert_eq!(res.end() - res.start(), 16 * page);
        assert!(res.contains(res.start()));
        assert!(!res.contains(res.end()));
        assert!(res.contains_range(res.start() + page, 15 * page));
        assert!(!res.contains_range(res.start() + page, 16 * page));
        assert!(!res.contains_range(usize::MAX - 1, 8));
    }

    #[test]
    fn test_reservation_commit_and_write() {
        let host = native();
        let page = host.capacity().page_size;
        let res = Reservation::new(&host, 8 * page).unwrap();
        let addr = res.start() + 2 * page + 100;
        let applied = res.commit(addr, 64, Protection::READ_WRITE).unwrap();
        assert!(applied.contains(Protection::READ_WRITE));

        unsafe {
            let p = addr as *mut u8;
            assert_eq!(p.read(), 0);
            p.write(0xA5);
            assert_eq!(p.read(), 0xA5);
        }
    }

    #[test]
    fn test_host_block_zeroed() {
        let host = native();
        let block = HostBlock::new(&host, 10_000, Protection::READ_WRITE).unwrap();
        assert_eq!(block.len(), 10_000);
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr().as_ptr(), block.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
