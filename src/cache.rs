//! Executable blocks for translated guest code.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::warn;

use crate::backend::{align_to_page, HostBlock, HostMemory, Protection};
use crate::debug_segment;
use crate::error::Result;

/// A page-aligned, zeroed block the code translator writes into and jumps
/// to. Freed when dropped.
pub struct CodeCache {
    block: HostBlock,
}

impl CodeCache {
    /// Allocate a cache of at least `size` bytes, never less than a page.
    ///
    /// Read/write/execute is requested. A host that refuses executable pages
    /// still hands out a read/write block; check [`CodeCache::is_executable`].
    pub fn new(host: &Arc<dyn HostMemory>, size: usize) -> Result<Self> {
        let page = host.capacity().page_size;
        let len = align_to_page(size.max(page), page);
        let block = HostBlock::new(host, len, Protection::READ_WRITE_EXECUTE)?;
        if !block.protection().contains(Protection::EXECUTE) {
            warn!("code cache of {} bytes is not executable ({})", len, block.protection());
        }
        debug_segment!("code cache {}K at {:p}", len >> 10, block.as_ptr());
        Ok(Self { block })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.block.as_ptr()
    }

    /// Usable bytes, a whole number of pages.
    pub fn len(&self) -> usize {
        self.block.len()
    }

    /// Protection the host actually applied.
    pub fn protection(&self) -> Protection {
        self.block.protection()
    }

    pub fn is_executable(&self) -> bool {
        self.protection().contains(Protection::EXECUTE)
    }
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeCache")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .field("protection", &self.protection())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::native;
    use crate::probe::HostCapacity;

    /// Native host that never grants executable pages.
    struct NoExecHost {
        inner: Arc<dyn HostMemory>,
    }

    impl HostMemory for NoExecHost {
        fn capacity(&self) -> HostCapacity {
            self.inner.capacity()
        }

        fn reserve(&self, size: usize) -> Result<NonNull<u8>> {
            self.inner.reserve(size)
        }

        fn commit(&self, addr: NonNull<u8>, len: usize, protection: Protection) -> Result<Protection> {
            self.inner.commit(addr, len, protection - Protection::EXECUTE)
        }

        fn release(&self, addr: NonNull<u8>, len: usize) {
            self.inner.release(addr, len)
        }

        fn allocate(&self, size: usize, protection: Protection) -> Result<(NonNull<u8>, Protection)> {
            self.inner.allocate(size, protection - Protection::EXECUTE)
        }

        fn deallocate(&self, addr: NonNull<u8>, len: usize) {
            self.inner.deallocate(addr, len)
        }

        fn name(&self) -> &'static str {
            "noexec"
        }
    }

    #[test]
    fn test_empty_request_gets_a_page() {
        let host = native();
        let page = host.capacity().page_size;
        let cache = CodeCache::new(&host, 0).unwrap();
        assert_eq!(cache.len(), page);
    }

    #[test]
    fn test_size_rounded_to_pages() {
        let host = native();
        let page = host.capacity().page_size;
        let cache = CodeCache::new(&host, 3 * page + 1).unwrap();
        assert_eq!(cache.len(), 4 * page);
        assert_eq!(cache.as_ptr().as_ptr() as usize % page, 0);
    }

    #[test]
    fn test_cache_is_zeroed_and_writable() {
        let host = native();
        let cache = CodeCache::new(&host, 64 * 1024).unwrap();
        assert!(cache.protection().contains(Protection::READ_WRITE));
        unsafe {
            let last = cache.as_ptr().as_ptr().add(cache.len() - 1);
            assert_eq!(last.read(), 0);
            last.write(0xC3);
            assert_eq!(last.read(), 0xC3);
        }
    }

    #[test]
    fn test_cache_without_exec() {
        let host: Arc<dyn HostMemory> = Arc::new(NoExecHost { inner: native() });
        let cache = CodeCache::new(&host, 4096).unwrap();
        assert!(!cache.is_executable());
        assert_eq!(cache.protection(), Protection::READ_WRITE);
    }
}
