//! Host capacity probe and the arena size bound derived from it.

use crate::config::{MaxMem, MIB};

/// Page size assumed when the host cannot report one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Physical memory assumed when the host cannot report it (256 MiB).
pub const DEFAULT_PHYSICAL_MEMORY: u64 = 256 * MIB as u64;

/// Arena ceiling on 32-bit hosts.
pub const CEILING_32: usize = 0x7F00_0000;

/// Arena ceiling on 64-bit hosts.
pub const CEILING_64: u64 = 0xF000_0000;

/// The bound is never lowered below this.
pub const MIN_BOUND: usize = 8 * MIB;

/// What the host reports about its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapacity {
    /// Virtual memory page size in bytes.
    pub page_size: usize,
    /// Total physical memory in bytes.
    pub total_physical: u64,
}

impl Default for HostCapacity {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            total_physical: DEFAULT_PHYSICAL_MEMORY,
        }
    }
}

/// Query the running host. Never fails.
pub fn probe() -> HostCapacity {
    #[cfg(unix)]
    {
        HostCapacity {
            page_size: crate::backend::unix::page_size(),
            total_physical: crate::backend::unix::physical_memory()
                .unwrap_or(DEFAULT_PHYSICAL_MEMORY),
        }
    }

    #[cfg(windows)]
    {
        HostCapacity {
            page_size: crate::backend::win32::page_size(),
            total_physical: crate::backend::win32::physical_memory()
                .unwrap_or(DEFAULT_PHYSICAL_MEMORY),
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        HostCapacity::default()
    }
}

/// Hard ceiling for the arena on this platform.
pub const fn platform_ceiling() -> usize {
    #[cfg(target_pointer_width = "64")]
    {
        CEILING_64 as usize
    }

    #[cfg(not(target_pointer_width = "64"))]
    {
        CEILING_32
    }
}

/// Upper bound on the arena size for one session.
///
/// The bound limits the planner's search; it does not guarantee that a
/// reservation of that size will succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityBound {
    bytes: usize,
    ceiling: usize,
    page_size: usize,
    total_physical: u64,
}

impl CapacityBound {
    /// Derive the bound from a host probe and the user's memory limit.
    pub fn new(capacity: HostCapacity, max_mem: MaxMem) -> Self {
        Self::with_ceiling(capacity, max_mem, platform_ceiling())
    }

    /// Same as [`CapacityBound::new`] with an explicit platform ceiling.
    pub fn with_ceiling(capacity: HostCapacity, max_mem: MaxMem, ceiling: usize) -> Self {
        let wanted: u64 = match max_mem {
            MaxMem::Host => capacity.total_physical,
            MaxMem::Limit(mb) => u64::from(mb) * MIB as u64,
            MaxMem::Ceiling => CEILING_32 as u64,
        };
        let bytes = wanted.min(ceiling as u64).max(MIN_BOUND as u64) as usize;

        Self {
            bytes,
            ceiling,
            page_size: capacity.page_size,
            total_physical: capacity.total_physical,
        }
    }

    /// The bound in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// The platform ceiling the bound was clamped to.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Host page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Host physical memory as probed.
    pub fn total_physical(&self) -> u64 {
        self.total_physical
    }

    /// Largest Zorro III fast RAM size a front end should offer.
    pub fn max_z3_fast(&self) -> usize {
        let allowed = if self.ceiling > CEILING_32 {
            2048 * MIB
        } else {
            1536 * MIB
        };
        allowed.min(self.bytes).max(512 * MIB)
    }

    /// Check if `size` bytes fit under the bound.
    pub fn fits(&self, size: usize) -> bool {
        size <= self.bytes && size <= self.ceiling
    }
}
