//! # natmem
//!
//! Guest memory for machine emulators that run translated code directly
//! against host memory.
//!
//! One large address-space reservation (the arena) mirrors the emulated
//! machine's physical address space, so a guest address turns into a host
//! pointer by adding the arena base. Named segments (chip RAM, ROMs,
//! expansion RAM, graphics RAM) are carved from the arena at fixed offsets,
//! or handed out as standalone host blocks when that is impossible.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use natmem::{AddressSpace, MemoryConfig, NaturalMemory, RegionName, Result};
//!
//! fn main() -> Result<()> {
//!     let config = MemoryConfig::builder()
//!         .address_space(AddressSpace::Bits32)
//!         .chip_mb(2)
//!         .z3_fast_mb(256)
//!         .build()?;
//!
//!     let mut mem = NaturalMemory::new();
//!     let remap = mem.plan_and_reserve(&config)?;
//!     println!("arena of {} bytes at {:#x}", remap.total_size, remap.base);
//!
//!     let z3 = mem.segment_create(RegionName::Z3, mem.config().z3_fast_size)?;
//!     let att = mem.segment_attach(z3, None)?;
//!     assert!(att.carved);
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux, macOS, BSD**: `mmap`/`mprotect`
//! - **Windows**: `VirtualAlloc`

pub mod arena;
pub mod backend;
mod builder;
mod cache;
pub mod config;
pub mod debug;
mod error;
pub mod layout;
mod natmem;
pub mod probe;
pub mod region;
pub mod resolver;
pub mod segment;

// Re-exports
pub use arena::GuestAddressSpace;
pub use backend::{HostMemory, Protection};
pub use builder::MemoryConfigBuilder;
pub use cache::CodeCache;
pub use config::{AddressSpace, CustomMemory, MaxMem, MemoryConfig, RtgBus, RtgConfig};
pub use error::{Error, Result};
pub use layout::{plan_layout, LayoutPlan};
pub use natmem::{NaturalMemory, Remap};
pub use probe::{probe, CapacityBound, HostCapacity};
pub use region::{RegionName, BARRIER};
pub use segment::{Attachment, Placement, SegmentDescriptor, SegmentId, SegmentState};

/// Get the name of the host memory backend for the current platform.
pub fn backend_name() -> &'static str {
    backend::name()
}
