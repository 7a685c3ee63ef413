//! Builder for validated memory configurations.

use crate::config::{
    AddressSpace, CustomMemory, MaxMem, MemoryConfig, RtgBus, RtgConfig, MIB, Z3_BASE,
};
use crate::error::{Error, Result};

/// Largest graphics RAM a Zorro II board can expose.
const Z2_RTG_MAX: usize = 8 * MIB;

/// Builder for creating a [`MemoryConfig`].
///
/// # Example
///
/// ```rust
/// use natmem::{AddressSpace, MemoryConfig};
///
/// let config = MemoryConfig::builder()
///     .address_space(AddressSpace::Bits32)
///     .chip_mb(2)
///     .fast_mb(8)
///     .z3_fast_mb(256)
///     .build()?;
/// # Ok::<(), natmem::Error>(())
/// ```
#[derive(Default)]
pub struct MemoryConfigBuilder {
    address_space: Option<AddressSpace>,
    chip_size: Option<usize>,
    slow_size: Option<usize>,
    fast_size: Option<usize>,
    z3_fast_size: Option<usize>,
    z3_fast2_size: Option<usize>,
    z3_chip_size: Option<usize>,
    z3_fast_start: Option<u32>,
    rtg: Option<RtgConfig>,
    mb_low_size: Option<usize>,
    mb_high_size: Option<usize>,
    custom_memory: [Option<CustomMemory>; 2],
    rtarea_base: Option<u32>,
    max_mem: Option<MaxMem>,
    executable: Option<bool>,
}

impl MemoryConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CPU address bus width.
    ///
    /// Default: 24-bit
    pub fn address_space(mut self, space: AddressSpace) -> Self {
        self.address_space = Some(space);
        self
    }

    /// Set the amount of chip RAM in bytes.
    ///
    /// Default: 512 KiB
    pub fn chip(mut self, bytes: usize) -> Self {
        self.chip_size = Some(bytes);
        self
    }

    /// Set the amount of chip RAM in megabytes.
    pub fn chip_mb(self, mb: usize) -> Self {
        self.chip(mb * MIB)
    }

    /// Set the amount of slow RAM in bytes.
    pub fn slow(mut self, bytes: usize) -> Self {
        self.slow_size = Some(bytes);
        self
    }

    /// Set the amount of Zorro II fast RAM in bytes.
    pub fn fast(mut self, bytes: usize) -> Self {
        self.fast_size = Some(bytes);
        self
    }

    /// Set the amount of Zorro II fast RAM in megabytes.
    pub fn fast_mb(self, mb: usize) -> Self {
        self.fast(mb * MIB)
    }

    /// Set the primary Zorro III fast RAM size in bytes.
    pub fn z3_fast(mut self, bytes: usize) -> Self {
        self.z3_fast_size = Some(bytes);
        self
    }

    /// Set the primary Zorro III fast RAM size in megabytes.
    pub fn z3_fast_mb(self, mb: usize) -> Self {
        self.z3_fast(mb * MIB)
    }

    /// Set the secondary Zorro III fast RAM size in bytes.
    pub fn z3_fast2(mut self, bytes: usize) -> Self {
        self.z3_fast2_size = Some(bytes);
        self
    }

    /// Set the Zorro III chip-class RAM size in bytes.
    pub fn z3_chip(mut self, bytes: usize) -> Self {
        self.z3_chip_size = Some(bytes);
        self
    }

    /// Set the guest address of the first Zorro III fast RAM board.
    ///
    /// Default: 0x10000000
    pub fn z3_fast_start(mut self, addr: u32) -> Self {
        self.z3_fast_start = Some(addr);
        self
    }

    /// Configure a graphics card with `bytes` of RAM on `bus`.
    pub fn rtg(mut self, bytes: usize, bus: RtgBus) -> Self {
        self.rtg = (bytes > 0).then_some(RtgConfig { size: bytes, bus });
        self
    }

    /// Set the A3000 motherboard RAM sizes in bytes.
    pub fn motherboard(mut self, low: usize, high: usize) -> Self {
        self.mb_low_size = Some(low);
        self.mb_high_size = Some(high);
        self
    }

    /// Configure custom RAM block `index` (0 or 1).
    pub fn custom_memory(mut self, index: usize, addr: u32, bytes: usize) -> Self {
        if let Some(slot) = self.custom_memory.get_mut(index) {
            *slot = Some(CustomMemory { addr, size: bytes });
        }
        self
    }

    /// Set the guest address of the resident trap area.
    ///
    /// Default: 0xF00000
    pub fn rtarea_base(mut self, addr: u32) -> Self {
        self.rtarea_base = Some(addr);
        self
    }

    /// Set the user limit on the arena size.
    ///
    /// Default: host physical memory
    pub fn max_mem(mut self, max_mem: MaxMem) -> Self {
        self.max_mem = Some(max_mem);
        self
    }

    /// Request (or refuse) executable arena pages.
    ///
    /// Default: true
    pub fn executable(mut self, executable: bool) -> Self {
        self.executable = Some(executable);
        self
    }

    /// Build the configuration.
    ///
    /// This validates that every fixed-address region is representable in
    /// the guest address space.
    pub fn build(self) -> Result<MemoryConfig> {
        let defaults = MemoryConfig::default();

        let chip_size = self.chip_size.unwrap_or(defaults.chip_size);
        if chip_size == 0 {
            return Err(Error::InvalidConfig("chip RAM size must be > 0".to_string()));
        }

        let z3_fast_start = self.z3_fast_start.unwrap_or(Z3_BASE);
        if z3_fast_start < Z3_BASE {
            return Err(Error::InvalidConfig(format!(
                "Zorro III fast RAM start 0x{:08x} is below 0x{:08x}",
                z3_fast_start, Z3_BASE
            )));
        }

        if let Some(rtg) = self.rtg {
            if rtg.bus == RtgBus::Z2 && rtg.size > Z2_RTG_MAX {
                return Err(Error::InvalidConfig(format!(
                    "Zorro II graphics RAM of {} MiB exceeds {} MiB",
                    rtg.size / MIB,
                    Z2_RTG_MAX / MIB
                )));
            }
        }

        let custom_memory = [
            self.custom_memory[0].unwrap_or_default(),
            self.custom_memory[1].unwrap_or_default(),
        ];

        Ok(MemoryConfig {
            address_space: self.address_space.unwrap_or(defaults.address_space),
            chip_size,
            slow_size: self.slow_size.unwrap_or(0),
            fast_size: self.fast_size.unwrap_or(0),
            z3_fast_size: self.z3_fast_size.unwrap_or(0),
            z3_fast2_size: self.z3_fast2_size.unwrap_or(0),
            z3_chip_size: self.z3_chip_size.unwrap_or(0),
            z3_fast_start,
            rtg: self.rtg,
            mb_low_size: self.mb_low_size.unwrap_or(0),
            mb_high_size: self.mb_high_size.unwrap_or(0),
            custom_memory,
            rtarea_base: self.rtarea_base.unwrap_or(defaults.rtarea_base),
            max_mem: self.max_mem.unwrap_or_default(),
            executable: self.executable.unwrap_or(defaults.executable),
        })
    }
}
