//! Guest memory configuration.
//!
//! A [`MemoryConfig`] enumerates the requested size of every region the
//! planner knows about. It arrives from the emulator's already-parsed
//! settings; build one with [`MemoryConfig::builder()`].

use crate::builder::MemoryConfigBuilder;

pub(crate) const MIB: usize = 1024 * 1024;

/// Guest address of the Zorro III expansion space.
pub const Z3_BASE: u32 = 0x1000_0000;

/// A3000 motherboard RAM sits around this guest address.
pub const MB_RAM_SPLIT: u32 = 0x0800_0000;

/// Width of the emulated CPU's address bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressSpace {
    /// 68000/68010: 16 MiB of guest address space.
    #[default]
    Bits24,
    /// 68020 and later: the low window covers 256 MiB and Zorro III space
    /// follows it.
    Bits32,
}

impl AddressSpace {
    /// Size of the low window mirrored at the start of the arena.
    pub const fn window_size(self) -> usize {
        match self {
            AddressSpace::Bits24 => 0x0100_0000,
            AddressSpace::Bits32 => 0x1000_0000,
        }
    }
}

/// Expansion bus the graphics card sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtgBus {
    /// Zorro II board: its RAM lives inside the 24-bit window.
    Z2,
    /// Zorro III board: its RAM gets a dedicated pool after the expansion
    /// regions (or a separate reservation).
    Z3,
}

/// Graphics card RAM request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtgConfig {
    /// Pool size in bytes.
    pub size: usize,
    /// Bus the board is attached to.
    pub bus: RtgBus,
}

/// Upper limit the user places on the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxMem {
    /// Use the host's physical memory.
    #[default]
    Host,
    /// Use at most this many MiB.
    Limit(u32),
    /// Ignore the host and use the 32-bit ceiling.
    Ceiling,
}

/// A custom RAM block at a configured guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CustomMemory {
    /// Guest address of the block.
    pub addr: u32,
    /// Size in bytes.
    pub size: usize,
}

/// Requested sizes and addresses of every guest memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// CPU address bus width.
    pub address_space: AddressSpace,
    /// Chip RAM size.
    pub chip_size: usize,
    /// Slow ("bogo") RAM size at 0xC00000.
    pub slow_size: usize,
    /// Zorro II fast RAM size at 0x200000.
    pub fast_size: usize,
    /// Primary Zorro III fast RAM size.
    pub z3_fast_size: usize,
    /// Secondary Zorro III fast RAM size.
    pub z3_fast2_size: usize,
    /// Zorro III chip-class RAM size.
    pub z3_chip_size: usize,
    /// Guest address of the first Zorro III fast RAM board.
    pub z3_fast_start: u32,
    /// Graphics card RAM, if a board is configured.
    pub rtg: Option<RtgConfig>,
    /// A3000 motherboard RAM below 128 MiB.
    pub mb_low_size: usize,
    /// A3000 motherboard RAM above 128 MiB.
    pub mb_high_size: usize,
    /// Up to two custom RAM blocks.
    pub custom_memory: [CustomMemory; 2],
    /// Guest address of the emulator's resident trap area.
    pub rtarea_base: u32,
    /// Limit on the arena size.
    pub max_mem: MaxMem,
    /// Request executable pages for translated code.
    pub executable: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            address_space: AddressSpace::Bits24,
            chip_size: 512 * 1024,
            slow_size: 0,
            fast_size: 0,
            z3_fast_size: 0,
            z3_fast2_size: 0,
            z3_chip_size: 0,
            z3_fast_start: Z3_BASE,
            rtg: None,
            mb_low_size: 0,
            mb_high_size: 0,
            custom_memory: [CustomMemory::default(); 2],
            rtarea_base: 0x00F0_0000,
            max_mem: MaxMem::Host,
            executable: true,
        }
    }
}

impl MemoryConfig {
    /// Create a new configuration builder.
    pub fn builder() -> MemoryConfigBuilder {
        MemoryConfigBuilder::new()
    }

    /// Whether Zorro III regions can be placed in the arena at all.
    pub fn has_z3_space(&self) -> bool {
        self.address_space == AddressSpace::Bits32
    }

    /// Combined Zorro III RAM (both fast tiers and chip-class RAM).
    pub fn z3_total(&self) -> usize {
        self.z3_fast_size + self.z3_fast2_size + self.z3_chip_size
    }

    /// Combined Zorro III fast RAM.
    pub fn z3_fast_total(&self) -> usize {
        self.z3_fast_size + self.z3_fast2_size
    }

    /// Gap kept between the Zorro III fast tiers and chip-class RAM.
    pub fn z3_chip_gap(&self) -> usize {
        if self.z3_chip_size > 0 && self.z3_fast_total() > 0 {
            16 * MIB
        } else {
            0
        }
    }

    /// Guest address of Zorro III chip-class RAM.
    pub fn z3_chip_start(&self) -> usize {
        self.z3_fast_start as usize + self.z3_fast_total() + self.z3_chip_gap()
    }

    /// Size of the Zorro III graphics pool, zero without a Z3 board.
    pub fn z3_rtg_size(&self) -> usize {
        match self.rtg {
            Some(RtgConfig { size, bus: RtgBus::Z3 }) => size,
            _ => 0,
        }
    }

    /// Size of the Zorro II graphics RAM, zero without a Z2 board.
    pub fn z2_rtg_size(&self) -> usize {
        match self.rtg {
            Some(RtgConfig { size, bus: RtgBus::Z2 }) => size,
            _ => 0,
        }
    }

    /// Guest address of Zorro II graphics RAM.
    ///
    /// Starts after Zorro II fast RAM, aligned to the board size while below
    /// 4 MiB, offset by the 2 MiB of chip RAM space.
    pub fn z2_rtg_start(&self) -> usize {
        let rtg = self.z2_rtg_size();
        let mut start = self.fast_size;
        if rtg > 0 {
            while start & (rtg - 1) != 0 && start < 4 * MIB {
                start += MIB;
            }
        }
        start + 2 * MIB
    }

    /// Guest address of A3000 motherboard RAM below the split.
    pub fn mb_low_start(&self) -> usize {
        (MB_RAM_SPLIT as usize).saturating_sub(self.mb_low_size)
    }

    /// Guest address of A3000 motherboard RAM above the split.
    pub fn mb_high_start(&self) -> usize {
        MB_RAM_SPLIT as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MemoryConfig::default();
        assert_eq!(config.address_space, AddressSpace::Bits24);
        assert_eq!(config.z3_total(), 0);
        assert_eq!(config.z3_rtg_size(), 0);
        assert!(!config.has_z3_space());
    }

    #[test]
    fn test_window_size() {
        assert_eq!(AddressSpace::Bits24.window_size(), 16 * MIB);
        assert_eq!(AddressSpace::Bits32.window_size(), 256 * MIB);
    }

    #[test]
    fn test_z2_rtg_start() {
        let mut config = MemoryConfig {
            rtg: Some(RtgConfig { size: 4 * MIB, bus: RtgBus::Z2 }),
            ..Default::default()
        };
        assert_eq!(config.z2_rtg_start(), 2 * MIB);

        config.fast_size = 2 * MIB;
        assert_eq!(config.z2_rtg_start(), 6 * MIB);

        config.rtg = Some(RtgConfig { size: 2 * MIB, bus: RtgBus::Z2 });
        assert_eq!(config.z2_rtg_start(), 4 * MIB);
    }

    #[test]
    fn test_z3_chip_start() {
        let config = MemoryConfig {
            address_space: AddressSpace::Bits32,
            z3_fast_size: 64 * MIB,
            z3_chip_size: 32 * MIB,
            ..Default::default()
        };
        assert_eq!(config.z3_chip_gap(), 16 * MIB);
        assert_eq!(config.z3_chip_start(), Z3_BASE as usize + 80 * MIB);

        let chip_only = MemoryConfig {
            z3_fast_size: 0,
            ..config
        };
        assert_eq!(chip_only.z3_chip_start(), Z3_BASE as usize);
    }

    #[test]
    fn test_motherboard_ram() {
        let config = MemoryConfig {
            mb_low_size: 16 * MIB,
            ..Default::default()
        };
        assert_eq!(config.mb_low_start(), 0x0700_0000);
        assert_eq!(config.mb_high_start(), 0x0800_0000);
    }
}
