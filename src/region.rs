//! The closed vocabulary of guest memory regions.
//!
//! Every segment is named by a [`RegionName`]. The static [`RULES`] table maps
//! each name to its canonical arena offset and to the condition under which
//! the region needs barrier padding.

use std::fmt;
use std::str::FromStr;

use crate::config::{MemoryConfig, MIB};
use crate::error::Error;

/// Padding appended after regions that translated code may run off the end of.
pub const BARRIER: usize = 32;

/// Name of a guest memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegionName {
    Chip,
    Kick,
    RomA8,
    RomE0,
    RomF0,
    RtArea,
    Fast,
    Z2Gfx,
    RamseyLow,
    RamseyHigh,
    Z3,
    Z3Second,
    Z3Chip,
    Z3Gfx,
    Bogo,
    Filesys,
    CustMem1,
    CustMem2,
    HrtMem,
    ArHrtMon,
    XpowerE2,
    XpowerF2,
    NordicF0,
    NordicF4,
    NordicF6,
    SuperIvB0,
    SuperIvD0,
    SuperIvE0,
    /// Expansion board ROM at an autoconfig-assigned address.
    BoardRom,
    /// Expansion board RAM at an autoconfig-assigned address.
    BoardRam,
}

/// Where a region lives inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRule {
    /// A constant guest address.
    Fixed(u32),
    /// The configured trap area address.
    RtArea,
    /// The computed Zorro II graphics RAM address.
    Z2Gfx,
    RamseyLow,
    RamseyHigh,
    Z3Fast,
    Z3Fast2,
    Z3Chip,
    /// The graphics pool reserved after the expansion regions.
    RtgPool,
    /// Custom RAM block 0 or 1.
    Custom(usize),
    /// Always a standalone, zeroed host block.
    Standalone,
    /// No canonical slot.
    None,
}

/// When a region needs [`BARRIER`] bytes of padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierRule {
    Never,
    Always,
    /// Chip RAM under 2 MiB, or nothing mapped right after it.
    ChipEnd,
    /// Zorro II fast RAM not followed by Zorro II graphics RAM.
    FastEnd,
    /// Zorro II graphics RAM ending below 10 MiB.
    Z2GfxEnd,
    /// Primary Zorro III RAM without a second tier after it.
    Z3FastEnd,
    /// Slow RAM of at most 1 MiB.
    SlowEnd,
}

/// One row of the region table.
#[derive(Debug, Clone, Copy)]
pub struct RegionRule {
    pub name: RegionName,
    pub label: &'static str,
    pub slot: SlotRule,
    pub barrier: BarrierRule,
}

const fn rule(name: RegionName, label: &'static str, slot: SlotRule, barrier: BarrierRule) -> RegionRule {
    RegionRule {
        name,
        label,
        slot,
        barrier,
    }
}

/// The region table, indexed by `RegionName as usize`.
pub static RULES: [RegionRule; 30] = {
    use BarrierRule as B;
    use RegionName as R;
    use SlotRule as S;
    [
        rule(R::Chip, "chip", S::Fixed(0), B::ChipEnd),
        rule(R::Kick, "kick", S::Fixed(0x00F8_0000), B::Always),
        rule(R::RomA8, "rom_a8", S::Fixed(0x00A8_0000), B::Never),
        rule(R::RomE0, "rom_e0", S::Fixed(0x00E0_0000), B::Never),
        rule(R::RomF0, "rom_f0", S::Fixed(0x00F0_0000), B::Never),
        rule(R::RtArea, "rtarea", S::RtArea, B::Never),
        rule(R::Fast, "fast", S::Fixed(0x0020_0000), B::FastEnd),
        rule(R::Z2Gfx, "z2_gfx", S::Z2Gfx, B::Z2GfxEnd),
        rule(R::RamseyLow, "ramsey_low", S::RamseyLow, B::Never),
        rule(R::RamseyHigh, "ramsey_high", S::RamseyHigh, B::Never),
        rule(R::Z3, "z3", S::Z3Fast, B::Z3FastEnd),
        rule(R::Z3Second, "z3_2", S::Z3Fast2, B::Always),
        rule(R::Z3Chip, "z3_chip", S::Z3Chip, B::Always),
        rule(R::Z3Gfx, "z3_gfx", S::RtgPool, B::Always),
        rule(R::Bogo, "bogo", S::Fixed(0x00C0_0000), B::SlowEnd),
        rule(R::Filesys, "filesys", S::Standalone, B::Never),
        rule(R::CustMem1, "custmem1", S::Custom(0), B::Always),
        rule(R::CustMem2, "custmem2", S::Custom(1), B::Always),
        rule(R::HrtMem, "hrtmem", S::Fixed(0x00A1_0000), B::Never),
        rule(R::ArHrtMon, "arhrtmon", S::Fixed(0x0080_0000), B::Always),
        rule(R::XpowerE2, "xpower_e2", S::Fixed(0x00E2_0000), B::Always),
        rule(R::XpowerF2, "xpower_f2", S::Fixed(0x00F2_0000), B::Always),
        rule(R::NordicF0, "nordic_f0", S::Fixed(0x00F0_0000), B::Always),
        rule(R::NordicF4, "nordic_f4", S::Fixed(0x00F4_0000), B::Always),
        rule(R::NordicF6, "nordic_f6", S::Fixed(0x00F6_0000), B::Always),
        rule(R::SuperIvB0, "superiv_b0", S::Fixed(0x00B0_0000), B::Always),
        rule(R::SuperIvD0, "superiv_d0", S::Fixed(0x00D0_0000), B::Always),
        rule(R::SuperIvE0, "superiv_e0", S::Fixed(0x00E0_0000), B::Always),
        rule(R::BoardRom, "board_rom", S::None, B::Never),
        rule(R::BoardRam, "board_ram", S::None, B::Never),
    ]
};

impl RegionName {
    /// Every region name, in table order.
    pub fn all() -> impl Iterator<Item = RegionName> {
        RULES.iter().map(|r| r.name)
    }

    /// Row of the region table for this name.
    pub fn rule(self) -> &'static RegionRule {
        &RULES[self as usize]
    }

    /// Short name used in logs and on the command line.
    pub fn as_str(self) -> &'static str {
        self.rule().label
    }

    /// Canonical offset of the region inside the arena.
    ///
    /// `None` for names without a slot, for the standalone-only name and for
    /// the graphics pool (whose address depends on the reservation).
    pub fn canonical_offset(self, config: &MemoryConfig) -> Option<usize> {
        match self.rule().slot {
            SlotRule::Fixed(addr) => Some(addr as usize),
            SlotRule::RtArea => Some(config.rtarea_base as usize),
            SlotRule::Z2Gfx => Some(config.z2_rtg_start()),
            SlotRule::RamseyLow => Some(config.mb_low_start()),
            SlotRule::RamseyHigh => Some(config.mb_high_start()),
            SlotRule::Z3Fast => Some(config.z3_fast_start as usize),
            SlotRule::Z3Fast2 => Some(config.z3_fast_start as usize + config.z3_fast_size),
            SlotRule::Z3Chip => Some(config.z3_chip_start()),
            SlotRule::Custom(index) => Some(config.custom_memory[index].addr as usize),
            SlotRule::RtgPool | SlotRule::Standalone | SlotRule::None => None,
        }
    }

    /// Whether the region needs barrier padding under `config`.
    pub fn needs_barrier(self, config: &MemoryConfig) -> bool {
        match self.rule().barrier {
            BarrierRule::Never => false,
            BarrierRule::Always => true,
            BarrierRule::ChipEnd => {
                config.chip_size < 2 * MIB || (config.fast_size == 0 && config.z2_rtg_size() == 0)
            }
            BarrierRule::FastEnd => config.z2_rtg_size() == 0,
            BarrierRule::Z2GfxEnd => config.z2_rtg_start() + config.z2_rtg_size() < 10 * MIB,
            BarrierRule::Z3FastEnd => config.z3_fast2_size == 0,
            BarrierRule::SlowEnd => config.slow_size <= MIB,
        }
    }

    /// Requested size plus barrier padding when required.
    pub fn effective_size(self, requested: usize, config: &MemoryConfig) -> usize {
        if self.needs_barrier(config) {
            requested + BARRIER
        } else {
            requested
        }
    }

    /// Whether this name never gets arena placement.
    pub fn is_standalone_only(self) -> bool {
        self.rule().slot == SlotRule::Standalone
    }

    /// Whether the name has somewhere to go in the arena.
    pub fn has_slot(self) -> bool {
        !matches!(self.rule().slot, SlotRule::Standalone | SlotRule::None)
    }
}

impl fmt::Display for RegionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegionName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RULES
            .iter()
            .find(|r| r.label == s)
            .map(|r| r.name)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown region name '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RtgBus, RtgConfig};

    #[test]
    fn test_table_is_indexed_by_name() {
        for (index, rule) in RULES.iter().enumerate() {
            assert_eq!(rule.name as usize, index, "row {} is {}", index, rule.label);
        }
    }

    #[test]
    fn test_labels_round_trip() {
        for name in RegionName::all() {
            assert_eq!(name.as_str().parse::<RegionName>().unwrap(), name);
        }
        assert!("nonsense".parse::<RegionName>().is_err());
    }

    #[test]
    fn test_fixed_offsets() {
        let config = MemoryConfig::default();
        assert_eq!(RegionName::Chip.canonical_offset(&config), Some(0));
        assert_eq!(RegionName::Kick.canonical_offset(&config), Some(0x00F8_0000));
        assert_eq!(RegionName::Fast.canonical_offset(&config), Some(0x0020_0000));
        assert_eq!(RegionName::Bogo.canonical_offset(&config), Some(0x00C0_0000));
        assert_eq!(RegionName::RtArea.canonical_offset(&config), Some(0x00F0_0000));
        assert_eq!(RegionName::Z3Gfx.canonical_offset(&config), None);
        assert_eq!(RegionName::BoardRam.canonical_offset(&config), None);
        assert_eq!(RegionName::Filesys.canonical_offset(&config), None);
    }

    #[test]
    fn test_z3_offsets_follow_config() {
        let config = MemoryConfig {
            z3_fast_size: 64 * MIB,
            z3_fast2_size: 128 * MIB,
            z3_chip_size: 16 * MIB,
            ..Default::default()
        };
        assert_eq!(RegionName::Z3.canonical_offset(&config), Some(0x1000_0000));
        assert_eq!(RegionName::Z3Second.canonical_offset(&config), Some(0x1000_0000 + 64 * MIB));
        assert_eq!(
            RegionName::Z3Chip.canonical_offset(&config),
            Some(0x1000_0000 + 192 * MIB + 16 * MIB)
        );
    }

    #[test]
    fn test_barrier_rules() {
        let mut config = MemoryConfig {
            chip_size: 2 * MIB,
            fast_size: 8 * MIB,
            slow_size: 512 * 1024,
            ..Default::default()
        };
        assert!(!RegionName::Chip.needs_barrier(&config));
        assert!(RegionName::Fast.needs_barrier(&config));
        assert!(RegionName::Bogo.needs_barrier(&config));
        assert!(RegionName::Kick.needs_barrier(&config));
        assert!(!RegionName::RomE0.needs_barrier(&config));
        assert!(RegionName::CustMem1.needs_barrier(&config));
        assert!(RegionName::Z3.needs_barrier(&config));

        config.chip_size = MIB;
        assert!(RegionName::Chip.needs_barrier(&config));

        config.rtg = Some(RtgConfig { size: 4 * MIB, bus: RtgBus::Z2 });
        assert!(!RegionName::Fast.needs_barrier(&config));

        config.z3_fast2_size = 128 * MIB;
        assert!(!RegionName::Z3.needs_barrier(&config));
    }

    #[test]
    fn test_effective_size() {
        let config = MemoryConfig::default();
        assert_eq!(RegionName::Kick.effective_size(0x80000, &config), 0x80000 + BARRIER);
        assert_eq!(RegionName::RomA8.effective_size(0x10000, &config), 0x10000);
    }
}
