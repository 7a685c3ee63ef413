//! Shrink policy for configurations that do not fit.
//!
//! [`SHRINK_POLICY`] lists the steps in priority order. A step is applied
//! only when its own predicate holds; the planner always takes the first
//! applicable step. The secondary Zorro III tier goes first, then
//! chip-class expansion RAM, then the primary tier is halved. The graphics
//! pool is the last resort.

use std::fmt;

use crate::config::{MemoryConfig, RtgBus, RtgConfig, MIB};

/// Zorro III RAM below this total is never shrunk.
pub const Z3_SHRINK_THRESHOLD: usize = 8 * MIB;

/// A secondary Zorro III tier smaller than this is dropped after every step.
pub const Z3_FAST2_MIN: usize = 128 * MIB;

/// Chip-class expansion RAM up to this size is dropped rather than halved.
pub const Z3_CHIP_DROP_LIMIT: usize = 16 * MIB;

/// The graphics pool is never halved below this; it is dropped instead.
pub const RTG_MIN: usize = MIB;

/// One way of making a configuration smaller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkStep {
    /// Remove the secondary Zorro III fast RAM tier.
    DropZ3Fast2,
    /// Drop small chip-class expansion RAM, halve large.
    ShrinkZ3Chip,
    /// Halve the primary Zorro III tier, moving a quarter into the second.
    SplitZ3Fast,
    /// Halve the Zorro III graphics pool, or drop it when it gets too small.
    ShrinkRtg,
}

/// Steps in the order they are tried.
pub static SHRINK_POLICY: [ShrinkStep; 4] = [
    ShrinkStep::DropZ3Fast2,
    ShrinkStep::ShrinkZ3Chip,
    ShrinkStep::SplitZ3Fast,
    ShrinkStep::ShrinkRtg,
];

impl ShrinkStep {
    /// Whether this step can make `config` smaller.
    pub fn applies(self, config: &MemoryConfig) -> bool {
        let z3_shrinkable = config.has_z3_space() && config.z3_total() >= Z3_SHRINK_THRESHOLD;
        match self {
            ShrinkStep::DropZ3Fast2 => z3_shrinkable && config.z3_fast2_size > 0,
            ShrinkStep::ShrinkZ3Chip => z3_shrinkable && config.z3_chip_size > 0,
            ShrinkStep::SplitZ3Fast => z3_shrinkable && config.z3_fast_size > 0,
            ShrinkStep::ShrinkRtg => config.has_z3_space() && config.z3_rtg_size() > 0,
        }
    }

    /// Apply the step to `config`.
    pub fn apply(self, config: &mut MemoryConfig) {
        match self {
            ShrinkStep::DropZ3Fast2 => config.z3_fast2_size = 0,
            ShrinkStep::ShrinkZ3Chip => {
                if config.z3_chip_size <= Z3_CHIP_DROP_LIMIT {
                    config.z3_chip_size = 0;
                } else {
                    config.z3_chip_size /= 2;
                }
            }
            ShrinkStep::SplitZ3Fast => {
                config.z3_fast2_size = config.z3_fast_size / 4;
                config.z3_fast_size /= 2;
            }
            ShrinkStep::ShrinkRtg => {
                let halved = config.z3_rtg_size() / 2;
                config.rtg = (halved >= RTG_MIN).then_some(RtgConfig {
                    size: halved,
                    bus: RtgBus::Z3,
                });
            }
        }
        if config.z3_fast2_size < Z3_FAST2_MIN {
            config.z3_fast2_size = 0;
        }
    }

    /// Short name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ShrinkStep::DropZ3Fast2 => "drop-z3-fast2",
            ShrinkStep::ShrinkZ3Chip => "shrink-z3-chip",
            ShrinkStep::SplitZ3Fast => "split-z3-fast",
            ShrinkStep::ShrinkRtg => "shrink-rtg",
        }
    }
}

impl fmt::Display for ShrinkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First applicable step of the policy for `config`.
pub fn next_step(config: &MemoryConfig) -> Option<ShrinkStep> {
    SHRINK_POLICY.iter().copied().find(|step| step.applies(config))
}

/// A step the planner took and what it bought.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkRecord {
    /// Step applied.
    pub step: ShrinkStep,
    /// Bytes the arena shrank by (zero when the step did not change the
    /// rounded layout).
    pub freed: usize,
    /// Arena size after the step.
    pub total_after: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressSpace;

    fn z3(fast: usize, fast2: usize, chip: usize) -> MemoryConfig {
        MemoryConfig {
            address_space: AddressSpace::Bits32,
            z3_fast_size: fast,
            z3_fast2_size: fast2,
            z3_chip_size: chip,
            ..Default::default()
        }
    }

    #[test]
    fn test_policy_order() {
        assert_eq!(next_step(&z3(256 * MIB, 256 * MIB, 64 * MIB)), Some(ShrinkStep::DropZ3Fast2));
        assert_eq!(next_step(&z3(256 * MIB, 0, 64 * MIB)), Some(ShrinkStep::ShrinkZ3Chip));
        assert_eq!(next_step(&z3(256 * MIB, 0, 0)), Some(ShrinkStep::SplitZ3Fast));
        assert_eq!(next_step(&z3(4 * MIB, 0, 0)), None);
    }

    #[test]
    fn test_rtg_is_last_resort() {
        let mut config = z3(256 * MIB, 0, 0);
        config.rtg = Some(RtgConfig { size: 32 * MIB, bus: RtgBus::Z3 });
        assert_eq!(next_step(&config), Some(ShrinkStep::SplitZ3Fast));

        config.z3_fast_size = 0;
        assert_eq!(next_step(&config), Some(ShrinkStep::ShrinkRtg));
    }

    #[test]
    fn test_no_z3_steps_on_24_bit_bus() {
        let mut config = z3(256 * MIB, 0, 0);
        config.address_space = AddressSpace::Bits24;
        assert_eq!(next_step(&config), None);
    }

    #[test]
    fn test_split_keeps_large_second_tier() {
        let mut config = z3(1024 * MIB, 0, 0);
        ShrinkStep::SplitZ3Fast.apply(&mut config);
        assert_eq!(config.z3_fast_size, 512 * MIB);
        assert_eq!(config.z3_fast2_size, 256 * MIB);
    }

    #[test]
    fn test_split_drops_small_second_tier() {
        let mut config = z3(256 * MIB, 0, 0);
        ShrinkStep::SplitZ3Fast.apply(&mut config);
        assert_eq!(config.z3_fast_size, 128 * MIB);
        assert_eq!(config.z3_fast2_size, 0);
    }

    #[test]
    fn test_z3_chip_drop_or_halve() {
        let mut small = z3(0, 0, 16 * MIB);
        ShrinkStep::ShrinkZ3Chip.apply(&mut small);
        assert_eq!(small.z3_chip_size, 0);

        let mut large = z3(0, 0, 64 * MIB);
        ShrinkStep::ShrinkZ3Chip.apply(&mut large);
        assert_eq!(large.z3_chip_size, 32 * MIB);
    }

    #[test]
    fn test_rtg_halves_then_drops() {
        let mut config = z3(0, 0, 0);
        config.rtg = Some(RtgConfig { size: 2 * MIB, bus: RtgBus::Z3 });
        ShrinkStep::ShrinkRtg.apply(&mut config);
        assert_eq!(config.z3_rtg_size(), MIB);

        ShrinkStep::ShrinkRtg.apply(&mut config);
        assert_eq!(config.rtg, None);
        assert!(!ShrinkStep::ShrinkRtg.applies(&config));
    }
}
