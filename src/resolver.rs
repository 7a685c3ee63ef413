//! Slot resolution: where in the arena a named segment goes.

use crate::arena::GuestAddressSpace;
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::region::{RegionName, SlotRule, BARRIER};

/// A resolved arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Offset from the base of the reservation holding the slot.
    pub offset: usize,
    /// Host address of the slot.
    pub address: usize,
    /// Barrier padding included after the requested size.
    pub barrier: usize,
}

/// Resolve the arena slot for a `size`-byte segment named `name`.
///
/// `nominal` is the host address the caller would like, if any. An address
/// below the arena base selects the canonical slot; one inside the arena is
/// honored as given. Everything else, including a session without an arena,
/// is [`Error::NoFixedSlot`], and the caller falls back to a standalone
/// block.
pub fn resolve(
    name: RegionName,
    nominal: Option<usize>,
    size: usize,
    arena: Option<&GuestAddressSpace>,
    config: &MemoryConfig,
) -> Result<Slot> {
    let no_slot = || Error::NoFixedSlot(name);
    let arena = arena.ok_or_else(no_slot)?;
    if name.is_standalone_only() {
        return Err(no_slot());
    }

    let barrier = if name.needs_barrier(config) { BARRIER } else { 0 };
    let effective = size + barrier;

    if name.rule().slot == SlotRule::RtgPool {
        let (start, _) = arena.rtg_range().ok_or_else(no_slot)?;
        let address = match nominal {
            None => start,
            Some(addr) if addr < arena.start() => start,
            Some(addr) if arena.rtg_contains_range(addr, 1) => addr,
            Some(_) => return Err(no_slot()),
        };
        if !arena.rtg_contains_range(address, effective) {
            return Err(no_slot());
        }
        // a pool inside the arena keeps arena offsets
        let base = if arena.rtg_is_separate() { start } else { arena.start() };
        return Ok(Slot {
            offset: address - base,
            address,
            barrier,
        });
    }

    let address = match nominal {
        Some(addr) if addr >= arena.start() => {
            if addr >= arena.end() {
                return Err(no_slot());
            }
            addr
        }
        _ => {
            let offset = name.canonical_offset(config).ok_or_else(no_slot)?;
            arena.start().checked_add(offset).ok_or_else(no_slot)?
        }
    };
    if !arena.contains_range(address, effective) {
        return Err(no_slot());
    }

    Ok(Slot {
        offset: address - arena.start(),
        address,
        barrier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::reserve;
    use crate::backend::native;
    use crate::config::{AddressSpace, MaxMem, RtgBus, RtgConfig, MIB};
    use crate::probe::CapacityBound;

    fn space(config: &MemoryConfig) -> GuestAddressSpace {
        let host = native();
        let bound = CapacityBound::new(host.capacity(), MaxMem::Ceiling);
        reserve(config, &bound, &host).unwrap()
    }

    #[test]
    fn test_canonical_slots() {
        let config = MemoryConfig::default();
        let arena = space(&config);

        let kick = resolve(RegionName::Kick, None, 512 * 1024, Some(&arena), &config).unwrap();
        assert_eq!(kick.offset, 0x00F8_0000);
        assert_eq!(kick.address, arena.start() + 0x00F8_0000);
        assert_eq!(kick.barrier, BARRIER);

        let rom = resolve(RegionName::RomE0, Some(0x1000), 64 * 1024, Some(&arena), &config).unwrap();
        assert_eq!(rom.offset, 0x00E0_0000);
        assert_eq!(rom.barrier, 0);
    }

    #[test]
    fn test_nominal_inside_arena_is_honored() {
        let config = MemoryConfig::default();
        let arena = space(&config);
        let wanted = arena.start() + 0x0040_0000;
        let slot = resolve(RegionName::BoardRam, Some(wanted), MIB, Some(&arena), &config).unwrap();
        assert_eq!(slot.address, wanted);
        assert_eq!(slot.offset, 0x0040_0000);
    }

    #[test]
    fn test_no_fixed_slot() {
        let config = MemoryConfig::default();
        let arena = space(&config);

        let err = resolve(RegionName::BoardRom, None, 64 * 1024, Some(&arena), &config).unwrap_err();
        assert!(matches!(err, Error::NoFixedSlot(RegionName::BoardRom)));

        let above = resolve(RegionName::Chip, Some(arena.end()), MIB, Some(&arena), &config);
        assert!(above.is_err());

        let filesys = resolve(RegionName::Filesys, None, 4096, Some(&arena), &config);
        assert!(filesys.is_err());

        let degraded = resolve(RegionName::Chip, None, MIB, None, &config);
        assert!(matches!(degraded, Err(Error::NoFixedSlot(RegionName::Chip))));
    }

    #[test]
    fn test_slot_must_fit() {
        let config = MemoryConfig::default();
        let arena = space(&config);
        // Zorro III space is not part of a 24-bit arena
        let z3 = resolve(RegionName::Z3, None, 16 * MIB, Some(&arena), &config);
        assert!(z3.is_err());
        let big_kick = resolve(RegionName::Kick, None, 16 * MIB, Some(&arena), &config);
        assert!(big_kick.is_err());
    }

    #[test]
    fn test_rtg_pool_slot() {
        let config = MemoryConfig {
            address_space: AddressSpace::Bits32,
            z3_fast_size: 16 * MIB,
            rtg: Some(RtgConfig { size: 4 * MIB, bus: RtgBus::Z3 }),
            ..Default::default()
        };
        let arena = space(&config);
        let (start, _) = arena.rtg_range().unwrap();

        let slot = resolve(RegionName::Z3Gfx, None, 4 * MIB, Some(&arena), &config).unwrap();
        assert!(!arena.rtg_is_separate());
        assert_eq!(slot.address, start);
        assert_eq!(slot.offset, start - arena.start());
        assert_ne!(slot.offset, 0);
        assert_eq!(slot.barrier, BARRIER);

        let too_big = resolve(RegionName::Z3Gfx, None, 8 * MIB, Some(&arena), &config);
        assert!(too_big.is_err());
    }
}
