//! Arena reservation: one large address-space reservation per session.
//!
//! [`reserve_plan`] owns the retry loop around the pure planner. Each round
//! reserves the current [`LayoutPlan`]; when the host refuses, the plan is
//! shrunk by one round and the reservation is tried again.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{HostMemory, Protection, Reservation};
use crate::config::MemoryConfig;
use crate::debug_arena;
use crate::error::{Error, Result};
use crate::layout::{plan_layout, LayoutPlan, LayoutRegion, MAX_ROUNDS, MIN_RETRY_SIZE};
use crate::probe::CapacityBound;

/// Where the graphics pool lives.
enum RtgPool {
    /// A sub-range of the main reservation.
    Inside { offset: usize, len: usize },
    /// A reservation of its own.
    Separate(Reservation),
}

/// The reserved arena of one emulated session.
///
/// Offsets inside the arena mirror guest physical addresses. The base never
/// moves; a new arena means a new `GuestAddressSpace`.
pub struct GuestAddressSpace {
    main: Reservation,
    rtg: Option<RtgPool>,
    config: MemoryConfig,
    shrink_rounds: u32,
    rounds: u32,
    generation: u64,
}

impl GuestAddressSpace {
    /// First byte of the arena.
    pub fn base(&self) -> NonNull<u8> {
        self.main.base()
    }

    /// Base address as an integer.
    pub fn start(&self) -> usize {
        self.main.start()
    }

    /// One past the last byte of the main reservation.
    pub fn end(&self) -> usize {
        self.main.end()
    }

    /// Bytes in the main reservation.
    pub fn total_size(&self) -> usize {
        self.main.len()
    }

    /// Start and length of the graphics pool, if one was reserved.
    pub fn rtg_range(&self) -> Option<(usize, usize)> {
        match self.rtg.as_ref()? {
            RtgPool::Inside { offset, len } => Some((self.start() + offset, *len)),
            RtgPool::Separate(pool) => Some((pool.start(), pool.len())),
        }
    }

    /// Whether the graphics pool is a reservation of its own.
    pub fn rtg_is_separate(&self) -> bool {
        matches!(self.rtg, Some(RtgPool::Separate(_)))
    }

    /// Check if `addr` lies in the arena or in the graphics pool.
    pub fn contains(&self, addr: usize) -> bool {
        self.main.contains(addr) || self.rtg_contains_range(addr, 1)
    }

    /// Check if `[addr, addr + len)` lies entirely in the main reservation.
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        self.main.contains_range(addr, len)
    }

    /// Check if `[addr, addr + len)` lies entirely in the graphics pool.
    pub fn rtg_contains_range(&self, addr: usize, len: usize) -> bool {
        match self.rtg_range() {
            Some((start, size)) => match addr.checked_add(len) {
                Some(end) => addr >= start && end <= start + size,
                None => false,
            },
            None => false,
        }
    }

    /// Configuration the arena was laid out for, after any shrinking.
    pub fn effective_config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Protection requested for pages committed in this arena.
    pub fn default_protection(&self) -> Protection {
        if self.config.executable {
            Protection::READ_WRITE_EXECUTE
        } else {
            Protection::READ_WRITE
        }
    }

    /// Remap counter of the session that created this arena.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Reservation rounds it took to obtain the arena.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Planner shrink rounds behind the effective configuration.
    pub fn shrink_rounds(&self) -> u32 {
        self.shrink_rounds
    }

    /// Commit the pages covering `[addr, addr + len)` in whichever
    /// reservation holds them.
    pub fn commit(&self, addr: usize, len: usize, protection: Protection) -> Result<Protection> {
        match &self.rtg {
            Some(RtgPool::Separate(pool)) if pool.contains(addr) => pool.commit(addr, len, protection),
            _ => self.main.commit(addr, len, protection),
        }
    }

    /// Change the protection of committed pages covering `[addr, addr + len)`.
    pub fn protect(&self, addr: usize, len: usize, protection: Protection) -> Result<Protection> {
        match &self.rtg {
            Some(RtgPool::Separate(pool)) if pool.contains(addr) => pool.protect(addr, len, protection),
            _ => self.main.protect(addr, len, protection),
        }
    }
}

impl fmt::Debug for GuestAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestAddressSpace")
            .field("base", &format_args!("{:#x}", self.start()))
            .field("total_size", &self.total_size())
            .field("rtg", &self.rtg_range())
            .field("generation", &self.generation)
            .finish()
    }
}

enum Attempt {
    Reserved(Reservation, Option<RtgPool>),
    /// The main range fit but the graphics pool did not.
    RtgRefused,
}

fn attempt(plan: &LayoutPlan, host: &Arc<dyn HostMemory>) -> Result<Attempt> {
    let err = match Reservation::new(host, plan.total_size()) {
        Ok(main) => {
            let pool = plan.region(LayoutRegion::Rtg).map(|rtg| RtgPool::Inside {
                offset: rtg.offset,
                len: rtg.size + rtg.barrier,
            });
            return Ok(Attempt::Reserved(main, pool));
        }
        Err(err) => err,
    };

    let Some((main_len, pool_len)) = plan.split_sizes() else {
        return Err(err);
    };
    debug_arena!(
        "combined {}M refused, trying {}M + {}M",
        plan.total_size() >> 20,
        main_len >> 20,
        pool_len >> 20
    );
    let main = Reservation::new(host, main_len)?;
    match Reservation::new(host, pool_len) {
        Ok(pool) => Ok(Attempt::Reserved(main, Some(RtgPool::Separate(pool)))),
        Err(_) => Ok(Attempt::RtgRefused),
    }
}

/// Reserve an arena for `config` under `bound`.
///
/// Fails with [`Error::CapacityExceeded`] when no plan fits the bound and
/// with [`Error::ReservationFailed`] when the host refuses every plan the
/// retry loop is willing to try.
pub fn reserve(
    config: &MemoryConfig,
    bound: &CapacityBound,
    host: &Arc<dyn HostMemory>,
) -> Result<GuestAddressSpace> {
    reserve_plan(plan_layout(config, bound)?, bound, host)
}

/// Reserve an arena for an already accepted `plan`, shrinking it within
/// `bound` whenever the host refuses.
pub fn reserve_plan(
    mut plan: LayoutPlan,
    bound: &CapacityBound,
    host: &Arc<dyn HostMemory>,
) -> Result<GuestAddressSpace> {
    let mut rounds = 0;

    loop {
        rounds += 1;
        if rounds > MAX_ROUNDS || (rounds > 1 && plan.total_size() < MIN_RETRY_SIZE) {
            warn!(
                "no arena could be reserved ({} rounds, last plan {}M)",
                rounds - 1,
                plan.total_size() >> 20
            );
            return Err(Error::ReservationFailed {
                rounds: rounds - 1,
                size: plan.total_size(),
            });
        }
        debug_arena!("round {}: reserving {}M", rounds, plan.total_size() >> 20);

        match attempt(&plan, host) {
            Ok(Attempt::Reserved(main, rtg)) => {
                let space = GuestAddressSpace {
                    main,
                    rtg,
                    config: plan.config().clone(),
                    shrink_rounds: plan.shrink_rounds(),
                    rounds,
                    generation: 0,
                };
                info!(
                    "reserved {}M arena at {:#x} after {} round(s) ({} backend)",
                    space.total_size() >> 20,
                    space.start(),
                    rounds,
                    host.name()
                );
                if let Some((start, len)) = space.rtg_range() {
                    debug_arena!("graphics pool {}K at {:#x}", len >> 10, start);
                }
                return Ok(space);
            }
            Ok(Attempt::RtgRefused) => {
                warn!("graphics pool could not be reserved, disabling it");
                plan = plan.without_rtg();
            }
            Err(err) => {
                warn!("{}M arena refused: {}", plan.total_size() >> 20, err);
                plan = plan.shrink(bound).map_err(|_| Error::ReservationFailed {
                    rounds,
                    size: plan.total_size(),
                })?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::native;
    use crate::config::{AddressSpace, MaxMem, RtgBus, RtgConfig, MIB};
    use crate::layout::GUARD_PAGES;

    fn bound_for(host: &Arc<dyn HostMemory>) -> CapacityBound {
        CapacityBound::new(host.capacity(), MaxMem::Ceiling)
    }

    #[test]
    fn test_reserve_window_only() {
        let host = native();
        let page = host.capacity().page_size;
        let config = MemoryConfig::default();
        let space = reserve(&config, &bound_for(&host), &host).unwrap();

        assert_eq!(space.end() - space.start(), space.total_size());
        assert_eq!(space.total_size(), 16 * MIB + GUARD_PAGES * page);
        assert_eq!(space.rounds(), 1);
        assert_eq!(space.effective_config(), &config);
        assert!(space.contains(space.start()));
        assert!(!space.contains(space.end()));
        assert!(space.rtg_range().is_none());
    }

    #[test]
    fn test_reserve_with_rtg_pool() {
        let host = native();
        let config = MemoryConfig {
            address_space: AddressSpace::Bits32,
            z3_fast_size: 32 * MIB,
            rtg: Some(RtgConfig { size: 8 * MIB, bus: RtgBus::Z3 }),
            ..Default::default()
        };
        let space = reserve(&config, &bound_for(&host), &host).unwrap();
        let (start, len) = space.rtg_range().unwrap();
        assert!(!space.rtg_is_separate());
        assert!(len > 8 * MIB);
        assert!(space.contains(start));
        assert!(space.rtg_contains_range(start, 8 * MIB));
        assert!(!space.rtg_contains_range(start, len + 1));
    }

    #[test]
    fn test_commit_in_arena() {
        let host = native();
        let space = reserve(&MemoryConfig::default(), &bound_for(&host), &host).unwrap();
        let addr = space.start() + 0x0020_0000;
        let applied = space.commit(addr, 4096, Protection::READ_WRITE).unwrap();
        assert!(applied.contains(Protection::READ_WRITE));
        unsafe {
            (addr as *mut u32).write(0xDEAD_BEEF);
            assert_eq!((addr as *const u32).read(), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn test_reserve_capacity_exceeded() {
        let host = native();
        let config = MemoryConfig {
            address_space: AddressSpace::Bits32,
            ..Default::default()
        };
        let bound = CapacityBound::new(host.capacity(), MaxMem::Limit(64));
        let err = reserve(&config, &bound, &host).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
    }
}
