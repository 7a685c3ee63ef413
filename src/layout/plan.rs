//! Layout planning: from a memory configuration to an arena size.

use std::fmt;

use crate::backend::align_to_page;
use crate::config::{MemoryConfig, MIB};
use crate::error::{Error, Result};
use crate::layout::shrink::{next_step, ShrinkRecord};
use crate::layout::GUARD_PAGES;
use crate::probe::CapacityBound;
use crate::debug_layout;

/// Alignment the Zorro III fast tiers are padded to before the graphics pool.
const Z3_RTG_ALIGN: usize = 16 * MIB;

/// Kind of an entry in a [`LayoutPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutRegion {
    /// The low guest window: chip, Zorro II, ROMs and peripheral windows.
    Window,
    Z3Fast,
    Z3Fast2,
    Z3Chip,
    /// Graphics card pool.
    Rtg,
    /// Trailing guard pages.
    Guard,
}

impl fmt::Display for LayoutRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayoutRegion::Window => "window",
            LayoutRegion::Z3Fast => "z3",
            LayoutRegion::Z3Fast2 => "z3_2",
            LayoutRegion::Z3Chip => "z3_chip",
            LayoutRegion::Rtg => "rtg",
            LayoutRegion::Guard => "guard",
        };
        f.write_str(name)
    }
}

/// One entry of a layout: a region, where it starts, and the padding after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRegion {
    pub region: LayoutRegion,
    /// Offset from the arena base.
    pub offset: usize,
    /// Nominal size in bytes.
    pub size: usize,
    /// Padding reserved after the region.
    pub barrier: usize,
}

impl PlannedRegion {
    /// Offset one past the region's padding.
    pub fn end(&self) -> usize {
        self.offset + self.size + self.barrier
    }
}

/// A candidate arena layout.
///
/// Plans are values: shrinking produces a new plan and never touches the
/// caller's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPlan {
    regions: Vec<PlannedRegion>,
    total_size: usize,
    page_size: usize,
    config: MemoryConfig,
    history: Vec<ShrinkRecord>,
    rounds: u32,
}

/// Plan an arena for `config` that fits under `bound`.
///
/// Optional regions are shrunk by the shrink policy until the plan fits.
/// Fails with [`Error::CapacityExceeded`] when nothing is left to shrink.
pub fn plan_layout(config: &MemoryConfig, bound: &CapacityBound) -> Result<LayoutPlan> {
    let mut plan = LayoutPlan::compute(config.clone(), bound.page_size(), Vec::new(), 0);
    let requested = plan.total_size;
    debug_layout!(
        "planning {}M arena against a {}M bound",
        requested >> 20,
        bound.bytes() >> 20
    );

    while !bound.fits(plan.total_size) {
        let before = plan.total_size;
        plan = plan.shrink_round().ok_or(Error::CapacityExceeded {
            requested,
            bound: bound.bytes(),
        })?;
        debug_layout!(
            "round {}: {}M > {}M, now {}M",
            plan.rounds,
            before >> 20,
            bound.bytes() >> 20,
            plan.total_size >> 20
        );
    }

    Ok(plan)
}

impl LayoutPlan {
    fn compute(config: MemoryConfig, page_size: usize, history: Vec<ShrinkRecord>, rounds: u32) -> Self {
        let mut regions = Vec::with_capacity(6);
        let window = config.address_space.window_size();
        regions.push(PlannedRegion {
            region: LayoutRegion::Window,
            offset: 0,
            size: window,
            barrier: 0,
        });
        let mut cursor = window;

        if config.has_z3_space() && config.z3_total() > 0 {
            cursor = cursor.max(config.z3_fast_start as usize);
            for (region, size) in [
                (LayoutRegion::Z3Fast, config.z3_fast_size),
                (LayoutRegion::Z3Fast2, config.z3_fast2_size),
            ] {
                if size > 0 {
                    regions.push(PlannedRegion {
                        region,
                        offset: cursor,
                        size,
                        barrier: 0,
                    });
                    cursor += size;
                }
            }
            if config.z3_chip_size > 0 {
                let gap = config.z3_chip_gap();
                pad_last(&mut regions, gap);
                cursor += gap;
                regions.push(PlannedRegion {
                    region: LayoutRegion::Z3Chip,
                    offset: cursor,
                    size: config.z3_chip_size,
                    barrier: 0,
                });
                cursor += config.z3_chip_size;
            }
        }

        let rtg_size = if config.has_z3_space() { config.z3_rtg_size() } else { 0 };
        if rtg_size > 0 {
            if config.z3_total() > 0 {
                let gap = Z3_RTG_ALIGN - (config.z3_fast_total() & (Z3_RTG_ALIGN - 1));
                pad_last(&mut regions, gap);
                cursor += gap;
            }
            regions.push(PlannedRegion {
                region: LayoutRegion::Rtg,
                offset: cursor,
                size: rtg_size,
                barrier: page_size,
            });
            cursor += rtg_size + page_size;
        }

        regions.push(PlannedRegion {
            region: LayoutRegion::Guard,
            offset: cursor,
            size: GUARD_PAGES * page_size,
            barrier: 0,
        });
        cursor += GUARD_PAGES * page_size;

        Self {
            regions,
            total_size: align_to_page(cursor, page_size),
            page_size,
            config,
            history,
            rounds,
        }
    }

    /// Apply one shrink round.
    ///
    /// Steps are taken until the total actually drops, so a round always
    /// frees memory. `None` when no step applies.
    fn shrink_round(&self) -> Option<LayoutPlan> {
        let mut config = self.config.clone();
        let mut history = self.history.clone();
        let mut total = self.total_size;

        loop {
            let step = next_step(&config)?;
            step.apply(&mut config);
            let after = Self::compute(config.clone(), self.page_size, Vec::new(), 0).total_size;
            history.push(ShrinkRecord {
                step,
                freed: total.saturating_sub(after),
                total_after: after,
            });
            debug_layout!("{}: {}M -> {}M", step, total >> 20, after >> 20);
            total = total.min(after);
            if after < self.total_size {
                return Some(Self::compute(config, self.page_size, history, self.rounds + 1));
            }
        }
    }

    /// Shrink by one round and then until the plan fits under `bound`.
    ///
    /// Used when the host refuses a plan that was already under the bound.
    pub fn shrink(&self, bound: &CapacityBound) -> Result<LayoutPlan> {
        let exceeded = || Error::CapacityExceeded {
            requested: self.total_size,
            bound: bound.bytes(),
        };
        let mut plan = self.shrink_round().ok_or_else(exceeded)?;
        while !bound.fits(plan.total_size) {
            plan = plan.shrink_round().ok_or_else(exceeded)?;
        }
        Ok(plan)
    }

    /// The same plan with the graphics pool removed.
    pub fn without_rtg(&self) -> LayoutPlan {
        let mut config = self.config.clone();
        config.rtg = None;
        Self::compute(config, self.page_size, self.history.clone(), self.rounds)
    }

    /// Planned entries, in arena order.
    pub fn regions(&self) -> &[PlannedRegion] {
        &self.regions
    }

    /// Entry for `region`, if planned.
    pub fn region(&self, region: LayoutRegion) -> Option<&PlannedRegion> {
        self.regions.iter().find(|r| r.region == region)
    }

    /// Bytes to reserve.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Page size the plan was rounded to.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Configuration after shrinking.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Every shrink step taken to reach this plan.
    pub fn shrink_history(&self) -> &[ShrinkRecord] {
        &self.history
    }

    /// Number of shrink rounds taken to reach this plan.
    pub fn shrink_rounds(&self) -> u32 {
        self.rounds
    }

    /// Sizes of the main range and the graphics pool when reserved apart.
    ///
    /// The main range keeps everything before the pool plus the guard pages.
    pub fn split_sizes(&self) -> Option<(usize, usize)> {
        let rtg = self.region(LayoutRegion::Rtg)?;
        let main = align_to_page(rtg.offset + GUARD_PAGES * self.page_size, self.page_size);
        Some((main, rtg.size + rtg.barrier))
    }
}

fn pad_last(regions: &mut [PlannedRegion], padding: usize) {
    if let Some(last) = regions.last_mut() {
        last.barrier += padding;
    }
}

impl fmt::Display for LayoutPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.regions {
            writeln!(
                f,
                "{:>8} {:#011x} {:>6}K (+{}K)",
                r.region.to_string(),
                r.offset,
                r.size >> 10,
                r.barrier >> 10
            )?;
        }
        write!(f, "   total {:#011x} {:>6}M", self.total_size, self.total_size >> 20)
    }
}
