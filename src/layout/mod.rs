//! Arena layout planning.
//!
//! [`plan_layout`] is pure: it turns a [`MemoryConfig`](crate::MemoryConfig)
//! and a [`CapacityBound`](crate::probe::CapacityBound) into a
//! [`LayoutPlan`], shrinking optional regions by [`SHRINK_POLICY`] until the
//! plan fits. The retry loop that reacts to host refusals lives in
//! [`crate::arena`].

mod plan;
mod shrink;

pub use plan::{plan_layout, LayoutPlan, LayoutRegion, PlannedRegion};
pub use shrink::{
    next_step, ShrinkRecord, ShrinkStep, RTG_MIN, SHRINK_POLICY, Z3_CHIP_DROP_LIMIT,
    Z3_FAST2_MIN, Z3_SHRINK_THRESHOLD,
};

use crate::config::MIB;

/// Pages left unmapped after the last region.
pub const GUARD_PAGES: usize = 16;

/// Upper bound on reservation rounds.
pub const MAX_ROUNDS: u32 = 20;

/// After the first round, plans smaller than this are not retried.
pub const MIN_RETRY_SIZE: usize = 256 * MIB;
