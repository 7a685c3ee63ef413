//! Error types for natmem.

use thiserror::Error;

use crate::region::RegionName;
use crate::segment::SegmentId;

/// Result type alias using natmem's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while planning, reserving or handing out guest memory.
///
/// Every variant is recoverable. Apart from [`Error::ReservationFailed`],
/// which leaves the session without an arena, the arena and the segment
/// registry keep the state they had before the failing call.
#[derive(Error, Debug)]
pub enum Error {
    // Planning errors
    #[error("memory configuration does not fit: {requested} bytes requested, bound is {bound} bytes")]
    CapacityExceeded { requested: usize, bound: usize },

    #[error("invalid memory configuration: {0}")]
    InvalidConfig(String),

    // Reservation errors
    #[error("no arena could be reserved after {rounds} rounds (last attempt {size} bytes)")]
    ReservationFailed { rounds: u32, size: usize },

    // Placement errors
    #[error("no fixed arena slot for region '{0}'")]
    NoFixedSlot(RegionName),

    // Registry errors
    #[error("segment table full ({0} entries)")]
    TableFull(usize),

    #[error("no such segment: {0}")]
    InvalidSegment(SegmentId),

    #[error("invalid segment size: {0}")]
    InvalidSize(usize),

    // Host memory errors
    #[error("host allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: usize, reason: String },

    #[error("host memory error: {0}")]
    Host(#[from] std::io::Error),
}

impl Error {
    /// Build an [`Error::AllocationFailed`] from the last OS error.
    pub(crate) fn allocation_failed(size: usize) -> Self {
        Error::AllocationFailed {
            size,
            reason: std::io::Error::last_os_error().to_string(),
        }
    }

    /// Whether the error left the session without a fast-path arena.
    pub fn is_degrading(&self) -> bool {
        matches!(self, Error::ReservationFailed { .. })
    }
}
