//! The session facade tying host backend, arena and registry together.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::arena::{self, GuestAddressSpace};
use crate::backend::{self, HostMemory, Protection};
use crate::cache::CodeCache;
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::layout::plan_layout;
use crate::probe::CapacityBound;
use crate::region::RegionName;
use crate::segment::{Attachment, SegmentDescriptor, SegmentId, SegmentRegistry};

/// What changed when a new arena was reserved.
///
/// Every id in `invalidated` lost its arena pointer and must be attached
/// again before use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remap {
    /// Remap counter, starting at 1 for the first arena.
    pub generation: u64,
    /// Arena base address.
    pub base: usize,
    /// One past the end of the main reservation.
    pub end: usize,
    pub total_size: usize,
    /// Graphics pool start and length, when one was reserved.
    pub rtg: Option<(usize, usize)>,
    /// Segments whose carved attachments were dropped.
    pub invalidated: Vec<SegmentId>,
}

/// Guest memory for one emulated machine.
///
/// Owns the host backend, the arena (if one could be reserved) and the
/// segment registry. Use [`NaturalMemory::plan_and_reserve`] whenever the
/// memory configuration changes.
///
/// # Example
///
/// ```rust,no_run
/// use natmem::{MemoryConfig, NaturalMemory, RegionName};
///
/// let mut mem = NaturalMemory::new();
/// let config = MemoryConfig::builder().chip_mb(2).fast_mb(8).build()?;
/// mem.plan_and_reserve(&config)?;
///
/// let chip = mem.segment_create(RegionName::Chip, 2 * 1024 * 1024)?;
/// let att = mem.segment_attach(chip, None)?;
/// assert!(att.carved);
/// # Ok::<(), natmem::Error>(())
/// ```
pub struct NaturalMemory {
    host: Arc<dyn HostMemory>,
    bound: CapacityBound,
    config: MemoryConfig,
    arena: Option<GuestAddressSpace>,
    registry: SegmentRegistry,
    invalidated: Vec<SegmentId>,
    generation: u64,
}

impl NaturalMemory {
    /// Create a session on the native host backend. No arena is reserved yet.
    pub fn new() -> Self {
        Self::with_host(backend::native())
    }

    /// Create a session on a specific host backend.
    pub fn with_host(host: Arc<dyn HostMemory>) -> Self {
        let config = MemoryConfig::default();
        let bound = CapacityBound::new(host.capacity(), config.max_mem);
        Self {
            registry: SegmentRegistry::new(Arc::clone(&host)),
            host,
            bound,
            config,
            arena: None,
            invalidated: Vec::new(),
            generation: 0,
        }
    }

    /// Plan and reserve an arena for `config`, replacing the current one.
    ///
    /// A configuration that cannot fit the bound is rejected before anything
    /// is touched: the current arena, segments and configuration stay as
    /// they were. Once a plan is accepted the old arena is released and every
    /// carved segment is invalidated, whatever the reservation outcome. The
    /// invalidated ids are in the returned [`Remap`] and, on failure too, in
    /// [`NaturalMemory::last_invalidated`]. A failed reservation leaves the
    /// session without an arena and every attach is standalone.
    pub fn plan_and_reserve(&mut self, config: &MemoryConfig) -> Result<Remap> {
        let bound = CapacityBound::new(self.host.capacity(), config.max_mem);
        let plan = plan_layout(config, &bound)?;

        self.invalidated = self.registry.invalidate_carved();
        self.arena = None;
        self.bound = bound;
        self.config = config.clone();

        let mut space = match arena::reserve_plan(plan, &self.bound, &self.host) {
            Ok(space) => space,
            Err(err) => {
                warn!(
                    "running without a guest memory arena ({} segment(s) detached): {}",
                    self.invalidated.len(),
                    err
                );
                return Err(err);
            }
        };
        self.generation += 1;
        space.set_generation(self.generation);
        self.config = space.effective_config().clone();

        let remap = Remap {
            generation: self.generation,
            base: space.start(),
            end: space.end(),
            total_size: space.total_size(),
            rtg: space.rtg_range(),
            invalidated: self.invalidated.clone(),
        };
        self.arena = Some(space);
        Ok(remap)
    }

    /// Segments invalidated by the last [`NaturalMemory::plan_and_reserve`]
    /// that got past planning, whether or not its reservation succeeded.
    pub fn last_invalidated(&self) -> &[SegmentId] {
        &self.invalidated
    }

    /// Register a segment. See [`SegmentRegistry::create`].
    pub fn segment_create(&mut self, name: RegionName, size: usize) -> Result<SegmentId> {
        self.registry.create(name, size, &self.config)
    }

    /// Attach a segment. See [`SegmentRegistry::attach`].
    pub fn segment_attach(&mut self, id: SegmentId, nominal: Option<usize>) -> Result<Attachment> {
        self.registry.attach(id, nominal, self.arena.as_ref(), &self.config)
    }

    pub fn segment_detach(&mut self, id: SegmentId) -> Result<()> {
        self.registry.detach(id)
    }

    pub fn segment_destroy(&mut self, id: SegmentId) -> Result<()> {
        self.registry.destroy(id)
    }

    pub fn segment_stat(&self, id: SegmentId) -> Result<SegmentDescriptor> {
        self.registry.stat(id)
    }

    pub fn segment_find(&self, name: RegionName) -> Option<SegmentId> {
        self.registry.find(name)
    }

    /// Change a segment's protection. See [`SegmentRegistry::set_protection`].
    pub fn segment_protect(&mut self, id: SegmentId, protection: Protection) -> Result<Protection> {
        self.registry.set_protection(id, protection, self.arena.as_ref())
    }

    /// Destroy every segment attached at `addr`.
    pub fn release_address(&mut self, addr: usize) -> usize {
        self.registry.release_address(addr)
    }

    /// Allocate an executable block for translated code, outside the arena.
    pub fn cache_alloc(&self, size: usize) -> Result<CodeCache> {
        CodeCache::new(&self.host, size)
    }

    /// The segment table.
    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    /// The current arena, if one is reserved.
    pub fn arena(&self) -> Option<&GuestAddressSpace> {
        self.arena.as_ref()
    }

    /// Whether guest accesses can use the arena directly.
    pub fn has_fast_path(&self) -> bool {
        self.arena.is_some()
    }

    /// Check if `addr` lies in the arena or its graphics pool.
    pub fn contains(&self, addr: usize) -> bool {
        self.arena.as_ref().is_some_and(|arena| arena.contains(addr))
    }

    /// Configuration in effect: the shrunk one when an arena is reserved.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Capacity bound used for the last reservation.
    pub fn bound(&self) -> &CapacityBound {
        &self.bound
    }

    /// Remap counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Release the arena and every segment.
    pub fn teardown(&mut self) {
        self.registry.clear();
        self.arena = None;
    }
}

impl Default for NaturalMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NaturalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NaturalMemory")
            .field("host", &self.host.name())
            .field("arena", &self.arena)
            .field("segments", &self.registry.len())
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for NaturalMemory {
    fn drop(&mut self) {
        // segments before the arena they may point into
        self.teardown();
    }
}
