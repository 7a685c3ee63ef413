//! Segment registry: named, sized guest memory blocks.
//!
//! Each row moves through `Created -> Attached <-> Detached` and back to
//! unused on destroy. Attaching places the segment in its arena slot when the
//! resolver finds one and the host commits the pages; otherwise the segment
//! gets a zeroed standalone block of its own.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::warn;

use crate::arena::GuestAddressSpace;
use crate::backend::{HostBlock, HostMemory, Protection};
use crate::config::MemoryConfig;
use crate::debug_segment;
use crate::error::{Error, Result};
use crate::region::RegionName;
use crate::resolver;

/// Capacity of the segment table.
pub const MAX_SEGMENTS: usize = 1024;

/// Index of a row in the segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u32);

impl SegmentId {
    /// Row index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a live row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Created, never attached (or invalidated by a remap).
    Created,
    Attached,
    /// Detached; the memory is kept.
    Detached,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentState::Created => write!(f, "created"),
            SegmentState::Attached => write!(f, "attached"),
            SegmentState::Detached => write!(f, "detached"),
        }
    }
}

/// Where a segment's memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Not placed yet.
    Unassigned,
    /// Carved from the arena at `offset`.
    Arena { offset: usize },
    /// A standalone host block.
    Standalone,
}

/// Pointer handed to the caller by attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// First byte of the segment.
    pub ptr: NonNull<u8>,
    /// Requested size in bytes.
    pub len: usize,
    /// Whether the memory lives inside the arena.
    pub carved: bool,
}

// Safety: an Attachment is an address, not an owner; the registry keeps the
// backing memory alive until destroy or remap.
unsafe impl Send for Attachment {}
unsafe impl Sync for Attachment {}

/// Read-only view of a registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub id: SegmentId,
    pub name: RegionName,
    pub placement: Placement,
    pub requested_size: usize,
    /// Requested size plus barrier padding.
    pub effective_size: usize,
    pub state: SegmentState,
    /// Host address, once attached.
    pub address: Option<usize>,
    pub carved_from_arena: bool,
    /// Protection applied to the backing pages, once attached.
    pub protection: Option<Protection>,
}

enum Backing {
    /// A view into the arena. The arena owns the pages.
    Arena(NonNull<u8>),
    Block(HostBlock),
}

impl Backing {
    fn ptr(&self) -> NonNull<u8> {
        match self {
            Backing::Arena(ptr) => *ptr,
            Backing::Block(block) => block.as_ptr(),
        }
    }
}

struct Row {
    name: RegionName,
    requested_size: usize,
    effective_size: usize,
    placement: Placement,
    state: SegmentState,
    /// Protection set explicitly with `set_protection`.
    wanted: Option<Protection>,
    applied: Option<Protection>,
    backing: Option<Backing>,
}

impl Row {
    fn attachment(&self) -> Option<Attachment> {
        self.backing.as_ref().map(|backing| Attachment {
            ptr: backing.ptr(),
            len: self.requested_size,
            carved: matches!(backing, Backing::Arena(_)),
        })
    }
}

fn default_protection(arena: Option<&GuestAddressSpace>, config: &MemoryConfig) -> Protection {
    match arena {
        Some(arena) => arena.default_protection(),
        None if config.executable => Protection::READ_WRITE_EXECUTE,
        None => Protection::READ_WRITE,
    }
}

/// Fixed-capacity table of named segments.
pub struct SegmentRegistry {
    host: Arc<dyn HostMemory>,
    rows: Vec<Option<Row>>,
    free: Vec<u32>,
    live: usize,
}

// Safety: rows only hold addresses into the arena or blocks they own.
unsafe impl Send for SegmentRegistry {}
unsafe impl Sync for SegmentRegistry {}

impl SegmentRegistry {
    /// Create an empty registry allocating standalone blocks through `host`.
    pub fn new(host: Arc<dyn HostMemory>) -> Self {
        Self {
            host,
            rows: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn row(&self, id: SegmentId) -> Result<&Row> {
        self.rows
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidSegment(id))
    }

    fn row_mut(&mut self, id: SegmentId) -> Result<&mut Row> {
        self.rows
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidSegment(id))
    }

    /// Register a segment of `size` bytes named `name`.
    ///
    /// No memory is committed until the segment is attached.
    pub fn create(&mut self, name: RegionName, size: usize, config: &MemoryConfig) -> Result<SegmentId> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.rows.len() < MAX_SEGMENTS => {
                self.rows.push(None);
                (self.rows.len() - 1) as u32
            }
            None => return Err(Error::TableFull(MAX_SEGMENTS)),
        };

        self.rows[index as usize] = Some(Row {
            name,
            requested_size: size,
            effective_size: name.effective_size(size, config),
            placement: Placement::Unassigned,
            state: SegmentState::Created,
            wanted: None,
            applied: None,
            backing: None,
        });
        self.live += 1;

        let id = SegmentId(index);
        debug_segment!("create {} {} ({} bytes)", id, name, size);
        Ok(id)
    }

    /// Attach a segment and return its memory.
    ///
    /// Attaching an attached or detached segment returns the pointer it
    /// already has. A failed allocation leaves the row `Created`.
    pub fn attach(
        &mut self,
        id: SegmentId,
        nominal: Option<usize>,
        arena: Option<&GuestAddressSpace>,
        config: &MemoryConfig,
    ) -> Result<Attachment> {
        let host = Arc::clone(&self.host);
        let row = self.row_mut(id)?;
        if let Some(attachment) = row.attachment() {
            row.state = SegmentState::Attached;
            return Ok(attachment);
        }

        let name = row.name;
        let requested = row.requested_size;
        let effective = name.effective_size(requested, config);
        let wanted = row.wanted.unwrap_or_else(|| default_protection(arena, config));

        let slot = match resolver::resolve(name, nominal, requested, arena, config) {
            Ok(slot) => Some(slot),
            Err(Error::NoFixedSlot(_)) => None,
            Err(err) => return Err(err),
        };
        let carved = match (slot, arena) {
            (Some(slot), Some(arena)) => match arena.commit(slot.address, effective, wanted) {
                Ok(applied) => {
                    NonNull::new(slot.address as *mut u8).map(|ptr| (ptr, slot.offset, applied))
                }
                Err(err) => {
                    warn!(
                        "{} ({}): commit at {:#x} failed, using a standalone block: {}",
                        id, name, slot.address, err
                    );
                    None
                }
            },
            (None, Some(_)) if name.has_slot() => {
                warn!("{} ({}): no room in the arena, using a standalone block", id, name);
                None
            }
            _ => None,
        };

        match carved {
            Some((ptr, offset, applied)) => {
                row.backing = Some(Backing::Arena(ptr));
                row.placement = Placement::Arena { offset };
                row.applied = Some(applied);
                debug_segment!("attach {} {} at arena+{:#x} ({})", id, name, offset, applied);
            }
            None => {
                let block = HostBlock::new(&host, effective, wanted)?;
                row.applied = Some(block.protection());
                row.backing = Some(Backing::Block(block));
                row.placement = Placement::Standalone;
                debug_segment!("attach {} {} standalone ({} bytes)", id, name, effective);
            }
        }
        row.effective_size = effective;
        row.state = SegmentState::Attached;

        row.attachment().ok_or(Error::InvalidSegment(id))
    }

    /// Mark a segment detached. The memory stays valid.
    pub fn detach(&mut self, id: SegmentId) -> Result<()> {
        let row = self.row_mut(id)?;
        if row.state == SegmentState::Attached {
            row.state = SegmentState::Detached;
            debug_segment!("detach {} {}", id, row.name);
        }
        Ok(())
    }

    /// Remove a segment, freeing its standalone block if it has one.
    ///
    /// Arena pages are only given back when the whole arena goes.
    pub fn destroy(&mut self, id: SegmentId) -> Result<()> {
        let row = self.remove(id.index()).ok_or(Error::InvalidSegment(id))?;
        debug_segment!("destroy {} {} ({:?})", id, row.name, row.placement);
        Ok(())
    }

    fn remove(&mut self, index: usize) -> Option<Row> {
        let row = self.rows.get_mut(index).and_then(Option::take)?;
        self.free.push(index as u32);
        self.live -= 1;
        Some(row)
    }

    /// Snapshot of one row.
    pub fn stat(&self, id: SegmentId) -> Result<SegmentDescriptor> {
        self.row(id).map(|row| describe(id, row))
    }

    /// First live segment named `name`.
    pub fn find(&self, name: RegionName) -> Option<SegmentId> {
        self.rows
            .iter()
            .position(|row| row.as_ref().is_some_and(|row| row.name == name))
            .map(|index| SegmentId(index as u32))
    }

    /// Detach and destroy every segment attached at `addr`.
    ///
    /// Returns how many segments were released.
    pub fn release_address(&mut self, addr: usize) -> usize {
        let indices: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                row.as_ref()
                    .and_then(Row::attachment)
                    .is_some_and(|att| att.ptr.as_ptr() as usize == addr)
            })
            .map(|(index, _)| index)
            .collect();

        let mut released = 0;
        for index in indices {
            if let Some(row) = self.remove(index) {
                debug_segment!("release {} {} at {:#x}", SegmentId(index as u32), row.name, addr);
                released += 1;
            }
        }
        released
    }

    /// Change the protection of a segment.
    ///
    /// Applied at once when the segment has memory, otherwise on attach.
    /// Returns the protection in effect.
    pub fn set_protection(
        &mut self,
        id: SegmentId,
        protection: Protection,
        arena: Option<&GuestAddressSpace>,
    ) -> Result<Protection> {
        let row = self.row_mut(id)?;
        row.wanted = Some(protection);
        let effective = row.effective_size;
        let applied = match row.backing.as_mut() {
            Some(Backing::Block(block)) => block.protect(protection)?,
            Some(Backing::Arena(ptr)) => match arena {
                Some(arena) => arena.protect(ptr.as_ptr() as usize, effective, protection)?,
                None => return Err(Error::InvalidSegment(id)),
            },
            None => return Ok(protection),
        };
        row.applied = Some(applied);
        debug_segment!("protect {} {} {}", id, row.name, applied);
        Ok(applied)
    }

    /// Drop every arena-carved attachment.
    ///
    /// Affected rows return to `Created` and must be attached again. Returns
    /// their ids.
    pub fn invalidate_carved(&mut self) -> Vec<SegmentId> {
        let mut invalidated = Vec::new();
        for (index, slot) in self.rows.iter_mut().enumerate() {
            let Some(row) = slot.as_mut() else { continue };
            if matches!(row.backing, Some(Backing::Arena(_))) {
                row.backing = None;
                row.placement = Placement::Unassigned;
                row.state = SegmentState::Created;
                row.applied = None;
                invalidated.push(SegmentId(index as u32));
            }
        }
        if !invalidated.is_empty() {
            debug_segment!("invalidated {} carved segment(s)", invalidated.len());
        }
        invalidated
    }

    /// Snapshots of every live row, in id order.
    pub fn iter(&self) -> impl Iterator<Item = SegmentDescriptor> + '_ {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(index, row)| row.as_ref().map(|row| describe(SegmentId(index as u32), row)))
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Destroy every row.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.free.clear();
        self.live = 0;
    }
}

fn describe(id: SegmentId, row: &Row) -> SegmentDescriptor {
    let attachment = row.attachment();
    SegmentDescriptor {
        id,
        name: row.name,
        placement: row.placement,
        requested_size: row.requested_size,
        effective_size: row.effective_size,
        state: row.state,
        address: attachment.map(|a| a.ptr.as_ptr() as usize),
        carved_from_arena: attachment.is_some_and(|a| a.carved),
        protection: row.applied,
    }
}

impl fmt::Debug for SegmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentRegistry")
            .field("live", &self.live)
            .field("capacity", &MAX_SEGMENTS)
            .field("host", &self.host.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::reserve;
    use crate::backend::native;
    use crate::config::{MaxMem, MIB};
    use crate::probe::CapacityBound;
    use crate::region::BARRIER;

    fn setup() -> (SegmentRegistry, GuestAddressSpace, MemoryConfig) {
        let host = native();
        let config = MemoryConfig {
            chip_size: 2 * MIB,
            ..Default::default()
        };
        let bound = CapacityBound::new(host.capacity(), MaxMem::Ceiling);
        let arena = reserve(&config, &bound, &host).unwrap();
        (SegmentRegistry::new(host), arena, config)
    }

    #[test]
    fn test_create_attach_carved() {
        let (mut reg, arena, config) = setup();
        let id = reg.create(RegionName::Chip, 2 * MIB, &config).unwrap();
        assert_eq!(reg.stat(id).unwrap().state, SegmentState::Created);

        let att = reg.attach(id, None, Some(&arena), &config).unwrap();
        assert!(att.carved);
        assert_eq!(att.ptr.as_ptr() as usize, arena.start());
        assert_eq!(att.len, 2 * MIB);

        let desc = reg.stat(id).unwrap();
        assert_eq!(desc.state, SegmentState::Attached);
        assert_eq!(desc.placement, Placement::Arena { offset: 0 });
        assert!(desc.carved_from_arena);

        unsafe {
            let p = att.ptr.as_ptr();
            p.add(2 * MIB - 1).write(0x5A);
            assert_eq!(p.add(2 * MIB - 1).read(), 0x5A);
        }
    }

    #[test]
    fn test_attach_is_idempotent() {
        let (mut reg, arena, config) = setup();
        let id = reg.create(RegionName::Kick, 512 * 1024, &config).unwrap();
        let first = reg.attach(id, None, Some(&arena), &config).unwrap();
        let second = reg.attach(id, None, Some(&arena), &config).unwrap();
        assert_eq!(first, second);

        reg.detach(id).unwrap();
        assert_eq!(reg.stat(id).unwrap().state, SegmentState::Detached);
        let again = reg.attach(id, None, Some(&arena), &config).unwrap();
        assert_eq!(first.ptr, again.ptr);
    }

    #[test]
    fn test_barrier_sizes() {
        let (mut reg, _arena, config) = setup();
        let kick = reg.create(RegionName::Kick, 512 * 1024, &config).unwrap();
        let rom = reg.create(RegionName::RomE0, 512 * 1024, &config).unwrap();
        let kick = reg.stat(kick).unwrap();
        assert_eq!(kick.effective_size - kick.requested_size, BARRIER);
        let rom = reg.stat(rom).unwrap();
        assert_eq!(rom.effective_size, rom.requested_size);
    }

    #[test]
    fn test_no_slot_is_standalone() {
        let (mut reg, arena, config) = setup();
        let id = reg.create(RegionName::BoardRom, 64 * 1024, &config).unwrap();
        let att = reg.attach(id, None, Some(&arena), &config).unwrap();
        assert!(!att.carved);
        assert!(!arena.contains(att.ptr.as_ptr() as usize));
        assert_eq!(reg.stat(id).unwrap().placement, Placement::Standalone);

        let bytes = unsafe { std::slice::from_raw_parts(att.ptr.as_ptr(), att.len) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_filesys_always_standalone() {
        let (mut reg, arena, config) = setup();
        let id = reg.create(RegionName::Filesys, 4096, &config).unwrap();
        let att = reg.attach(id, None, Some(&arena), &config).unwrap();
        assert!(!att.carved);
    }

    #[test]
    fn test_degraded_attach() {
        let (mut reg, _arena, config) = setup();
        let id = reg.create(RegionName::Chip, MIB, &config).unwrap();
        let att = reg.attach(id, None, None, &config).unwrap();
        assert!(!att.carved);
        assert_eq!(reg.stat(id).unwrap().placement, Placement::Standalone);
    }

    #[test]
    fn test_zero_size_rejected() {
        let (mut reg, _arena, config) = setup();
        let err = reg.create(RegionName::Chip, 0, &config).unwrap_err();
        assert!(matches!(err, Error::InvalidSize(0)));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_destroy_recycles_ids() {
        let (mut reg, arena, config) = setup();
        let a = reg.create(RegionName::BoardRam, 4096, &config).unwrap();
        let b = reg.create(RegionName::BoardRom, 4096, &config).unwrap();
        reg.attach(a, None, Some(&arena), &config).unwrap();
        assert_eq!(reg.len(), 2);

        reg.destroy(a).unwrap();
        assert!(matches!(reg.stat(a), Err(Error::InvalidSegment(_))));
        assert!(matches!(reg.destroy(a), Err(Error::InvalidSegment(_))));
        assert_eq!(reg.len(), 1);

        let c = reg.create(RegionName::Chip, MIB, &config).unwrap();
        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn test_table_full() {
        let (mut reg, _arena, config) = setup();
        for _ in 0..MAX_SEGMENTS {
            reg.create(RegionName::BoardRam, 4096, &config).unwrap();
        }
        let err = reg.create(RegionName::BoardRam, 4096, &config).unwrap_err();
        assert!(matches!(err, Error::TableFull(MAX_SEGMENTS)));
        assert_eq!(reg.len(), MAX_SEGMENTS);
    }

    #[test]
    fn test_find_and_release_address() {
        let (mut reg, arena, config) = setup();
        let kick = reg.create(RegionName::Kick, 512 * 1024, &config).unwrap();
        let rom = reg.create(RegionName::BoardRom, 4096, &config).unwrap();
        assert_eq!(reg.find(RegionName::Kick), Some(kick));
        assert_eq!(reg.find(RegionName::Z3), None);

        let att = reg.attach(rom, None, Some(&arena), &config).unwrap();
        assert_eq!(reg.release_address(att.ptr.as_ptr() as usize), 1);
        assert_eq!(reg.find(RegionName::BoardRom), None);
        assert_eq!(reg.release_address(0x1234), 0);
    }

    #[test]
    fn test_release_address_shared() {
        let (mut reg, arena, config) = setup();
        let addr = arena.start() + 0x0040_0000;
        let a = reg.create(RegionName::BoardRam, 64 * 1024, &config).unwrap();
        let b = reg.create(RegionName::BoardRam, 64 * 1024, &config).unwrap();
        let other = reg.create(RegionName::Chip, MIB, &config).unwrap();
        assert!(reg.attach(a, Some(addr), Some(&arena), &config).unwrap().carved);
        assert!(reg.attach(b, Some(addr), Some(&arena), &config).unwrap().carved);
        reg.attach(other, None, Some(&arena), &config).unwrap();
        reg.detach(b).unwrap();

        assert_eq!(reg.release_address(addr), 2);
        assert!(reg.stat(a).is_err());
        assert!(reg.stat(b).is_err());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.stat(other).unwrap().state, SegmentState::Attached);

        // both ids go back on the free list
        let c = reg.create(RegionName::Fast, MIB, &config).unwrap();
        let d = reg.create(RegionName::Fast, MIB, &config).unwrap();
        let mut reused = vec![c, d];
        reused.sort();
        assert_eq!(reused, vec![a, b]);
    }

    #[test]
    fn test_set_protection() {
        let (mut reg, arena, config) = setup();
        let id = reg.create(RegionName::RomE0, 64 * 1024, &config).unwrap();
        assert_eq!(reg.set_protection(id, Protection::READ, Some(&arena)).unwrap(), Protection::READ);
        reg.attach(id, None, Some(&arena), &config).unwrap();
        assert_eq!(reg.stat(id).unwrap().protection, Some(Protection::READ));

        let applied = reg.set_protection(id, Protection::READ_WRITE, Some(&arena)).unwrap();
        assert!(applied.contains(Protection::READ_WRITE));
    }

    #[test]
    fn test_invalidate_carved() {
        let (mut reg, arena, config) = setup();
        let chip = reg.create(RegionName::Chip, MIB, &config).unwrap();
        let rom = reg.create(RegionName::BoardRom, 4096, &config).unwrap();
        reg.attach(chip, None, Some(&arena), &config).unwrap();
        let standalone = reg.attach(rom, None, Some(&arena), &config).unwrap();

        assert_eq!(reg.invalidate_carved(), vec![chip]);
        let desc = reg.stat(chip).unwrap();
        assert_eq!(desc.state, SegmentState::Created);
        assert_eq!(desc.placement, Placement::Unassigned);
        assert_eq!(desc.address, None);

        let kept = reg.stat(rom).unwrap();
        assert_eq!(kept.address, Some(standalone.ptr.as_ptr() as usize));
    }
}
