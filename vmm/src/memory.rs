//! Guest memory layout.
//!
//! Each region is an anonymous host mapping placed at a guest physical
//! address. The host owns the mapping; once a region is registered with KVM
//! the kernel holds an alias to the same pages, so writing the host buffer is
//! enough to change guest memory.

use crate::error::MemoryError;
use log::debug;
use vm_memory::{
    Address, Bytes, GuestAddress, GuestMemoryRegion, GuestRegionMmap, MemoryRegionAddress,
    MmapRegion,
};

type Result<T> = std::result::Result<T, MemoryError>;

/// Index of a region inside a [`MemoryLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle(usize);

impl RegionHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionFlags {
    /// Guest writes trap to the host as MMIO exits.
    pub read_only: bool,
}

impl RegionFlags {
    pub const READ_WRITE: Self = Self { read_only: false };
    pub const READ_ONLY: Self = Self { read_only: true };
}

pub struct MemoryRegion {
    name: String,
    mapping: GuestRegionMmap<()>,
    flags: RegionFlags,
    slot: Option<u32>,
}

impl MemoryRegion {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guest_phys_addr(&self) -> u64 {
        self.mapping.start_addr().raw_value()
    }

    pub fn size(&self) -> usize {
        self.mapping.len() as usize
    }

    /// One past the last guest address of the region.
    pub fn end(&self) -> u64 {
        self.guest_phys_addr() + self.mapping.len()
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// KVM slot, once the region is registered.
    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    pub(crate) fn host_addr(&self) -> u64 {
        self.mapping.as_ptr() as u64
    }

    pub(crate) fn set_slot(&mut self, slot: u32) {
        self.slot = Some(slot);
    }
}

/// The guest-visible regions of one VM.
///
/// Regions never overlap and are never resized.
#[derive(Default)]
pub struct MemoryLayout {
    regions: Vec<MemoryRegion>,
}

impl MemoryLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed host buffer and place it at `guest_phys_addr`.
    pub fn register(
        &mut self,
        name: &str,
        guest_phys_addr: u64,
        size: usize,
        flags: RegionFlags,
    ) -> Result<RegionHandle> {
        let new_end = guest_phys_addr
            .checked_add(size as u64)
            .filter(|_| size > 0)
            .ok_or(MemoryError::InvalidRegion {
                guest_phys_addr,
                size,
            })?;

        if let Some(existing) = self
            .regions
            .iter()
            .find(|r| guest_phys_addr < r.end() && r.guest_phys_addr() < new_end)
        {
            return Err(MemoryError::RegionOverlap {
                new_base: guest_phys_addr,
                new_end,
                existing_base: existing.guest_phys_addr(),
                existing_end: existing.end(),
            });
        }

        let mmap = MmapRegion::<()>::new(size).map_err(MemoryError::Mmap)?;
        let mapping = GuestRegionMmap::new(mmap, GuestAddress(guest_phys_addr))
            .map_err(MemoryError::GuestRegion)?;

        debug!(
            "Allocated region '{}': GPA 0x{:x}, size 0x{:x}, host {:p}",
            name,
            guest_phys_addr,
            size,
            mapping.as_ptr()
        );

        self.regions.push(MemoryRegion {
            name: name.to_string(),
            mapping,
            flags,
            slot: None,
        });
        Ok(RegionHandle(self.regions.len() - 1))
    }

    /// Region with the greatest base address not above `target_addr`.
    ///
    /// This is the tightest lower bound, not a containment test: a segment
    /// whose size the allocator never saw still resolves to the block it
    /// starts in, and `copy_into` then decides whether it fits.
    pub fn find(&self, target_addr: u64) -> Result<RegionHandle> {
        self.regions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.guest_phys_addr() <= target_addr)
            .max_by_key(|(_, r)| r.guest_phys_addr())
            .map(|(i, _)| RegionHandle(i))
            .ok_or(MemoryError::NoMapping(target_addr))
    }

    /// Copy `code` into the region so that its first byte lands at `target_addr`.
    ///
    /// Bounds are checked before anything is written.
    pub fn copy_into(&mut self, handle: RegionHandle, code: &[u8], target_addr: u64) -> Result<()> {
        let region = self.region(handle);
        let base = region.guest_phys_addr();
        let out_of_bounds = || MemoryError::OutOfBounds {
            addr: target_addr,
            size: code.len(),
            region_base: base,
            region_size: region.size(),
        };

        let offset = target_addr
            .checked_sub(base)
            .and_then(|off| usize::try_from(off).ok())
            .ok_or_else(out_of_bounds)?;
        match offset.checked_add(code.len()) {
            Some(end) if end <= region.size() => {}
            _ => return Err(out_of_bounds()),
        }

        region
            .mapping
            .write_slice(code, MemoryRegionAddress(offset as u64))?;
        Ok(())
    }

    /// Read back `buf.len()` bytes at `offset` within the region.
    pub fn read(&self, handle: RegionHandle, offset: usize, buf: &mut [u8]) -> Result<()> {
        let region = self.region(handle);
        match offset.checked_add(buf.len()) {
            Some(end) if end <= region.size() => {}
            _ => {
                return Err(MemoryError::OutOfBounds {
                    addr: region.guest_phys_addr() + offset as u64,
                    size: buf.len(),
                    region_base: region.guest_phys_addr(),
                    region_size: region.size(),
                })
            }
        }
        region
            .mapping
            .read_slice(buf, MemoryRegionAddress(offset as u64))?;
        Ok(())
    }

    pub fn region(&self, handle: RegionHandle) -> &MemoryRegion {
        &self.regions[handle.0]
    }

    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }

    pub(crate) fn regions_mut(&mut self) -> impl Iterator<Item = &mut MemoryRegion> {
        self.regions.iter_mut()
    }

    /// First slot after every slot handed out so far.
    pub(crate) fn next_free_slot(&self) -> u32 {
        self.regions
            .iter()
            .filter_map(|r| r.slot)
            .max()
            .map_or(0, |s| s + 1)
    }

    /// Mark every region as unknown to KVM again, once its VM is gone.
    pub(crate) fn forget_slots(&mut self) {
        for region in &mut self.regions {
            region.slot = None;
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
