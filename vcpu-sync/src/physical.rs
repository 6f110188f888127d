//! Host-virtual to guest-physical address lookup.
//!
//! KVM addresses guest memory physically, but the host builds page tables
//! through its own virtual mappings. Every host range handed to the guest is
//! recorded here with the guest physical address it was registered at.

use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

use crate::{Error, Result};

/// A successful lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub physical: GuestAddress,
    /// Contiguous bytes from the looked-up address to the end of its region.
    pub length: usize,
}

/// Lookup of a host virtual address in the guest physical address space.
///
/// Implementations must not allocate or block: lookups happen while page
/// tables are being modified.
pub trait PhysicalMap {
    fn resolve(&self, virt: usize) -> Option<Resolved>;
}

/// One host range backing guest physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalRegion {
    pub virt: usize,
    pub physical: GuestAddress,
    pub len: usize,
}

impl PhysicalRegion {
    pub const fn new(virt: usize, physical: GuestAddress, len: usize) -> Self {
        Self {
            virt,
            physical,
            len,
        }
    }

    pub fn end(&self) -> usize {
        self.virt + self.len
    }

    pub fn contains(&self, virt: usize) -> bool {
        virt >= self.virt && virt - self.virt < self.len
    }

    fn translate(&self, virt: usize) -> Resolved {
        let offset = virt - self.virt;
        Resolved {
            physical: GuestAddress(self.physical.0 + offset as u64),
            length: self.len - offset,
        }
    }
}

/// An immutable, sorted set of [`PhysicalRegion`]s.
#[derive(Clone, Debug, Default)]
pub struct PhysicalRegions {
    regions: Vec<PhysicalRegion>,
}

impl PhysicalRegions {
    /// Sorts `regions` by host address. Empty or overlapping host ranges,
    /// and ranges whose host or guest end does not fit the address space,
    /// are rejected.
    pub fn new(mut regions: Vec<PhysicalRegion>) -> Result<Self> {
        regions.sort_unstable_by_key(|r| r.virt);
        for r in &regions {
            if r.len == 0 {
                return Err(Error::EmptyRegion { virt: r.virt });
            }
            let virt_end = r.virt.checked_add(r.len);
            let phys_end = r.physical.0.checked_add(r.len as u64);
            if virt_end.is_none() || phys_end.is_none() {
                return Err(Error::RegionOverflow { virt: r.virt });
            }
        }
        for pair in regions.windows(2) {
            if pair[0].end() > pair[1].virt {
                return Err(Error::OverlappingRegions {
                    first: pair[0].virt,
                    second: pair[1].virt,
                });
            }
        }
        Ok(Self { regions })
    }

    /// Records every region of `mem` by its host mapping.
    pub fn from_guest_memory(mem: &GuestMemoryMmap<()>) -> Result<Self> {
        let regions = mem
            .iter()
            .map(|region| {
                let host = region.as_ptr();
                if host.is_null() {
                    return Err(Error::RegionsFromGuestMemory(region.start_addr().0));
                }
                Ok(PhysicalRegion::new(
                    host as usize,
                    region.start_addr(),
                    region.len() as usize,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(regions)
    }

    pub fn regions(&self) -> &[PhysicalRegion] {
        &self.regions
    }
}

impl PhysicalMap for PhysicalRegions {
    fn resolve(&self, virt: usize) -> Option<Resolved> {
        let idx = self.regions.partition_point(|r| r.virt <= virt);
        let region = self.regions.get(idx.checked_sub(1)?)?;
        region.contains(virt).then(|| region.translate(virt))
    }
}

impl PhysicalMap for GuestMemoryMmap<()> {
    fn resolve(&self, virt: usize) -> Option<Resolved> {
        self.iter().find_map(|region| {
            let host = region.as_ptr() as usize;
            let region = PhysicalRegion::new(host, region.start_addr(), region.len() as usize);
            region.contains(virt).then(|| region.translate(virt))
        })
    }
}

impl<M: PhysicalMap + ?Sized> PhysicalMap for &M {
    fn resolve(&self, virt: usize) -> Option<Resolved> {
        (**self).resolve(virt)
    }
}
