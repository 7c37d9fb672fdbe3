//! Dynamic memory mapper.
//!
//! The mapper manages a pool of device virtual address space. Callers reserve a
//! range, map host pages into it, unmap, and finally give the range back:
//!
//! ```text
//! reserve_memory      map_memory          un_map_memory       un_reserve_memory
//! ──────────────> Reserved ──────────> Mapped ──────────> Reserved ──────────────> (free)
//! ```
//!
//! Physically contiguous host pages are coalesced and each run is tiled with the
//! largest page size its alignment and length allow, so a 16 MiB aligned buffer
//! costs one supersection instead of 4096 small pages.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::mmu::{MapAttributes, MmuBackend, PageDirectory, PageSize};
use crate::{BitVector, DspAddress, Error, PhysicalAddress, Result};

/// Granule of the mapping pool.
pub const PAGE_SIZE: u32 = 0x1000;

/// Device virtual address pool managed by a [`DynamicMemoryMapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmmConfig {
    /// First address of the pool, page aligned.
    pub base: DspAddress,
    /// Size of the pool in bytes, a non-zero multiple of [`PAGE_SIZE`].
    pub size: u32,
}

impl DmmConfig {
    pub const fn new(base: DspAddress, size: u32) -> Self {
        Self { base, size }
    }

    /// Returns the number of pages in the pool.
    pub const fn page_count(&self) -> usize {
        (self.size / PAGE_SIZE) as usize
    }

    fn validate(&self) -> Result<()> {
        if !self.base.is_aligned(PAGE_SIZE)
            || self.size == 0
            || self.size % PAGE_SIZE != 0
            || u64::from(self.base.as_u32()) + u64::from(self.size) > 1 << 32
        {
            return Err(Error::InvalidRange);
        }
        Ok(())
    }
}

/// A run of host physical memory to map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPage {
    /// Page-aligned physical address.
    pub address: PhysicalAddress,
    /// Length in bytes, a multiple of [`PAGE_SIZE`].
    pub size: u32,
}

impl HostPage {
    pub const fn new(address: PhysicalAddress, size: u32) -> Self {
        Self { address, size }
    }

    fn validate(&self) -> Result<()> {
        if !self.address.is_aligned(PAGE_SIZE)
            || self.size == 0
            || self.size % PAGE_SIZE != 0
            || self.address.checked_add(self.size).is_none()
        {
            return Err(Error::InvalidRange);
        }
        Ok(())
    }
}

/// State of a reserved virtual range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeState {
    Reserved,
    /// Host memory is mapped at `address` for `size` bytes.
    Mapped { address: DspAddress, size: u32 },
}

/// A reserved virtual range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRange {
    pub address: DspAddress,
    /// Size in bytes, rounded up to whole pages.
    pub size: u32,
    pub state: RangeState,
}

#[derive(Debug)]
struct MappedRegion {
    address: DspAddress,
    size: u32,
    /// Every entry written by the mapping, in write order.
    entries: Vec<(DspAddress, PageSize)>,
}

#[derive(Debug)]
struct Reservation {
    size: u32,
    mapping: Option<MappedRegion>,
}

impl Reservation {
    fn view(&self, address: DspAddress) -> VirtualRange {
        VirtualRange {
            address,
            size: self.size,
            state: match &self.mapping {
                Some(m) => RangeState::Mapped {
                    address: m.address,
                    size: m.size,
                },
                None => RangeState::Reserved,
            },
        }
    }
}

struct DmmState<B: MmuBackend> {
    config: DmmConfig,
    pages: BitVector,
    ranges: BTreeMap<DspAddress, Reservation>,
    directory: PageDirectory<B>,
}

impl<B: MmuBackend> DmmState<B> {
    fn page_of(&self, addr: DspAddress) -> usize {
        ((addr - self.config.base) / PAGE_SIZE) as usize
    }

    /// Returns the reservation containing `addr`.
    fn containing(&self, addr: DspAddress) -> Option<(DspAddress, &Reservation)> {
        self.ranges
            .range(..=addr)
            .next_back()
            .filter(|(start, r)| addr - **start < r.size)
            .map(|(start, r)| (*start, r))
    }
}

/// Manager of the device's dynamic virtual address pool and its page tables.
///
/// # Thread Safety
///
/// The pool bitmap, the range records, and the page directory sit behind one
/// `spin::Mutex`. Page-table updates additionally run with local interrupts masked.
pub struct DynamicMemoryMapper<B: MmuBackend> {
    state: spin::Mutex<DmmState<B>>,
}

impl<B: MmuBackend> DynamicMemoryMapper<B> {
    /// Creates a mapper for the pool described by `config`, driving `directory`.
    pub fn new(config: DmmConfig, directory: PageDirectory<B>) -> Result<Self> {
        config.validate()?;
        let pages = BitVector::new(config.page_count())?;
        log::debug!(
            "dynamic memory mapper created: {} pages at {}",
            config.page_count(),
            config.base
        );
        Ok(Self {
            state: spin::Mutex::new(DmmState {
                config,
                pages,
                ranges: BTreeMap::new(),
                directory,
            }),
        })
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> DmmConfig {
        self.state.lock().config
    }

    /// Reserves `size` bytes of virtual address space, rounded up to whole pages.
    ///
    /// The lowest free run of pages is used.
    pub fn reserve_memory(&self, size: u32) -> Result<DspAddress> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let count = size.div_ceil(PAGE_SIZE) as usize;

        let mut state = self.state.lock();
        let Some(first) = state.pages.find_clear_run(0, count) else {
            log::warn!("no run of {count} free pages for a {size:#x} byte reservation");
            return Err(Error::OutOfVirtualAddressSpace);
        };
        state.pages.set_range(first, count);

        let address = state.config.base + first as u32 * PAGE_SIZE;
        state.ranges.insert(
            address,
            Reservation {
                size: count as u32 * PAGE_SIZE,
                mapping: None,
            },
        );
        log::trace!("reserved {count} pages at {address}");
        Ok(address)
    }

    /// Maps `pages` at `addr` for `size` bytes.
    ///
    /// `addr` must be page aligned and `[addr, addr + size)` must lie inside one
    /// reserved, unmapped range. `pages` are consumed in order until `size` bytes
    /// are covered. On any failure every entry written so far is removed again and
    /// the range stays unmapped.
    pub fn map_memory(
        &self,
        addr: DspAddress,
        size: u32,
        pages: &[HostPage],
        attrs: MapAttributes,
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        if !addr.is_aligned(PAGE_SIZE) {
            return Err(Error::InvalidRange);
        }
        let length = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(Error::InvalidSize)?;

        let mut state = self.state.lock();
        let state = &mut *state;

        let (start, range_size) = {
            let (start, reservation) = state.containing(addr).ok_or(Error::NotReserved)?;
            if reservation.mapping.is_some() {
                return Err(Error::StillMapped);
            }
            (start, reservation.size)
        };
        if u64::from(addr - start) + u64::from(length) > u64::from(range_size) {
            return Err(Error::InvalidRange);
        }

        let runs = coalesce(pages, length)?;
        let entries = state
            .directory
            .transaction(|dir| map_runs(dir, addr, &runs, attrs))?;

        log::trace!("mapped {length:#x} bytes at {addr} with {} entries", entries.len());
        if let Some(reservation) = state.ranges.get_mut(&start) {
            reservation.mapping = Some(MappedRegion {
                address: addr,
                size: length,
                entries,
            });
        }
        Ok(())
    }

    /// Removes the mapping in the range containing `addr`.
    ///
    /// Every entry is cleared and its TLB entries flushed. If the MMU faults part
    /// way, the entries not yet removed stay recorded, the range stays mapped, and
    /// the call can be retried.
    pub fn un_map_memory(&self, addr: DspAddress) -> Result<()> {
        let mut state = self.state.lock();
        let DmmState {
            ranges, directory, ..
        } = &mut *state;

        let (_, reservation) = ranges
            .range_mut(..=addr)
            .next_back()
            .filter(|(start, r)| addr - **start < r.size)
            .ok_or(Error::NotReserved)?;
        let mapping = reservation.mapping.as_mut().ok_or(Error::NotMapped)?;

        let mut removed = 0;
        let outcome = directory.transaction(|dir| {
            for &(virt, size) in &mapping.entries {
                match dir.pte_clear(virt, size) {
                    // Cleared by an earlier attempt whose flush failed.
                    Ok(()) | Err(Error::NotMapped) => {}
                    Err(err) => return Err(err),
                }
                dir.tlb_flush(virt, size)?;
                removed += 1;
            }
            Ok(())
        });
        mapping.entries.drain(..removed);

        if let Err(err) = outcome {
            log::error!(
                "unmapping {} failed with {} entries left: {err}",
                mapping.address,
                mapping.entries.len()
            );
            return Err(err);
        }

        log::trace!("unmapped {:#x} bytes at {}", mapping.size, mapping.address);
        reservation.mapping = None;
        Ok(())
    }

    /// Releases the range starting at `addr`.
    pub fn un_reserve_memory(&self, addr: DspAddress) -> Result<()> {
        let mut state = self.state.lock();
        match state.ranges.get(&addr) {
            None => return Err(Error::NotReserved),
            Some(r) if r.mapping.is_some() => return Err(Error::StillMapped),
            Some(_) => {}
        }

        let first = state.page_of(addr);
        if let Some(reservation) = state.ranges.remove(&addr) {
            let count = (reservation.size / PAGE_SIZE) as usize;
            state.pages.clear_range(first, count);
            log::trace!("released {count} pages at {addr}");
        }
        Ok(())
    }

    /// Tears the mapper down and returns the page directory.
    ///
    /// Fails with [`Error::ResourcesStillHeld`] while any range is reserved, handing
    /// the mapper back untouched. Otherwise translation is disabled and the TLB
    /// flushed first.
    pub fn destroy(self) -> Result<PageDirectory<B>, (Self, Error)> {
        let outcome = {
            let mut state = self.state.lock();
            let outcome = if state.ranges.is_empty() {
                state
                    .directory
                    .disable()
                    .and_then(|()| state.directory.tlb_flush_all())
            } else {
                log::warn!(
                    "refusing to destroy mapper with {} ranges outstanding",
                    state.ranges.len()
                );
                Err(Error::ResourcesStillHeld)
            };
            outcome
        };
        if let Err(err) = outcome {
            return Err((self, err));
        }

        log::debug!("dynamic memory mapper destroyed");
        Ok(self.state.into_inner().directory)
    }

    /// Returns the range containing `addr`.
    pub fn range(&self, addr: DspAddress) -> Option<VirtualRange> {
        let state = self.state.lock();
        state
            .containing(addr)
            .map(|(start, reservation)| reservation.view(start))
    }

    /// Returns the number of unreserved pages in the pool.
    pub fn free_pages(&self) -> usize {
        let state = self.state.lock();
        state.pages.len() - state.pages.count_set()
    }

    /// Logs every range at debug level.
    pub fn dump(&self) {
        let state = self.state.lock();
        log::debug!(
            "pool {} +{:#x}: {} ranges, {} free pages",
            state.config.base,
            state.config.size,
            state.ranges.len(),
            state.pages.len() - state.pages.count_set()
        );
        for (start, reservation) in &state.ranges {
            let range = reservation.view(*start);
            log::debug!("  {} +{:#x} {:?}", range.address, range.size, range.state);
        }
    }

    /// Runs `f` on the page directory under the mapper's lock.
    pub fn with_page_directory<R>(&self, f: impl FnOnce(&mut PageDirectory<B>) -> R) -> R {
        f(&mut self.state.lock().directory)
    }
}

/// Merges physically adjacent host pages and trims the result to `length` bytes.
fn coalesce(pages: &[HostPage], length: u32) -> Result<Vec<(PhysicalAddress, u32)>> {
    let mut runs: Vec<(PhysicalAddress, u32)> = Vec::new();
    let mut remaining = length;

    for page in pages {
        if remaining == 0 {
            break;
        }
        page.validate()?;

        let take = page.size.min(remaining);
        match runs.last_mut() {
            Some((start, len)) if *start + *len == page.address => *len += take,
            _ => runs.push((page.address, take)),
        }
        remaining -= take;
    }

    if remaining != 0 {
        return Err(Error::InvalidRange);
    }
    Ok(runs)
}

/// Writes the entries for `runs` starting at `virt`, flushes their TLB entries, and
/// locks them into the TLB if `attrs` asks for it.
///
/// On failure everything written here is removed again.
fn map_runs<B: MmuBackend>(
    dir: &mut PageDirectory<B>,
    virt: DspAddress,
    runs: &[(PhysicalAddress, u32)],
    attrs: MapAttributes,
) -> Result<Vec<(DspAddress, PageSize)>> {
    let mut written: Vec<(DspAddress, PhysicalAddress, PageSize)> = Vec::new();
    let mut virt = virt;

    for &(mut phys, mut remaining) in runs {
        while remaining > 0 {
            let size = PageSize::largest_fitting(phys.as_u32() | virt.as_u32(), remaining)
                .unwrap_or(PageSize::Small);
            if let Err(err) = dir.pte_set(phys, virt, size, attrs) {
                log::error!(
                    "mapping {virt} -> {phys} ({size:?}) failed: {err}; unwinding {} entries",
                    written.len()
                );
                unwind(dir, &written);
                return Err(err);
            }
            written.push((virt, phys, size));
            // The pool may end at the top of the address space.
            virt = DspAddress::new(virt.as_u32().wrapping_add(size.bytes()));
            phys = phys + size.bytes();
            remaining -= size.bytes();
        }
    }

    for &(entry, _, size) in &written {
        if let Err(err) = dir.tlb_flush(entry, size) {
            log::error!("TLB flush of {entry} failed: {err}; unwinding {} entries", written.len());
            unwind(dir, &written);
            return Err(err);
        }
    }

    if attrs.lock {
        for &(entry, phys, size) in &written {
            if let Err(err) = dir.lock_tlb_entry(phys, entry, size, attrs) {
                log::error!("locking {entry} into the TLB failed: {err}; unwinding {} entries", written.len());
                unwind(dir, &written);
                return Err(err);
            }
        }
    }

    Ok(written.into_iter().map(|(entry, _, size)| (entry, size)).collect())
}

fn unwind<B: MmuBackend>(
    dir: &mut PageDirectory<B>,
    written: &[(DspAddress, PhysicalAddress, PageSize)],
) {
    for &(virt, _, size) in written.iter().rev() {
        if let Err(err) = dir.pte_clear(virt, size) {
            log::error!("could not clear {virt} while unwinding: {err}");
        }
        if let Err(err) = dir.tlb_flush(virt, size) {
            log::error!("could not flush {virt} while unwinding: {err}");
        }
    }
}
