//! Remote memory manager.
//!
//! The remote memory manager hands out device memory from the segments configured by
//! the platform layer and tracks overlay reservations. Allocations pick the lowest
//! suitably aligned run of free units; reservations claim a caller-chosen address
//! range and fail if any part of it is still held by another reservation.
//!
//! Every live allocation and reservation is recorded by address, so frees are checked
//! against the true extent instead of trusting the caller.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::{DspAddress, Error, Result, Segment, SegmentDescriptor, SegmentId, SegmentStat};

/// How reservations are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationMode {
    /// Segments are configured; reservations inside a segment claim its units.
    Segmented,
    /// No segments are configured. Only reservations are served and they are
    /// tracked in the overlay list.
    ReservationOnly,
}

/// A live allocation or reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// First device address of the block.
    pub address: DspAddress,
    /// Requested size in bytes.
    pub size: u32,
    /// Segment backing the block, or `None` for overlay memory outside every segment.
    pub segment: Option<SegmentId>,
    /// Whether the block was created by [`RemoteMemoryManager::reserve`].
    pub reserved: bool,
}

impl Allocation {
    fn end(&self) -> u64 {
        u64::from(self.address.as_u32()) + u64::from(self.size)
    }
}

struct RmmState {
    segments: Vec<Segment>,
    records: BTreeMap<DspAddress, Allocation>,
}

impl RmmState {
    fn segment_mut(&mut self, id: SegmentId) -> Result<&mut Segment> {
        self.segments
            .get_mut(id.index())
            .ok_or(Error::SegmentNotFound(id))
    }

    /// Returns true if `[addr, addr + size)` overlaps any live record.
    ///
    /// Records never overlap each other, so only the record starting closest below
    /// the end of the range needs checking.
    fn overlaps_record(&self, addr: DspAddress, size: u32) -> bool {
        let end = u64::from(addr.as_u32()) + u64::from(size);
        let below_end = match u32::try_from(end) {
            Ok(end) => self.records.range(..DspAddress::new(end)).next_back(),
            Err(_) => self.records.iter().next_back(),
        };
        below_end.is_some_and(|(_, rec)| rec.end() > u64::from(addr.as_u32()))
    }

    fn remove(&mut self, addr: DspAddress) -> Result<Allocation> {
        let rec = self.records.remove(&addr).ok_or(Error::UnknownAllocation)?;
        if let Some(id) = rec.segment {
            let seg = self.segment_mut(id)?;
            let (first, count) = seg.span(rec.address, rec.size);
            seg.units_mut().clear_range(first, count);
            seg.record_freed();
        }
        Ok(rec)
    }
}

/// Allocator for device memory segments and overlay reservations.
///
/// # Thread Safety
///
/// All state sits behind a `spin::Mutex`; every operation holds it for its whole
/// duration, so two callers can never claim the same unit.
pub struct RemoteMemoryManager {
    state: spin::Mutex<RmmState>,
    mode: ReservationMode,
}

impl RemoteMemoryManager {
    /// Creates a manager for the given segment table.
    ///
    /// An empty table produces a [`ReservationMode::ReservationOnly`] manager.
    ///
    /// Segments must not share device addresses, whatever their [`MemorySpace`]:
    /// blocks are identified by address alone, so an overlapping table fails with
    /// [`Error::InvalidSegment`].
    ///
    /// [`MemorySpace`]: crate::MemorySpace
    pub fn new(table: &[SegmentDescriptor]) -> Result<Self> {
        for (index, descriptor) in table.iter().enumerate() {
            let clash = table[..index]
                .iter()
                .position(|earlier| earlier.overlaps(descriptor.base, descriptor.length));
            if let Some(earlier) = clash {
                log::warn!("segment {index} overlaps segment {earlier}");
                return Err(Error::InvalidSegment);
            }
        }

        let mut segments = Vec::new();
        segments
            .try_reserve_exact(table.len())
            .map_err(|_| Error::OutOfMemory)?;
        for descriptor in table {
            segments.push(Segment::new(*descriptor)?);
        }

        let mode = if segments.is_empty() {
            ReservationMode::ReservationOnly
        } else {
            ReservationMode::Segmented
        };
        log::debug!("remote memory manager created: {} segments, {:?}", segments.len(), mode);

        Ok(Self {
            state: spin::Mutex::new(RmmState {
                segments,
                records: BTreeMap::new(),
            }),
            mode,
        })
    }

    /// Creates a manager with no segments that only serves reservations.
    pub fn reservation_only() -> Self {
        log::debug!("remote memory manager created in reservation-only mode");
        Self {
            state: spin::Mutex::new(RmmState {
                segments: Vec::new(),
                records: BTreeMap::new(),
            }),
            mode: ReservationMode::ReservationOnly,
        }
    }

    /// Returns how reservations are backed.
    pub const fn mode(&self) -> ReservationMode {
        self.mode
    }

    /// Returns the number of configured segments.
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Returns the descriptor of a segment.
    pub fn segment(&self, id: SegmentId) -> Result<SegmentDescriptor> {
        self.state
            .lock()
            .segments
            .get(id.index())
            .map(|s| *s.descriptor())
            .ok_or(Error::SegmentNotFound(id))
    }

    /// Allocates `size` bytes from a segment at an address that is a multiple of `align`.
    ///
    /// The lowest suitable run of units wins. An `align` of zero is treated as one.
    pub fn alloc(&self, segment: SegmentId, size: u32, align: u32) -> Result<DspAddress> {
        debug_assert!(align == 0 || align.is_power_of_two(), "alignment must be a power of two");
        let align = align.max(1);

        let mut state = self.state.lock();
        let seg = state.segment_mut(segment)?;
        if size == 0 {
            return Err(Error::InvalidSize);
        }

        let count = seg.units_for(size);
        let mut from = 0;
        let start = loop {
            let Some(candidate) = seg.units().find_clear_run(from, count) else {
                log::trace!("segment {segment}: no run of {count} units aligned to {align:#x}");
                return Err(Error::OutOfSegmentMemory);
            };
            if seg.address_of(candidate).as_u32() % align == 0 {
                break candidate;
            }
            from = candidate + 1;
        };

        seg.units_mut().set_range(start, count);
        seg.record_live();
        let address = seg.address_of(start);
        state.records.insert(
            address,
            Allocation {
                address,
                size,
                segment: Some(segment),
                reserved: false,
            },
        );

        log::trace!("segment {segment}: allocated {size:#x} bytes at {address}");
        Ok(address)
    }

    /// Reserves `[addr, addr + size)` for overlay use.
    ///
    /// Inside a segment the covered units are claimed; outside every segment the range
    /// goes to the overlay list. Either way a range that overlaps a held reservation or
    /// allocation fails with [`Error::OverlayMemoryInUse`].
    pub fn reserve(&self, addr: DspAddress, size: u32) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        if addr.checked_add(size - 1).is_none() {
            return Err(Error::InvalidRange);
        }

        let mut state = self.state.lock();
        let backing = state
            .segments
            .iter()
            .position(|s| s.descriptor().overlaps(addr, size));

        let segment = match backing {
            Some(index) => {
                let seg = &mut state.segments[index];
                if !seg.descriptor().contains(addr, size) {
                    return Err(Error::InvalidRange);
                }
                let (first, count) = seg.span(addr, size);
                if !seg.units().is_range_clear(first, count) {
                    log::trace!("reservation {addr}+{size:#x} collides in segment {index}");
                    return Err(Error::OverlayMemoryInUse);
                }
                seg.units_mut().set_range(first, count);
                seg.record_live();
                Some(SegmentId::new(index))
            }
            None => {
                if state.overlaps_record(addr, size) {
                    log::trace!("reservation {addr}+{size:#x} collides in overlay list");
                    return Err(Error::OverlayMemoryInUse);
                }
                None
            }
        };

        state.records.insert(
            addr,
            Allocation {
                address: addr,
                size,
                segment,
                reserved: true,
            },
        );
        log::trace!("reserved {size:#x} bytes at {addr} ({segment:?})");
        Ok(())
    }

    /// Frees a block previously returned by [`alloc`](Self::alloc) or claimed by
    /// [`reserve`](Self::reserve).
    ///
    /// The arguments must match the live record: its size, its reservation flag and,
    /// for allocations, its segment. The segment is not consulted for reservations.
    pub fn free(&self, segment: SegmentId, addr: DspAddress, size: u32, was_reserved: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !was_reserved && segment.index() >= state.segments.len() {
            return Err(Error::SegmentNotFound(segment));
        }

        let Some(rec) = state.records.get(&addr) else {
            log::warn!("free of unknown block at {addr}");
            return Err(Error::UnknownAllocation);
        };
        let matches = rec.size == size
            && rec.reserved == was_reserved
            && (was_reserved || rec.segment == Some(segment));
        if !matches {
            log::warn!(
                "free at {addr} ({size:#x}, reserved={was_reserved}) does not match {rec:?}"
            );
            return Err(Error::AllocationMismatch);
        }

        state.remove(addr)?;
        log::trace!("freed {size:#x} bytes at {addr}");
        Ok(())
    }

    /// Frees the block starting at `addr`, whatever its extent, and returns its record.
    pub fn release(&self, addr: DspAddress) -> Result<Allocation> {
        let rec = self.state.lock().remove(addr)?;
        log::trace!("released {rec:?}");
        Ok(rec)
    }

    /// Returns the live record starting at `addr`.
    pub fn allocation(&self, addr: DspAddress) -> Option<Allocation> {
        self.state.lock().records.get(&addr).copied()
    }

    /// Returns usage statistics for a segment.
    pub fn stat(&self, segment: SegmentId) -> Result<SegmentStat> {
        let state = self.state.lock();
        state
            .segments
            .get(segment.index())
            .map(Segment::stat)
            .ok_or(Error::SegmentNotFound(segment))
    }
}

impl Drop for RemoteMemoryManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.records.is_empty() {
            log::debug!(
                "remote memory manager dropped with {} live blocks",
                state.records.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::MemorySpace;

    const SEG: SegmentId = SegmentId::new(0);

    fn manager() -> RemoteMemoryManager {
        RemoteMemoryManager::new(&[SegmentDescriptor::with_unit_size(
            DspAddress::new(0x1000),
            0x100,
            MemorySpace::Data,
            16,
        )])
        .unwrap()
    }

    fn units(rmm: &RemoteMemoryManager) -> Vec<bool> {
        let state = rmm.state.lock();
        let bits = state.segments[0].units();
        (0..bits.len()).map(|b| bits.test(b)).collect()
    }

    #[test]
    fn lowest_first_allocation_scenario() {
        let rmm = manager();

        let first = rmm.alloc(SEG, 0x300, 0x100).unwrap();
        assert_eq!(first, DspAddress::new(0x1000));
        assert_eq!(&units(&rmm)[..4], &[true, true, true, false]);

        let second = rmm.alloc(SEG, 0x100, 0x100).unwrap();
        assert_eq!(second, DspAddress::new(0x1300));

        rmm.free(SEG, first, 0x300, false).unwrap();
        let third = rmm.alloc(SEG, 0x300, 0x100).unwrap();
        assert_eq!(third, DspAddress::new(0x1000));
    }

    #[test]
    fn overlay_reservation_scenario() {
        let rmm = manager();

        rmm.reserve(DspAddress::new(0x1400), 0x200).unwrap();
        assert_eq!(
            rmm.reserve(DspAddress::new(0x1400), 0x100),
            Err(Error::OverlayMemoryInUse)
        );

        rmm.free(SEG, DspAddress::new(0x1400), 0x200, true).unwrap();
        rmm.reserve(DspAddress::new(0x1400), 0x100).unwrap();
    }

    #[test]
    fn alloc_free_round_trip_restores_bitmap() {
        let rmm = manager();
        rmm.alloc(SEG, 0x100, 0).unwrap();
        let before = units(&rmm);

        let addr = rmm.alloc(SEG, 0x250, 0x100).unwrap();
        assert_ne!(units(&rmm), before);
        rmm.free(SEG, addr, 0x250, false).unwrap();
        assert_eq!(units(&rmm), before);
    }

    #[test]
    fn alignment_is_honoured() {
        let rmm = manager();
        rmm.alloc(SEG, 0x100, 0x100).unwrap();

        let addr = rmm.alloc(SEG, 0x100, 0x400).unwrap();
        assert_eq!(addr, DspAddress::new(0x1400));
        assert_eq!(addr.as_u32() % 0x400, 0);

        // The hole left below the aligned block is still handed out.
        assert_eq!(rmm.alloc(SEG, 0x200, 0x100).unwrap(), DspAddress::new(0x1100));
    }

    #[test]
    fn allocations_never_overlap_until_freed() {
        let rmm = manager();
        let mut blocks = Vec::new();
        while let Ok(addr) = rmm.alloc(SEG, 0x180, 0x100) {
            blocks.push(addr);
        }
        assert_eq!(blocks.len(), 8);
        for pair in blocks.windows(2) {
            assert!(pair[1].as_u32() >= pair[0].as_u32() + 0x200);
        }
        assert_eq!(rmm.alloc(SEG, 0x100, 0), Err(Error::OutOfSegmentMemory));
    }

    #[test]
    fn concurrent_allocations_are_exclusive() {
        let rmm = Arc::new(manager());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rmm = Arc::clone(&rmm);
                thread::spawn(move || {
                    (0..4)
                        .filter_map(|_| rmm.alloc(SEG, 0x100, 0x100).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 16);
    }

    #[test]
    fn reports_bad_segments_and_sizes() {
        let rmm = manager();
        let missing = SegmentId::new(3);
        assert_eq!(rmm.alloc(missing, 0x100, 0), Err(Error::SegmentNotFound(missing)));
        assert_eq!(rmm.alloc(SEG, 0, 0), Err(Error::InvalidSize));
        assert_eq!(rmm.alloc(SEG, 0x1100, 0), Err(Error::OutOfSegmentMemory));
        assert_eq!(rmm.stat(missing), Err(Error::SegmentNotFound(missing)));
    }

    #[test]
    fn checked_free_rejects_bad_calls() {
        let rmm = manager();
        let addr = rmm.alloc(SEG, 0x200, 0).unwrap();

        assert_eq!(
            rmm.free(SEG, DspAddress::new(0x1800), 0x200, false),
            Err(Error::UnknownAllocation)
        );
        assert_eq!(rmm.free(SEG, addr, 0x100, false), Err(Error::AllocationMismatch));
        assert_eq!(rmm.free(SEG, addr, 0x200, true), Err(Error::AllocationMismatch));

        rmm.free(SEG, addr, 0x200, false).unwrap();
        assert_eq!(rmm.free(SEG, addr, 0x200, false), Err(Error::UnknownAllocation));
    }

    #[test]
    fn release_uses_recorded_extent() {
        let rmm = manager();
        let addr = rmm.alloc(SEG, 0x300, 0).unwrap();
        let rec = rmm.release(addr).unwrap();
        assert_eq!(rec.size, 0x300);
        assert_eq!(rec.segment, Some(SEG));
        assert!(!rec.reserved);
        assert!(units(&rmm).iter().all(|u| !u));
        assert_eq!(rmm.release(addr), Err(Error::UnknownAllocation));
    }

    #[test]
    fn reservations_and_allocations_exclude_each_other() {
        let rmm = manager();
        rmm.reserve(DspAddress::new(0x1000), 0x180).unwrap();
        assert_eq!(rmm.alloc(SEG, 0x100, 0).unwrap(), DspAddress::new(0x1200));
        assert_eq!(
            rmm.reserve(DspAddress::new(0x1200), 0x10),
            Err(Error::OverlayMemoryInUse)
        );
    }

    #[test]
    fn reservation_straddling_segment_edge_is_rejected() {
        let rmm = manager();
        assert_eq!(
            rmm.reserve(DspAddress::new(0x1F00), 0x200),
            Err(Error::InvalidRange)
        );
        assert_eq!(
            rmm.reserve(DspAddress::new(0x0F00), 0x200),
            Err(Error::InvalidRange)
        );
    }

    #[test]
    fn overlay_list_outside_segments() {
        let rmm = manager();
        let overlay = DspAddress::new(0x8000);

        rmm.reserve(overlay, 0x400).unwrap();
        assert_eq!(rmm.reserve(overlay + 0x3FF, 0x10), Err(Error::OverlayMemoryInUse));
        assert_eq!(rmm.reserve(overlay - 0x10, 0x11), Err(Error::OverlayMemoryInUse));
        rmm.reserve(overlay + 0x400, 0x100).unwrap();
        rmm.reserve(overlay - 0x100, 0x100).unwrap();

        let rec = rmm.allocation(overlay).unwrap();
        assert_eq!(rec.segment, None);

        rmm.free(SEG, overlay, 0x400, true).unwrap();
        rmm.reserve(overlay + 0x100, 0x100).unwrap();
    }

    #[test]
    fn overlapping_segment_tables_are_rejected() {
        let code = SegmentDescriptor::with_unit_size(DspAddress::new(0x1000), 0x100, MemorySpace::Code, 16);
        let data = SegmentDescriptor::with_unit_size(DspAddress::new(0x1000), 0x100, MemorySpace::Data, 16);
        assert_eq!(RemoteMemoryManager::new(&[code, data]).err(), Some(Error::InvalidSegment));

        let tail = SegmentDescriptor::with_unit_size(DspAddress::new(0x1F00), 0x100, MemorySpace::Data, 4);
        assert_eq!(RemoteMemoryManager::new(&[code, tail]).err(), Some(Error::InvalidSegment));

        let adjacent = SegmentDescriptor::with_unit_size(DspAddress::new(0x2000), 0x100, MemorySpace::Data, 16);
        let rmm = RemoteMemoryManager::new(&[code, adjacent]).unwrap();
        let data_seg = SegmentId::new(1);
        assert_eq!(rmm.alloc(SEG, 0x100, 0).unwrap(), DspAddress::new(0x1000));
        assert_eq!(rmm.alloc(data_seg, 0x100, 0).unwrap(), DspAddress::new(0x2000));

        rmm.free(SEG, DspAddress::new(0x1000), 0x100, false).unwrap();
        assert_eq!(rmm.stat(SEG).unwrap().allocated_blocks, 0);
        assert_eq!(rmm.stat(SEG).unwrap().total_free, 0x1000);
        assert_eq!(rmm.stat(data_seg).unwrap().allocated_blocks, 1);
    }

    #[test]
    fn overlay_records_near_top_of_space() {
        let rmm = RemoteMemoryManager::reservation_only();
        rmm.reserve(DspAddress::new(0x1000), 0x100).unwrap();
        rmm.reserve(DspAddress::new(0xFFFF_F000), 0x1000).unwrap();
        rmm.reserve(DspAddress::new(0x8000), 0x100).unwrap();

        assert_eq!(
            rmm.reserve(DspAddress::new(0xFFFF_FF00), 0x100),
            Err(Error::OverlayMemoryInUse)
        );
        assert_eq!(
            rmm.reserve(DspAddress::new(0x10F0), 0x20),
            Err(Error::OverlayMemoryInUse)
        );
        rmm.reserve(DspAddress::new(0x1100), 0x6F00).unwrap();
    }

    #[test]
    fn reservation_only_mode() {
        let rmm = RemoteMemoryManager::new(&[]).unwrap();
        assert_eq!(rmm.mode(), ReservationMode::ReservationOnly);
        assert_eq!(rmm.segment_count(), 0);
        assert_eq!(rmm.alloc(SEG, 0x100, 0), Err(Error::SegmentNotFound(SEG)));

        rmm.reserve(DspAddress::new(0x2000), 0x100).unwrap();
        assert_eq!(
            rmm.reserve(DspAddress::new(0x2080), 0x100),
            Err(Error::OverlayMemoryInUse)
        );
        rmm.free(SEG, DspAddress::new(0x2000), 0x100, true).unwrap();

        let explicit = RemoteMemoryManager::reservation_only();
        assert_eq!(explicit.mode(), ReservationMode::ReservationOnly);
        explicit.reserve(DspAddress::new(0x2000), 0x100).unwrap();
    }

    #[test]
    fn stat_tracks_usage() {
        let rmm = manager();
        rmm.alloc(SEG, 0x200, 0).unwrap();
        rmm.reserve(DspAddress::new(0x1800), 0x100).unwrap();

        let stat = rmm.stat(SEG).unwrap();
        assert_eq!(stat.size, 0x1000);
        assert_eq!(stat.total_free, 0xD00);
        assert_eq!(stat.largest_free, 0x700);
        assert_eq!(stat.free_blocks, 2);
        assert_eq!(stat.allocated_blocks, 2);
        assert_eq!(rmm.segment(SEG).unwrap().space, MemorySpace::Data);
    }
}
