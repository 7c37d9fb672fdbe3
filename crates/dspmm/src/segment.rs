//! Device memory segments.
//!
//! A segment is one physically contiguous pool of device memory, described by the
//! platform layer with a [`SegmentDescriptor`]. The remote memory manager owns one
//! [`Segment`] per descriptor and tracks unit usage with a [`BitVector`].

use core::fmt;

use crate::{BitVector, DspAddress, Error, Result};

/// Index of a segment in the table passed to the remote memory manager.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SegmentId(usize);

impl SegmentId {
    /// Creates a segment id from its table index.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the table index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag distinguishing the device memory pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    /// Program memory.
    Code,
    /// Data memory.
    Data,
    /// A board-specific pool identified by an opaque tag.
    Other(u32),
}

/// Static description of a segment, supplied by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// First device address of the segment.
    pub base: DspAddress,
    /// Length of the segment in bytes.
    pub length: u32,
    /// Pool the segment belongs to.
    pub space: MemorySpace,
    /// Number of allocation units; `length` must be a multiple of it.
    pub unit_count: usize,
}

impl SegmentDescriptor {
    /// Creates a descriptor.
    pub const fn new(base: DspAddress, length: u32, space: MemorySpace, unit_count: usize) -> Self {
        Self {
            base,
            length,
            space,
            unit_count,
        }
    }

    /// Creates a descriptor from a unit count and unit size.
    ///
    /// A length that does not fit in 32 bits is recorded as zero, which the remote
    /// memory manager rejects with [`Error::InvalidSegment`].
    pub const fn with_unit_size(
        base: DspAddress,
        unit_size: u32,
        space: MemorySpace,
        unit_count: usize,
    ) -> Self {
        let length = if unit_count > u32::MAX as usize {
            0
        } else {
            match unit_size.checked_mul(unit_count as u32) {
                Some(length) => length,
                None => 0,
            }
        };
        Self::new(base, length, space, unit_count)
    }

    /// Returns the size of one allocation unit in bytes.
    #[inline]
    pub const fn unit_size(&self) -> u32 {
        if self.unit_count == 0 || self.unit_count > u32::MAX as usize {
            return 0;
        }
        self.length / self.unit_count as u32
    }

    /// Returns the first address past the segment, widened so the top of the space fits.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.base.as_u32() as u64 + self.length as u64
    }

    /// Returns true if `[addr, addr + size)` lies entirely inside the segment.
    pub const fn contains(&self, addr: DspAddress, size: u32) -> bool {
        let start = addr.as_u32() as u64;
        start >= self.base.as_u32() as u64 && start + size as u64 <= self.end()
    }

    /// Returns true if `[addr, addr + size)` shares at least one byte with the segment.
    pub const fn overlaps(&self, addr: DspAddress, size: u32) -> bool {
        let start = addr.as_u32() as u64;
        start < self.end() && (self.base.as_u32() as u64) < start + size as u64
    }

    fn validate(&self) -> Result<()> {
        let count_fits = u32::try_from(self.unit_count).is_ok();
        if self.unit_count == 0
            || self.length == 0
            || !count_fits
            || self.length % self.unit_count as u32 != 0
            || self.end() > u64::from(u32::MAX) + 1
        {
            return Err(Error::InvalidSegment);
        }
        Ok(())
    }
}

/// Usage statistics for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentStat {
    /// Total size of the segment in bytes.
    pub size: u32,
    /// Bytes in free units.
    pub total_free: u32,
    /// Size of the largest free block in bytes.
    pub largest_free: u32,
    /// Number of maximal free blocks.
    pub free_blocks: usize,
    /// Number of live allocations and reservations in the segment.
    pub allocated_blocks: usize,
}

/// A managed segment: its descriptor plus the unit bitmap.
#[derive(Debug)]
pub struct Segment {
    descriptor: SegmentDescriptor,
    units: BitVector,
    live: usize,
}

impl Segment {
    /// Builds the bitmap for a descriptor.
    pub fn new(descriptor: SegmentDescriptor) -> Result<Self> {
        descriptor.validate()?;
        Ok(Self {
            descriptor,
            units: BitVector::new(descriptor.unit_count)?,
            live: 0,
        })
    }

    /// Returns the descriptor this segment was built from.
    pub const fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    /// Returns the unit bitmap.
    pub const fn units(&self) -> &BitVector {
        &self.units
    }

    pub(crate) fn units_mut(&mut self) -> &mut BitVector {
        &mut self.units
    }

    /// Converts a byte count into a unit count, rounding up.
    pub const fn units_for(&self, size: u32) -> usize {
        size.div_ceil(self.descriptor.unit_size()) as usize
    }

    /// Returns the unit containing `addr`. The caller ensures `addr` is inside the segment.
    pub const fn unit_of(&self, addr: DspAddress) -> usize {
        ((addr.as_u32() - self.descriptor.base.as_u32()) / self.descriptor.unit_size()) as usize
    }

    /// Returns the device address of the first byte of `unit`.
    pub const fn address_of(&self, unit: usize) -> DspAddress {
        DspAddress::new(self.descriptor.base.as_u32() + unit as u32 * self.descriptor.unit_size())
    }

    /// Returns the unit span `(first, count)` covering `[addr, addr + size)`.
    pub const fn span(&self, addr: DspAddress, size: u32) -> (usize, usize) {
        let first = self.unit_of(addr);
        let last = self.unit_of(DspAddress::new(addr.as_u32() + (size - 1)));
        (first, last - first + 1)
    }

    pub(crate) fn record_live(&mut self) {
        self.live += 1;
    }

    pub(crate) fn record_freed(&mut self) {
        self.live = self.live.saturating_sub(1);
    }

    /// Computes usage statistics.
    pub fn stat(&self) -> SegmentStat {
        let unit_size = self.descriptor.unit_size();
        let mut stat = SegmentStat {
            size: self.descriptor.length,
            allocated_blocks: self.live,
            ..SegmentStat::default()
        };

        for (_, len) in self.units.clear_runs() {
            let bytes = len as u32 * unit_size;
            stat.total_free += bytes;
            stat.largest_free = stat.largest_free.max(bytes);
            stat.free_blocks += 1;
        }
        stat
    }
}
