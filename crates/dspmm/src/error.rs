//! Errors reported by the allocators and the page-table driver.

use crate::SegmentId;

/// Errors that can occur while managing device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Storage for a bit vector or page table could not be obtained.
    #[error("out of memory")]
    OutOfMemory,
    /// The segment id does not name a configured segment.
    #[error("segment {0} not found")]
    SegmentNotFound(SegmentId),
    /// No clear run of units long enough exists in the segment.
    #[error("out of segment memory")]
    OutOfSegmentMemory,
    /// No free run of pages long enough exists in the mapping pool.
    #[error("out of device virtual address space")]
    OutOfVirtualAddressSpace,
    /// A reservation collides with a reservation that is still held.
    #[error("overlay memory already in use")]
    OverlayMemoryInUse,
    /// The virtual range is still mapped.
    #[error("virtual range still mapped")]
    StillMapped,
    /// Teardown attempted while ranges are still reserved.
    #[error("resources still held")]
    ResourcesStillHeld,
    /// The MMU rejected a page-table write or TLB operation.
    #[error("MMU hardware fault")]
    HardwareFault,
    /// A segment descriptor is malformed.
    #[error("invalid segment descriptor")]
    InvalidSegment,
    /// A zero-sized or oversized request.
    #[error("invalid size")]
    InvalidSize,
    /// An address range is misaligned, straddles a boundary, or leaves the managed space.
    #[error("invalid address range")]
    InvalidRange,
    /// No live allocation starts at the freed address.
    #[error("address was never allocated")]
    UnknownAllocation,
    /// A free disagrees with the recorded size, segment, or reservation flag.
    #[error("free does not match the recorded allocation")]
    AllocationMismatch,
    /// The address is not inside a reserved virtual range.
    #[error("virtual range not reserved")]
    NotReserved,
    /// The virtual range holds no mapping.
    #[error("virtual range not mapped")]
    NotMapped,
    /// The page-table slot already holds a different mapping.
    #[error("page table slot already in use")]
    MappingConflict,
    /// The operation is only legal while translation is disabled.
    #[error("MMU translation is enabled")]
    TranslationEnabled,
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;
