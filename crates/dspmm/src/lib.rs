#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # DSP Memory Manager
//!
//! `dspmm` manages the memory a host shares with a DSP co-processor. It provides:
//!
//! - A bitmap allocator ([`BitVector`]) tracking fixed-size allocation units.
//! - The remote memory manager ([`RemoteMemoryManager`]), which hands out device
//!   memory from configured segments and guards overlay memory with reservations.
//! - A driver for the device MMU's two-level page tables ([`mmu::PageDirectory`]).
//! - The dynamic memory mapper ([`DynamicMemoryMapper`]), which reserves device
//!   virtual address space and maps host pages into it.
//! - Software emulation of the MMU for testing in non-kernel environments.

extern crate alloc;

mod address;
pub mod arch;
mod bitmap;
mod dmm;
mod error;
pub mod mmu;
mod rmm;
mod segment;

pub use address::{DspAddress, PhysicalAddress};
pub use bitmap::{BitVector, ClearRuns};
pub use dmm::{DmmConfig, DynamicMemoryMapper, HostPage, PAGE_SIZE, RangeState, VirtualRange};
pub use error::{Error, Result};
pub use rmm::{Allocation, RemoteMemoryManager, ReservationMode};
pub use segment::{MemorySpace, Segment, SegmentDescriptor, SegmentId, SegmentStat};
