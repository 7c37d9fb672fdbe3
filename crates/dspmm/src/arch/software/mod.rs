//! Software emulation of the device MMU for testing and development.
//!
//! This module provides an MMU that runs on any host: the translation tables live
//! in a word array, the TLB is a small table filled by emulated device accesses,
//! and "interrupt masking" is a per-thread flag. It lets the page-table driver and
//! the dynamic memory mapper be exercised without hardware.

mod mmu;

use std::cell::Cell;

pub use mmu::{EmulatedMmu, TLB_ENTRIES};

use crate::mmu::InterruptControl;

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Emulated local interrupt mask of the current thread.
pub struct EmulatedInterrupts;

impl EmulatedInterrupts {
    /// Returns whether interrupts are unmasked on this thread.
    pub fn enabled() -> bool {
        INTERRUPTS_ENABLED.with(Cell::get)
    }
}

impl InterruptControl for EmulatedInterrupts {
    type State = bool;

    fn save_and_disable() -> bool {
        INTERRUPTS_ENABLED.with(|enabled| enabled.replace(false))
    }

    fn restore(state: bool) {
        INTERRUPTS_ENABLED.with(|enabled| enabled.set(state));
    }
}
