//! Hardware seam of the page-table driver.
//!
//! [`MmuBackend`] is everything the driver needs from the device: word access to
//! the table memory by physical address and the MMU control registers. The
//! production backend lives in `arch::omap`; `arch::software` emulates the MMU for
//! tests.

use core::marker::PhantomData;

use super::{MapAttributes, PageSize};
use crate::{DspAddress, PhysicalAddress, Result};

/// Access to the device MMU and the memory holding its tables.
pub trait MmuBackend {
    /// How this platform masks local interrupts around multi-word table updates.
    type Interrupts: InterruptControl;

    /// Reads the table word at `addr`.
    fn read_entry(&self, addr: PhysicalAddress) -> Result<u32>;

    /// Writes the table word at `addr`. The write must be visible to the table
    /// walker once this returns.
    fn write_entry(&mut self, addr: PhysicalAddress, value: u32) -> Result<()>;

    /// Installs the first-level table base.
    fn set_ttb(&mut self, base: PhysicalAddress) -> Result<()>;

    /// Turns address translation on or off.
    fn set_translation(&mut self, enabled: bool) -> Result<()>;

    /// Returns whether address translation is on.
    fn translation_enabled(&self) -> bool;

    /// Turns the hardware table walker on or off.
    fn set_table_walk(&mut self, enabled: bool) -> Result<()>;

    /// Invalidates TLB entries caching the page of `size` at `virt`.
    fn flush_tlb_entry(&mut self, virt: DspAddress, size: PageSize) -> Result<()>;

    /// Invalidates every TLB entry that is not preserved.
    fn flush_tlb_all(&mut self) -> Result<()>;

    /// Loads a translation directly into the TLB.
    fn load_tlb_entry(&mut self, entry: &TlbEntry) -> Result<()>;
}

/// A translation loaded directly into the TLB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub virt: DspAddress,
    pub phys: PhysicalAddress,
    pub size: PageSize,
    pub attrs: MapAttributes,
    /// Survives global TLB flushes.
    pub preserved: bool,
}

impl TlbEntry {
    /// Returns true if the entry translates `addr`.
    pub const fn covers(&self, addr: DspAddress) -> bool {
        addr.as_u32() & self.size.frame_mask() == self.virt.as_u32() & self.size.frame_mask()
    }
}

/// Local interrupt masking.
pub trait InterruptControl {
    /// Saved interrupt state.
    type State: Copy;

    /// Masks local interrupts and returns the previous state.
    fn save_and_disable() -> Self::State;

    /// Restores a state returned by [`InterruptControl::save_and_disable`].
    fn restore(state: Self::State);
}

/// Masks local interrupts for its lifetime.
///
/// The previous state is restored on drop, so guards nest.
pub struct IrqGuard<I: InterruptControl> {
    saved: I::State,
    _marker: PhantomData<fn() -> I>,
}

impl<I: InterruptControl> IrqGuard<I> {
    /// Masks interrupts until the guard is dropped.
    pub fn new() -> Self {
        Self {
            saved: I::save_and_disable(),
            _marker: PhantomData,
        }
    }
}

impl<I: InterruptControl> Default for IrqGuard<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: InterruptControl> Drop for IrqGuard<I> {
    fn drop(&mut self) {
        I::restore(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::software::EmulatedInterrupts;

    #[test]
    fn guard_restores_previous_state() {
        assert!(EmulatedInterrupts::enabled());
        {
            let _outer = IrqGuard::<EmulatedInterrupts>::new();
            assert!(!EmulatedInterrupts::enabled());
            {
                let _inner = IrqGuard::<EmulatedInterrupts>::new();
                assert!(!EmulatedInterrupts::enabled());
            }
            // Inner guard found interrupts already masked.
            assert!(!EmulatedInterrupts::enabled());
        }
        assert!(EmulatedInterrupts::enabled());
    }

    #[test]
    fn tlb_entry_coverage() {
        let entry = TlbEntry {
            virt: DspAddress::new(0x2001_0000),
            phys: PhysicalAddress::new(0x9000_0000),
            size: PageSize::Large,
            attrs: MapAttributes::default(),
            preserved: false,
        };
        assert!(entry.covers(DspAddress::new(0x2001_ffff)));
        assert!(!entry.covers(DspAddress::new(0x2002_0000)));
    }
}
