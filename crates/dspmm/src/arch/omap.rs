//! OMAP DSP MMU backend.
//!
//! Drives the MMU through its memory-mapped register window. Table memory is
//! accessed through a CPU mapping of the physical region holding the tables; that
//! mapping must be uncached (or write-through with the walker snooping) so that a
//! completed write is what the walker reads.

use core::marker::PhantomData;
use core::ptr::{NonNull, read_volatile, write_volatile};
use core::sync::atomic::{Ordering, fence};

use crate::mmu::{InterruptControl, MmuBackend, PageSize, TlbEntry};
use crate::{DspAddress, Error, PhysicalAddress, Result};

/// Number of TLB entries on the MMU.
pub const TLB_ENTRIES: usize = 32;

mod reg {
    pub const CNTL: usize = 0x44;
    pub const TTB: usize = 0x4c;
    pub const LOCK: usize = 0x50;
    pub const LD_TLB: usize = 0x54;
    pub const CAM: usize = 0x58;
    pub const RAM: usize = 0x5c;
    pub const GFLUSH: usize = 0x60;
    pub const FLUSH_ENTRY: usize = 0x64;

    /// Size of the register window in bytes.
    pub const WINDOW: usize = 0x68;
}

const CNTL_MMU_ENABLE: u32 = 1 << 1;
const CNTL_TWL_ENABLE: u32 = 1 << 2;

const LOCK_BASE_SHIFT: u32 = 10;
const LOCK_VICTIM_SHIFT: u32 = 4;
const LOCK_FIELD_MASK: u32 = 0x3f;

const CAM_PRESERVED: u32 = 1 << 3;
const CAM_VALID: u32 = 1 << 2;
const CAM_TAG_MASK: u32 = 0xFFFF_F000;

const fn cam_size(size: PageSize) -> u32 {
    match size {
        PageSize::Section => 0,
        PageSize::Large => 1,
        PageSize::Small => 2,
        PageSize::Supersection => 3,
    }
}

const fn lock_value(base: usize, victim: usize) -> u32 {
    ((base as u32 & LOCK_FIELD_MASK) << LOCK_BASE_SHIFT)
        | ((victim as u32 & LOCK_FIELD_MASK) << LOCK_VICTIM_SHIFT)
}

const fn cam_value(entry: &TlbEntry) -> u32 {
    let mut cam = (entry.virt.as_u32() & CAM_TAG_MASK) | CAM_VALID | cam_size(entry.size);
    if entry.preserved {
        cam |= CAM_PRESERVED;
    }
    cam
}

const fn ram_value(entry: &TlbEntry) -> u32 {
    (entry.phys.as_u32() & CAM_TAG_MASK)
        | (entry.attrs.endianness.bit() << 9)
        | (entry.attrs.element_size.bits() << 7)
        | ((entry.attrs.mixed_size as u32) << 6)
}

/// Returns true if the virtual ranges of two entries share a byte.
fn overlapping(entry: &TlbEntry, virt: DspAddress, size: PageSize) -> bool {
    let start = u64::from(virt.as_u32());
    let end = start + u64::from(size.bytes());
    let e_start = u64::from(entry.virt.as_u32());
    let e_end = e_start + u64::from(entry.size.bytes());
    e_start < end && start < e_end
}

/// The OMAP DSP MMU.
///
/// `I` masks CPU interrupts around table updates.
///
/// Preserved entries occupy the bottom of the TLB, below the LOCK base. Flushing
/// one of them gives its slot back: the remaining preserved entries are reloaded
/// into the lowest slots and the LOCK base is lowered.
pub struct OmapMmu<I> {
    regs: NonNull<u32>,
    tables: NonNull<u32>,
    tables_base: PhysicalAddress,
    tables_len: usize,
    locked: [Option<TlbEntry>; TLB_ENTRIES],
    _interrupts: PhantomData<fn() -> I>,
}

// SAFETY: the value owns the register window and the table mapping exclusively.
unsafe impl<I> Send for OmapMmu<I> {}

impl<I> OmapMmu<I> {
    /// Creates a backend over a mapped register window and table region.
    ///
    /// # Safety
    ///
    /// `regs` must point to the MMU register window, and `tables` must be a CPU
    /// mapping of the `tables_len` bytes of physical memory starting at
    /// `tables_base`. Both mappings must stay valid for the life of the returned
    /// value, and nothing else may access them while it exists.
    pub unsafe fn new(
        regs: NonNull<u8>,
        tables: NonNull<u8>,
        tables_base: PhysicalAddress,
        tables_len: usize,
    ) -> Self {
        Self {
            regs: regs.cast(),
            tables: tables.cast(),
            tables_base,
            tables_len,
            locked: [None; TLB_ENTRIES],
            _interrupts: PhantomData,
        }
    }

    /// Returns the number of preserved TLB entries currently held.
    pub fn locked_entries(&self) -> usize {
        self.locked.iter().take_while(|slot| slot.is_some()).count()
    }

    /// Writes `cam`/`ram` into TLB slot `slot`, leaving the LOCK base at `base`.
    fn load_slot(&mut self, base: usize, slot: usize, cam: u32, ram: u32) {
        self.write_reg(reg::LOCK, lock_value(base, slot));
        self.write_reg(reg::CAM, cam);
        self.write_reg(reg::RAM, ram);
        self.write_reg(reg::LD_TLB, 1);
    }

    /// Drops the preserved entries overlapping `[virt, virt + size)` and packs the
    /// rest into the lowest slots.
    fn release_locked(&mut self, virt: DspAddress, size: PageSize) {
        let held = self.locked_entries();
        let mut kept = 0;
        for index in 0..held {
            match self.locked[index] {
                Some(entry) if !overlapping(&entry, virt, size) => {
                    self.locked[kept] = Some(entry);
                    kept += 1;
                }
                _ => {}
            }
        }
        if kept == held {
            return;
        }

        for index in kept..held {
            self.locked[index] = None;
        }
        for slot in 0..held {
            match self.locked[slot] {
                Some(entry) => self.load_slot(slot, slot, cam_value(&entry), ram_value(&entry)),
                // Invalidate the slots that were vacated by packing.
                None => self.load_slot(slot, slot, 0, 0),
            }
        }
        self.write_reg(reg::LOCK, lock_value(kept, kept));
        log::trace!("released {} locked TLB entries, {kept} left", held - kept);
    }

    fn read_reg(&self, offset: usize) -> u32 {
        debug_assert!(offset < reg::WINDOW && offset % 4 == 0);
        // SAFETY: `offset` is inside the register window mapped per `new`.
        unsafe { read_volatile(self.regs.as_ptr().add(offset / 4)) }
    }

    fn write_reg(&mut self, offset: usize, value: u32) {
        debug_assert!(offset < reg::WINDOW && offset % 4 == 0);
        // SAFETY: `offset` is inside the register window mapped per `new`.
        unsafe { write_volatile(self.regs.as_ptr().add(offset / 4), value) }
    }

    fn update_cntl(&mut self, bit: u32, set: bool) {
        let cntl = self.read_reg(reg::CNTL);
        let cntl = if set { cntl | bit } else { cntl & !bit };
        self.write_reg(reg::CNTL, cntl);
    }

    fn table_word(&self, addr: PhysicalAddress) -> Result<*mut u32> {
        let offset = addr
            .as_u32()
            .checked_sub(self.tables_base.as_u32())
            .ok_or(Error::InvalidRange)? as usize;
        if offset % 4 != 0 || offset + 4 > self.tables_len {
            return Err(Error::InvalidRange);
        }
        // SAFETY: `offset` is inside the table mapping, which `new` requires to be valid.
        Ok(unsafe { self.tables.as_ptr().add(offset / 4) })
    }
}

impl<I: InterruptControl> MmuBackend for OmapMmu<I> {
    type Interrupts = I;

    fn read_entry(&self, addr: PhysicalAddress) -> Result<u32> {
        let word = self.table_word(addr)?;
        // SAFETY: `table_word` checked the address against the table mapping.
        Ok(unsafe { read_volatile(word) })
    }

    fn write_entry(&mut self, addr: PhysicalAddress, value: u32) -> Result<()> {
        let word = self.table_word(addr)?;
        // SAFETY: `table_word` checked the address against the table mapping.
        unsafe { write_volatile(word, value) };
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn set_ttb(&mut self, base: PhysicalAddress) -> Result<()> {
        self.write_reg(reg::TTB, base.as_u32());
        let readback = self.read_reg(reg::TTB);
        if readback != base.as_u32() {
            log::error!("TTB readback {readback:#010x} after writing {base}");
            return Err(Error::HardwareFault);
        }
        Ok(())
    }

    fn set_translation(&mut self, enabled: bool) -> Result<()> {
        self.update_cntl(CNTL_MMU_ENABLE, enabled);
        Ok(())
    }

    fn translation_enabled(&self) -> bool {
        self.read_reg(reg::CNTL) & CNTL_MMU_ENABLE != 0
    }

    fn set_table_walk(&mut self, enabled: bool) -> Result<()> {
        self.update_cntl(CNTL_TWL_ENABLE, enabled);
        Ok(())
    }

    fn flush_tlb_entry(&mut self, virt: DspAddress, size: PageSize) -> Result<()> {
        self.write_reg(reg::CAM, (virt.as_u32() & CAM_TAG_MASK) | cam_size(size));
        self.write_reg(reg::FLUSH_ENTRY, 1);
        self.release_locked(virt, size);
        Ok(())
    }

    fn flush_tlb_all(&mut self) -> Result<()> {
        self.write_reg(reg::GFLUSH, 1);
        Ok(())
    }

    fn load_tlb_entry(&mut self, entry: &TlbEntry) -> Result<()> {
        let victim = self.locked_entries();
        if victim >= TLB_ENTRIES {
            log::warn!("no TLB entry left to load {}", entry.virt);
            return Err(Error::OutOfMemory);
        }

        self.load_slot(victim, victim, cam_value(entry), ram_value(entry));

        if entry.preserved {
            self.locked[victim] = Some(*entry);
            self.write_reg(reg::LOCK, lock_value(victim + 1, victim + 1));
        }
        log::trace!("loaded TLB entry {} -> {} at {victim}", entry.virt, entry.phys);
        Ok(())
    }
}

/// CPSR interrupt masking for ARM hosts.
#[cfg(target_arch = "arm")]
pub struct ArmInterrupts;

#[cfg(target_arch = "arm")]
impl InterruptControl for ArmInterrupts {
    type State = u32;

    fn save_and_disable() -> u32 {
        let cpsr: u32;
        // SAFETY: reads CPSR and masks IRQ and FIQ; privileged code only.
        unsafe {
            core::arch::asm!("mrs {}, cpsr", "cpsid if", out(reg) cpsr, options(nostack));
        }
        cpsr
    }

    fn restore(state: u32) {
        // SAFETY: writes back the control byte saved by `save_and_disable` in the same mode.
        unsafe {
            core::arch::asm!("msr cpsr_c, {}", in(reg) state, options(nostack));
        }
    }
}
