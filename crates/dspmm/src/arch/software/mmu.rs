//! An emulated device MMU.

use super::EmulatedInterrupts;
use crate::mmu::{Entry, MmuBackend, PageSize, TableLayout, TlbEntry};
use crate::{DspAddress, Error, PhysicalAddress, Result};

/// Number of TLB entries on the emulated MMU.
pub const TLB_ENTRIES: usize = 32;

/// A device MMU emulated in host memory.
///
/// Table memory is a word array covering the tables of one [`TableLayout`]. The
/// TLB is filled by [`EmulatedMmu::access`], which walks the tables the way the
/// hardware would, so stale entries stay visible until they are flushed.
///
/// Faults can be injected into table writes and TLB flushes. Every table write
/// made while [`EmulatedInterrupts`] reports interrupts enabled is counted.
#[derive(Debug)]
pub struct EmulatedMmu {
    base: PhysicalAddress,
    memory: Vec<u32>,
    ttb: PhysicalAddress,
    translation: bool,
    table_walk: bool,
    tlb: Vec<TlbEntry>,
    victim: usize,
    writes: usize,
    unguarded_writes: usize,
    fail_write_after: Option<usize>,
    fail_flushes: bool,
}

impl EmulatedMmu {
    /// Creates an MMU whose table memory covers `layout`, with translation off.
    pub fn new(layout: &TableLayout) -> Self {
        let (base, len) = layout.span();
        Self {
            base,
            memory: vec![0; len / 4],
            ttb: PhysicalAddress::default(),
            translation: false,
            table_walk: false,
            tlb: Vec::with_capacity(TLB_ENTRIES),
            victim: 0,
            writes: 0,
            unguarded_writes: 0,
            fail_write_after: None,
            fail_flushes: false,
        }
    }

    /// Fails the table write that follows `successful` more successful writes.
    ///
    /// The fault fires once.
    pub fn fail_write_after(&mut self, successful: usize) {
        self.fail_write_after = Some(successful);
    }

    /// Makes every TLB flush fail until turned off again.
    pub fn fail_tlb_flushes(&mut self, fail: bool) {
        self.fail_flushes = fail;
    }

    /// Returns the number of successful table writes.
    pub const fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the number of table writes made with interrupts enabled.
    pub const fn unguarded_writes(&self) -> usize {
        self.unguarded_writes
    }

    /// Returns the installed table base.
    pub const fn ttb(&self) -> PhysicalAddress {
        self.ttb
    }

    /// Returns whether the table walker is on.
    pub const fn table_walk_enabled(&self) -> bool {
        self.table_walk
    }

    /// Returns the table memory.
    pub fn table_memory(&self) -> &[u32] {
        &self.memory
    }

    /// Returns the TLB contents.
    pub fn tlb_entries(&self) -> &[TlbEntry] {
        &self.tlb
    }

    /// Performs a device access to `virt` and returns the physical address it
    /// reaches, or `None` on a translation fault.
    ///
    /// TLB hits win over the tables. A miss walks the tables if the walker is on and
    /// caches the result.
    pub fn access(&mut self, virt: DspAddress) -> Option<PhysicalAddress> {
        if !self.translation {
            return Some(PhysicalAddress::new(virt.as_u32()));
        }

        if let Some(hit) = self.tlb.iter().find(|e| e.covers(virt)) {
            return Some(hit.phys + (virt.as_u32() & !hit.size.frame_mask()));
        }
        if !self.table_walk {
            return None;
        }

        let entry = self.walk(virt)?;
        let phys = entry.phys + (virt.as_u32() & !entry.size.frame_mask());
        self.cache(entry);
        Some(phys)
    }

    fn walk(&self, virt: DspAddress) -> Option<TlbEntry> {
        let l1_slot = self.ttb + virt.l1_index() as u32 * 4;
        let entry = match Entry::decode_l1(self.read_entry(l1_slot).ok()?) {
            Entry::Coarse(table) => {
                let slot = table + virt.l2_index() as u32 * 4;
                Entry::decode_l2(self.read_entry(slot).ok()?)
            }
            entry => entry,
        };

        let size = entry.page_size()?;
        let (phys, attrs) = entry.target()?;
        Some(TlbEntry {
            virt: virt.align_down(size.bytes()),
            phys,
            size,
            attrs,
            preserved: false,
        })
    }

    /// Inserts an entry, evicting round-robin among entries that are not preserved.
    fn cache(&mut self, entry: TlbEntry) -> bool {
        if self.tlb.len() < TLB_ENTRIES {
            self.tlb.push(entry);
            return true;
        }

        for step in 0..TLB_ENTRIES {
            let index = (self.victim + step) % TLB_ENTRIES;
            if !self.tlb[index].preserved {
                self.tlb[index] = entry;
                self.victim = (index + 1) % TLB_ENTRIES;
                return true;
            }
        }
        false
    }

    fn word_index(&self, addr: PhysicalAddress) -> Result<usize> {
        let offset = addr
            .as_u32()
            .checked_sub(self.base.as_u32())
            .ok_or(Error::InvalidRange)? as usize;
        let index = offset / 4;
        if offset % 4 != 0 || index >= self.memory.len() {
            return Err(Error::InvalidRange);
        }
        Ok(index)
    }
}

impl MmuBackend for EmulatedMmu {
    type Interrupts = EmulatedInterrupts;

    fn read_entry(&self, addr: PhysicalAddress) -> Result<u32> {
        Ok(self.memory[self.word_index(addr)?])
    }

    fn write_entry(&mut self, addr: PhysicalAddress, value: u32) -> Result<()> {
        let index = self.word_index(addr)?;

        match self.fail_write_after {
            Some(0) => {
                self.fail_write_after = None;
                log::error!("injected fault writing {addr}");
                return Err(Error::HardwareFault);
            }
            Some(n) => self.fail_write_after = Some(n - 1),
            None => {}
        }

        if EmulatedInterrupts::enabled() {
            self.unguarded_writes += 1;
        }
        self.memory[index] = value;
        self.writes += 1;
        Ok(())
    }

    fn set_ttb(&mut self, base: PhysicalAddress) -> Result<()> {
        self.ttb = base;
        Ok(())
    }

    fn set_translation(&mut self, enabled: bool) -> Result<()> {
        self.translation = enabled;
        Ok(())
    }

    fn translation_enabled(&self) -> bool {
        self.translation
    }

    fn set_table_walk(&mut self, enabled: bool) -> Result<()> {
        self.table_walk = enabled;
        Ok(())
    }

    fn flush_tlb_entry(&mut self, virt: DspAddress, size: PageSize) -> Result<()> {
        if self.fail_flushes {
            return Err(Error::HardwareFault);
        }

        let start = u64::from(virt.as_u32());
        let end = start + u64::from(size.bytes());
        self.tlb.retain(|e| {
            let e_start = u64::from(e.virt.as_u32());
            let e_end = e_start + u64::from(e.size.bytes());
            e_end <= start || end <= e_start
        });
        Ok(())
    }

    fn flush_tlb_all(&mut self) -> Result<()> {
        if self.fail_flushes {
            return Err(Error::HardwareFault);
        }
        self.tlb.retain(|e| e.preserved);
        Ok(())
    }

    fn load_tlb_entry(&mut self, entry: &TlbEntry) -> Result<()> {
        if self.cache(*entry) {
            Ok(())
        } else {
            Err(Error::OutOfMemory)
        }
    }
}
