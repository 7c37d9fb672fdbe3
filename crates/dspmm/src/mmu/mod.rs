//! Device MMU page-table driver.
//!
//! [`PageDirectory`] owns one first-level table and a fixed pool of second-level
//! coarse tables, all living in memory the device's table walker can read. It
//! writes descriptors through an [`MmuBackend`] and keeps the bookkeeping needed to
//! hand coarse tables out and take them back: a coarse table is claimed by the
//! first 4 KiB or 64 KiB page mapped in its MiB and released when its last entry
//! is cleared.
//!
//! The driver does not undo partial work across calls. A failed [`PageDirectory::pte_set`]
//! leaves no entry of its own behind, but unwinding earlier calls is up to the caller.

mod backend;
mod descriptor;

pub use backend::{InterruptControl, IrqGuard, MmuBackend, TlbEntry};
pub use descriptor::{ElementSize, Endianness, Entry, MapAttributes, PageSize};

use alloc::vec::Vec;

use crate::{DspAddress, Error, PhysicalAddress, Result};

/// Entries in the first-level table.
pub const L1_ENTRIES: usize = 4096;
/// Size of the first-level table in bytes; also its required alignment.
pub const L1_TABLE_SIZE: u32 = 0x4000;
/// Entries in one coarse second-level table.
pub const L2_ENTRIES: usize = 256;
/// Size of one coarse table in bytes; also its required alignment.
pub const L2_TABLE_SIZE: u32 = 0x400;

const ENTRY_SIZE: u32 = 4;

/// Physical placement of the translation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    /// First-level table, 16 KiB aligned.
    pub l1: PhysicalAddress,
    /// First coarse table of the pool, 1 KiB aligned. The pool is contiguous.
    pub l2: PhysicalAddress,
    /// Number of coarse tables in the pool.
    pub l2_tables: usize,
}

impl TableLayout {
    pub const fn new(l1: PhysicalAddress, l2: PhysicalAddress, l2_tables: usize) -> Self {
        Self { l1, l2, l2_tables }
    }

    /// Returns the lowest table address and the number of bytes up to the end of the
    /// highest table.
    pub fn span(&self) -> (PhysicalAddress, usize) {
        let l1 = self.l1.as_usize();
        let l2 = self.l2.as_usize();
        let start = l1.min(l2);
        let end = (l1 + L1_TABLE_SIZE as usize).max(l2 + self.pool_bytes());
        (PhysicalAddress::new(start as u32), end - start)
    }

    /// Returns the physical address of coarse table `index`.
    pub const fn l2_table(&self, index: usize) -> PhysicalAddress {
        PhysicalAddress::new(self.l2.as_u32() + index as u32 * L2_TABLE_SIZE)
    }

    fn pool_bytes(&self) -> usize {
        self.l2_tables * L2_TABLE_SIZE as usize
    }

    fn l2_index_of(&self, table: PhysicalAddress) -> Option<usize> {
        let offset = table.as_u32().checked_sub(self.l2.as_u32())?;
        let index = (offset / L2_TABLE_SIZE) as usize;
        (offset % L2_TABLE_SIZE == 0 && index < self.l2_tables).then_some(index)
    }

    fn validate(&self) -> Result<()> {
        let top = u64::from(u32::MAX) + 1;
        let l1_start = u64::from(self.l1.as_u32());
        let l1_end = l1_start + u64::from(L1_TABLE_SIZE);
        let l2_start = u64::from(self.l2.as_u32());
        let l2_end = l2_start + self.pool_bytes() as u64;

        let overlapping = self.l2_tables > 0 && l1_start < l2_end && l2_start < l1_end;
        if !self.l1.is_aligned(L1_TABLE_SIZE)
            || !self.l2.is_aligned(L2_TABLE_SIZE)
            || l1_end > top
            || l2_end > top
            || overlapping
        {
            return Err(Error::InvalidRange);
        }
        Ok(())
    }
}

/// A leaf translation found in the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// First device address covered by the page.
    pub virt: DspAddress,
    /// Physical frame the page maps to.
    pub phys: PhysicalAddress,
    pub size: PageSize,
    pub attrs: MapAttributes,
}

#[derive(Debug, Clone, Copy, Default)]
struct CoarseTable {
    /// First-level slot this table is hooked into.
    owner: Option<usize>,
    /// Non-zero entries, counting every replica of a large page.
    live: u16,
}

/// The device MMU page tables.
pub struct PageDirectory<B: MmuBackend> {
    backend: B,
    layout: TableLayout,
    coarse: Vec<CoarseTable>,
}

impl<B: MmuBackend> PageDirectory<B> {
    /// Clears the first-level table and installs it as the table base.
    ///
    /// Translation must be disabled. Coarse tables are cleared when claimed.
    pub fn new(backend: B, layout: TableLayout) -> Result<Self> {
        layout.validate()?;
        if backend.translation_enabled() {
            return Err(Error::TranslationEnabled);
        }

        let mut coarse = Vec::new();
        coarse
            .try_reserve_exact(layout.l2_tables)
            .map_err(|_| Error::OutOfMemory)?;
        coarse.resize(layout.l2_tables, CoarseTable::default());

        let mut directory = Self {
            backend,
            layout,
            coarse,
        };
        directory.transaction(|dir| {
            let base = dir.layout.l1;
            for index in 0..L1_ENTRIES {
                dir.backend
                    .write_entry(base + index as u32 * ENTRY_SIZE, 0)?;
            }
            dir.ttb_set(base)
        })?;

        log::debug!(
            "page directory at {} with {} coarse tables at {}",
            layout.l1,
            layout.l2_tables,
            layout.l2
        );
        Ok(directory)
    }

    /// Returns the table layout.
    pub const fn layout(&self) -> &TableLayout {
        &self.layout
    }

    /// Returns the backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the backend mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Gives up the tables and returns the backend.
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Returns how many coarse tables are hooked into the first-level table.
    pub fn l2_tables_in_use(&self) -> usize {
        self.coarse.iter().filter(|t| t.owner.is_some()).count()
    }

    /// Runs `f` with local interrupts masked.
    ///
    /// Multi-word table updates go through here so that nothing on this CPU observes
    /// a half-written mapping.
    pub fn transaction<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let _irq = IrqGuard::<B::Interrupts>::new();
        f(self)
    }

    /// Maps the page of `size` at `virt` to `phys`.
    ///
    /// Both addresses must be aligned to `size`. Sections and supersections go into
    /// the first-level table; small and large pages go into a coarse table, which is
    /// claimed from the pool and hooked in if the MiB has none yet. Any occupied slot
    /// is reported as [`Error::MappingConflict`].
    pub fn pte_set(
        &mut self,
        phys: PhysicalAddress,
        virt: DspAddress,
        size: PageSize,
        attrs: MapAttributes,
    ) -> Result<()> {
        if !virt.is_aligned(size.bytes()) || !phys.is_aligned(size.bytes()) {
            return Err(Error::InvalidRange);
        }

        if size.is_first_level() {
            self.set_first_level(phys, virt, size, attrs)?;
        } else {
            self.set_second_level(phys, virt, size, attrs)?;
        }

        log::trace!("pte_set {virt} -> {phys} ({size:?})");
        Ok(())
    }

    /// Removes the page of `size` at `virt`.
    ///
    /// Replicas are cleared last to first, so a call that fails part-way can be
    /// retried. A coarse table whose last entry goes is unhooked and returned to the
    /// pool.
    pub fn pte_clear(&mut self, virt: DspAddress, size: PageSize) -> Result<()> {
        if !virt.is_aligned(size.bytes()) {
            return Err(Error::InvalidRange);
        }

        let l1_slot = self.l1_slot(virt);
        let l1 = Entry::decode_l1(self.backend.read_entry(l1_slot)?);

        if size.is_first_level() {
            Self::expect_leaf(&l1, size)?;
            self.clear_replicas(l1_slot, size.replicas())?;
        } else {
            let table = match l1 {
                Entry::Coarse(table) => table,
                Entry::Unmapped => return Err(Error::NotMapped),
                _ => return Err(Error::MappingConflict),
            };
            let index = self
                .layout
                .l2_index_of(table)
                .ok_or(Error::MappingConflict)?;
            let slot = Self::l2_slot(table, virt);
            Self::expect_leaf(&Entry::decode_l2(self.backend.read_entry(slot)?), size)?;

            let (cleared, outcome) = self.clear_replicas_counted(slot, size.replicas());
            let live = &mut self.coarse[index].live;
            *live = live.saturating_sub(cleared as u16);
            outcome?;

            if *live == 0 {
                self.backend.write_entry(l1_slot, 0)?;
                self.coarse[index].owner = None;
                log::trace!("released coarse table {index} at {table}");
            }
        }

        log::trace!("pte_clear {virt} ({size:?})");
        Ok(())
    }

    /// Invalidates the TLB entries caching the page of `size` containing `virt`.
    pub fn tlb_flush(&mut self, virt: DspAddress, size: PageSize) -> Result<()> {
        self.backend
            .flush_tlb_entry(virt.align_down(size.bytes()), size)
    }

    /// Invalidates every TLB entry that is not preserved.
    pub fn tlb_flush_all(&mut self) -> Result<()> {
        self.backend.flush_tlb_all()
    }

    /// Installs `base` as the first-level table base.
    ///
    /// Only legal while translation is disabled. [`PageDirectory::new`] already
    /// installs this directory's table.
    pub fn ttb_set(&mut self, base: PhysicalAddress) -> Result<()> {
        if self.backend.translation_enabled() {
            return Err(Error::TranslationEnabled);
        }
        if !base.is_aligned(L1_TABLE_SIZE) {
            return Err(Error::InvalidRange);
        }
        self.backend.set_ttb(base)
    }

    /// Turns address translation on.
    pub fn enable(&mut self) -> Result<()> {
        log::debug!("enabling device MMU");
        self.backend.set_translation(true)
    }

    /// Turns address translation off.
    pub fn disable(&mut self) -> Result<()> {
        log::debug!("disabling device MMU");
        self.backend.set_translation(false)
    }

    /// Lets the MMU walk the tables on a TLB miss.
    pub fn twl_enable(&mut self) -> Result<()> {
        self.backend.set_table_walk(true)
    }

    /// Stops the MMU from walking the tables; only TLB entries translate.
    pub fn twl_disable(&mut self) -> Result<()> {
        self.backend.set_table_walk(false)
    }

    /// Loads a preserved TLB entry translating the page of `size` at `virt` to `phys`.
    ///
    /// The entry survives [`PageDirectory::tlb_flush_all`] and works with the table
    /// walker off.
    pub fn lock_tlb_entry(
        &mut self,
        phys: PhysicalAddress,
        virt: DspAddress,
        size: PageSize,
        attrs: MapAttributes,
    ) -> Result<()> {
        let entry = TlbEntry {
            virt: virt.align_down(size.bytes()),
            phys: PhysicalAddress::new(phys.as_u32() & size.frame_mask()),
            size,
            attrs,
            preserved: true,
        };
        self.backend.load_tlb_entry(&entry)
    }

    /// Finds the leaf translation covering `virt`.
    pub fn lookup(&self, virt: DspAddress) -> Result<Option<Mapping>> {
        let entry = match Entry::decode_l1(self.backend.read_entry(self.l1_slot(virt))?) {
            Entry::Coarse(table) => {
                Entry::decode_l2(self.backend.read_entry(Self::l2_slot(table, virt))?)
            }
            entry => entry,
        };

        Ok(entry.page_size().zip(entry.target()).map(|(size, (phys, attrs))| Mapping {
            virt: virt.align_down(size.bytes()),
            phys,
            size,
            attrs,
        }))
    }

    /// Translates `virt` through the tables.
    pub fn translate(&self, virt: DspAddress) -> Result<Option<PhysicalAddress>> {
        Ok(self
            .lookup(virt)?
            .map(|mapping| mapping.phys + (virt - mapping.virt)))
    }

    fn l1_slot(&self, virt: DspAddress) -> PhysicalAddress {
        self.layout.l1 + virt.l1_index() as u32 * ENTRY_SIZE
    }

    fn l2_slot(table: PhysicalAddress, virt: DspAddress) -> PhysicalAddress {
        table + virt.l2_index() as u32 * ENTRY_SIZE
    }

    fn expect_leaf(entry: &Entry, size: PageSize) -> Result<()> {
        match entry {
            Entry::Unmapped => Err(Error::NotMapped),
            entry if entry.page_size() == Some(size) => Ok(()),
            _ => Err(Error::MappingConflict),
        }
    }

    fn ensure_vacant(&self, first: PhysicalAddress, count: usize) -> Result<()> {
        for i in 0..count {
            if self.backend.read_entry(first + i as u32 * ENTRY_SIZE)? != 0 {
                return Err(Error::MappingConflict);
            }
        }
        Ok(())
    }

    /// Writes `raw` into `count` consecutive slots. On failure the slots already
    /// written are zeroed again.
    fn write_replicas(&mut self, first: PhysicalAddress, raw: u32, count: usize) -> Result<()> {
        for i in 0..count {
            if let Err(err) = self.backend.write_entry(first + i as u32 * ENTRY_SIZE, raw) {
                for j in (0..i).rev() {
                    let slot = first + j as u32 * ENTRY_SIZE;
                    if let Err(undo) = self.backend.write_entry(slot, 0) {
                        log::error!("could not zero {slot} after failed write: {undo}");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn clear_replicas(&mut self, first: PhysicalAddress, count: usize) -> Result<()> {
        self.clear_replicas_counted(first, count).1
    }

    /// Zeroes non-zero slots from last to first. Returns how many were zeroed.
    fn clear_replicas_counted(&mut self, first: PhysicalAddress, count: usize) -> (usize, Result<()>) {
        let mut cleared = 0;
        for i in (0..count).rev() {
            let slot = first + i as u32 * ENTRY_SIZE;
            let outcome = self.backend.read_entry(slot).and_then(|raw| {
                if raw == 0 {
                    return Ok(false);
                }
                self.backend.write_entry(slot, 0).map(|()| true)
            });
            match outcome {
                Ok(true) => cleared += 1,
                Ok(false) => {}
                Err(err) => return (cleared, Err(err)),
            }
        }
        (cleared, Ok(()))
    }

    fn set_first_level(
        &mut self,
        phys: PhysicalAddress,
        virt: DspAddress,
        size: PageSize,
        attrs: MapAttributes,
    ) -> Result<()> {
        let first = self.l1_slot(virt);
        self.ensure_vacant(first, size.replicas())?;
        let raw = Entry::leaf(phys, size, attrs).encode_l1();
        self.write_replicas(first, raw, size.replicas())
    }

    fn set_second_level(
        &mut self,
        phys: PhysicalAddress,
        virt: DspAddress,
        size: PageSize,
        attrs: MapAttributes,
    ) -> Result<()> {
        let l1_slot = self.l1_slot(virt);
        let (index, fresh) = match Entry::decode_l1(self.backend.read_entry(l1_slot)?) {
            Entry::Coarse(table) => (
                self.layout
                    .l2_index_of(table)
                    .ok_or(Error::MappingConflict)?,
                false,
            ),
            Entry::Unmapped => (self.vacant_coarse_table()?, true),
            _ => return Err(Error::MappingConflict),
        };

        let table = self.layout.l2_table(index);
        let first = Self::l2_slot(table, virt);

        if fresh {
            for i in 0..L2_ENTRIES {
                self.backend
                    .write_entry(table + i as u32 * ENTRY_SIZE, 0)?;
            }
            self.backend
                .write_entry(l1_slot, Entry::Coarse(table).encode_l1())?;
            self.coarse[index].owner = Some(virt.l1_index());
            log::trace!("claimed coarse table {index} at {table} for {virt}");
        } else {
            self.ensure_vacant(first, size.replicas())?;
        }

        let raw = Entry::leaf(phys, size, attrs).encode_l2();
        if let Err(err) = self.write_replicas(first, raw, size.replicas()) {
            if fresh {
                match self.backend.write_entry(l1_slot, 0) {
                    Ok(()) => self.coarse[index].owner = None,
                    Err(undo) => log::error!("could not unhook coarse table {index}: {undo}"),
                }
            }
            return Err(err);
        }

        self.coarse[index].live += size.replicas() as u16;
        Ok(())
    }

    fn vacant_coarse_table(&self) -> Result<usize> {
        self.coarse
            .iter()
            .position(|t| t.owner.is_none())
            .ok_or_else(|| {
                log::warn!("coarse table pool exhausted");
                Error::OutOfMemory
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::software::{EmulatedInterrupts, EmulatedMmu};

    const L1: u32 = 0x8000_0000;
    const L2: u32 = 0x8000_4000;

    fn layout(l2_tables: usize) -> TableLayout {
        TableLayout::new(PhysicalAddress::new(L1), PhysicalAddress::new(L2), l2_tables)
    }

    fn directory(l2_tables: usize) -> PageDirectory<EmulatedMmu> {
        let layout = layout(l2_tables);
        PageDirectory::new(EmulatedMmu::new(&layout), layout).unwrap()
    }

    fn raw(dir: &PageDirectory<EmulatedMmu>, addr: u32) -> u32 {
        dir.backend().read_entry(PhysicalAddress::new(addr)).unwrap()
    }

    fn l1_raw(dir: &PageDirectory<EmulatedMmu>, virt: u32) -> u32 {
        raw(dir, L1 + (virt >> 20) * 4)
    }

    fn attrs() -> MapAttributes {
        MapAttributes {
            endianness: Endianness::Little,
            element_size: ElementSize::Bits32,
            mixed_size: true,
            lock: false,
        }
    }

    #[test]
    fn new_installs_empty_table() {
        let dir = directory(4);
        assert_eq!(dir.backend().ttb(), PhysicalAddress::new(L1));
        assert_eq!(dir.lookup(DspAddress::new(0x2000_0000)).unwrap(), None);
        assert_eq!(dir.l2_tables_in_use(), 0);
        assert_eq!(dir.backend().unguarded_writes(), 0);
    }

    #[test]
    fn rejects_bad_layouts() {
        let misaligned = TableLayout::new(PhysicalAddress::new(0x8000_1000), PhysicalAddress::new(L2), 1);
        assert_eq!(
            PageDirectory::new(EmulatedMmu::new(&layout(1)), misaligned).err(),
            Some(Error::InvalidRange)
        );

        let overlapping = TableLayout::new(PhysicalAddress::new(L1), PhysicalAddress::new(L1 + 0x400), 1);
        assert_eq!(
            PageDirectory::new(EmulatedMmu::new(&layout(1)), overlapping).err(),
            Some(Error::InvalidRange)
        );
    }

    #[test]
    fn table_base_is_fixed_while_translating() {
        let mut mmu = EmulatedMmu::new(&layout(1));
        mmu.set_translation(true).unwrap();
        assert_eq!(
            PageDirectory::new(mmu, layout(1)).err(),
            Some(Error::TranslationEnabled)
        );

        let mut dir = directory(1);
        dir.enable().unwrap();
        assert_eq!(dir.ttb_set(PhysicalAddress::new(L1)), Err(Error::TranslationEnabled));
        dir.disable().unwrap();
        assert_eq!(dir.ttb_set(PhysicalAddress::new(L1 + 0x1000)), Err(Error::InvalidRange));
        dir.ttb_set(PhysicalAddress::new(L1)).unwrap();
    }

    #[test]
    fn small_page_hooks_a_coarse_table() {
        let mut dir = directory(4);
        let virt = DspAddress::new(0x2000_3000);
        let phys = PhysicalAddress::new(0x9000_5000);
        dir.pte_set(phys, virt, PageSize::Small, attrs()).unwrap();

        assert_eq!(l1_raw(&dir, virt.as_u32()), L2 | 1);
        assert_eq!(
            raw(&dir, L2 + 3 * 4),
            Entry::leaf(phys, PageSize::Small, attrs()).encode_l2()
        );
        assert_eq!(dir.l2_tables_in_use(), 1);
        assert_eq!(
            dir.translate(DspAddress::new(0x2000_3abc)).unwrap(),
            Some(PhysicalAddress::new(0x9000_5abc))
        );
        assert_eq!(dir.translate(DspAddress::new(0x2000_4000)).unwrap(), None);
    }

    #[test]
    fn large_page_is_replicated() {
        let mut dir = directory(4);
        let virt = DspAddress::new(0x2001_0000);
        let phys = PhysicalAddress::new(0x9001_0000);
        dir.pte_set(phys, virt, PageSize::Large, attrs()).unwrap();

        let expected = Entry::leaf(phys, PageSize::Large, attrs()).encode_l2();
        for i in 0..16 {
            assert_eq!(raw(&dir, L2 + (0x10 + i) * 4), expected);
        }
        let mapping = dir.lookup(DspAddress::new(0x2001_f000)).unwrap().unwrap();
        assert_eq!(mapping.virt, virt);
        assert_eq!(mapping.size, PageSize::Large);
        assert_eq!(
            dir.translate(DspAddress::new(0x2001_ffff)).unwrap(),
            Some(PhysicalAddress::new(0x9001_ffff))
        );
    }

    #[test]
    fn sections_and_supersections_live_in_first_level() {
        let mut dir = directory(1);
        dir.pte_set(
            PhysicalAddress::new(0x9100_0000),
            DspAddress::new(0x2100_0000),
            PageSize::Supersection,
            attrs(),
        )
        .unwrap();
        dir.pte_set(
            PhysicalAddress::new(0x9230_0000),
            DspAddress::new(0x2030_0000),
            PageSize::Section,
            attrs(),
        )
        .unwrap();

        let first = l1_raw(&dir, 0x2100_0000);
        for mb in 0..16 {
            assert_eq!(l1_raw(&dir, 0x2100_0000 + (mb << 20)), first);
        }
        let mapping = dir.lookup(DspAddress::new(0x21f0_0000)).unwrap().unwrap();
        assert_eq!(mapping.virt, DspAddress::new(0x2100_0000));
        assert_eq!(mapping.size, PageSize::Supersection);
        assert_eq!(
            dir.translate(DspAddress::new(0x2030_1234)).unwrap(),
            Some(PhysicalAddress::new(0x9230_1234))
        );
        assert_eq!(dir.l2_tables_in_use(), 0);
    }

    #[test]
    fn occupied_slots_conflict() {
        let mut dir = directory(4);
        let section = DspAddress::new(0x2000_0000);
        dir.pte_set(PhysicalAddress::new(0x9000_0000), section, PageSize::Section, attrs())
            .unwrap();
        assert_eq!(
            dir.pte_set(PhysicalAddress::new(0x9100_0000), section + 0x1000, PageSize::Small, attrs()),
            Err(Error::MappingConflict)
        );

        let page = DspAddress::new(0x2010_0000);
        dir.pte_set(PhysicalAddress::new(0x9100_0000), page, PageSize::Small, attrs())
            .unwrap();
        assert_eq!(
            dir.pte_set(PhysicalAddress::new(0x9200_0000), page, PageSize::Small, attrs()),
            Err(Error::MappingConflict)
        );
        // The 64K page at the start of the MiB overlaps the 4K page.
        assert_eq!(
            dir.pte_set(PhysicalAddress::new(0x9200_0000), page, PageSize::Large, attrs()),
            Err(Error::MappingConflict)
        );
        // A supersection over MiBs holding a section and a coarse table.
        assert_eq!(
            dir.pte_set(
                PhysicalAddress::new(0x9000_0000),
                DspAddress::new(0x2000_0000),
                PageSize::Supersection,
                attrs()
            ),
            Err(Error::MappingConflict)
        );
    }

    #[test]
    fn misaligned_addresses_are_rejected() {
        let mut dir = directory(1);
        assert_eq!(
            dir.pte_set(
                PhysicalAddress::new(0x9000_1000),
                DspAddress::new(0x2001_0000),
                PageSize::Large,
                attrs()
            ),
            Err(Error::InvalidRange)
        );
        assert_eq!(
            dir.pte_clear(DspAddress::new(0x2000_0800), PageSize::Small),
            Err(Error::InvalidRange)
        );
    }

    #[test]
    fn clearing_the_last_page_releases_the_coarse_table() {
        let mut dir = directory(2);
        let a = DspAddress::new(0x2000_0000);
        let b = DspAddress::new(0x2000_1000);
        dir.pte_set(PhysicalAddress::new(0x9000_0000), a, PageSize::Small, attrs())
            .unwrap();
        dir.pte_set(PhysicalAddress::new(0x9000_8000), b, PageSize::Small, attrs())
            .unwrap();

        dir.pte_clear(a, PageSize::Small).unwrap();
        assert_eq!(dir.l2_tables_in_use(), 1);
        assert_eq!(l1_raw(&dir, a.as_u32()), L2 | 1);

        dir.pte_clear(b, PageSize::Small).unwrap();
        assert_eq!(dir.l2_tables_in_use(), 0);
        assert_eq!(l1_raw(&dir, a.as_u32()), 0);
        assert_eq!(dir.pte_clear(b, PageSize::Small), Err(Error::NotMapped));
    }

    #[test]
    fn coarse_pool_exhaustion() {
        let mut dir = directory(1);
        let first = DspAddress::new(0x2000_0000);
        let second = DspAddress::new(0x2010_0000);
        dir.pte_set(PhysicalAddress::new(0x9000_0000), first, PageSize::Small, attrs())
            .unwrap();
        assert_eq!(
            dir.pte_set(PhysicalAddress::new(0x9000_1000), second, PageSize::Small, attrs()),
            Err(Error::OutOfMemory)
        );

        dir.pte_clear(first, PageSize::Small).unwrap();
        dir.pte_set(PhysicalAddress::new(0x9000_1000), second, PageSize::Small, attrs())
            .unwrap();
        assert_eq!(l1_raw(&dir, second.as_u32()), L2 | 1);
    }

    #[test]
    fn failed_set_leaves_no_entry() {
        let mut dir = directory(1);
        // Fresh table: 256 zeroing writes, the coarse pointer, then 16 replicas.
        dir.backend_mut().fail_write_after(L2_ENTRIES + 1 + 5);
        assert_eq!(
            dir.pte_set(
                PhysicalAddress::new(0x9001_0000),
                DspAddress::new(0x2001_0000),
                PageSize::Large,
                attrs()
            ),
            Err(Error::HardwareFault)
        );

        assert_eq!(l1_raw(&dir, 0x2001_0000), 0);
        assert_eq!(dir.l2_tables_in_use(), 0);
        assert!(dir.backend().table_memory().iter().all(|&w| w == 0));
    }

    #[test]
    fn interrupted_clear_can_be_retried() {
        let mut dir = directory(1);
        let virt = DspAddress::new(0x2001_0000);
        dir.pte_set(PhysicalAddress::new(0x9001_0000), virt, PageSize::Large, attrs())
            .unwrap();

        dir.backend_mut().fail_write_after(3);
        assert_eq!(dir.pte_clear(virt, PageSize::Large), Err(Error::HardwareFault));
        assert!(dir.lookup(virt).unwrap().is_some());

        dir.pte_clear(virt, PageSize::Large).unwrap();
        assert_eq!(dir.l2_tables_in_use(), 0);
        assert!(dir.backend().table_memory().iter().all(|&w| w == 0));
    }

    #[test]
    fn locked_entries_survive_global_flush() {
        let mut dir = directory(1);
        let virt = DspAddress::new(0x2000_0000);
        dir.lock_tlb_entry(PhysicalAddress::new(0x9000_0000), virt, PageSize::Small, attrs())
            .unwrap();
        dir.tlb_flush_all().unwrap();

        let tlb = dir.backend().tlb_entries();
        assert_eq!(tlb.len(), 1);
        assert!(tlb[0].preserved);
        assert!(tlb[0].covers(virt));

        dir.tlb_flush(virt, PageSize::Small).unwrap();
        assert!(dir.backend().tlb_entries().is_empty());
    }

    #[test]
    fn locked_entry_translates_without_the_walker() {
        let mut dir = directory(1);
        dir.lock_tlb_entry(
            PhysicalAddress::new(0x9010_0000),
            DspAddress::new(0x2010_0000),
            PageSize::Section,
            attrs(),
        )
        .unwrap();
        dir.enable().unwrap();
        assert!(!dir.backend().table_walk_enabled());
        assert_eq!(
            dir.backend_mut().access(DspAddress::new(0x2018_0000)),
            Some(PhysicalAddress::new(0x9018_0000))
        );
        assert_eq!(dir.backend_mut().access(DspAddress::new(0x2020_0000)), None);
    }

    #[test]
    fn transaction_masks_interrupts() {
        let mut dir = directory(1);
        let inside = dir.transaction(|_| Ok(EmulatedInterrupts::enabled())).unwrap();
        assert!(!inside);
        assert!(EmulatedInterrupts::enabled());
    }
}
