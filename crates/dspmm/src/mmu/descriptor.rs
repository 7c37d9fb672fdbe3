//! Page table descriptor formats.
//!
//! The device MMU walks ARM-style two-level tables. A first-level entry covers one MiB
//! and is either unmapped, a pointer to a coarse second-level table, a 1 MiB section,
//! or one of sixteen replicas of a 16 MiB supersection. A second-level entry covers
//! 4 KiB and is either unmapped, a 4 KiB small page, or one of sixteen replicas of a
//! 64 KiB large page.
//!
//! Layout of the mapping attributes inside a descriptor:
//!
//! ```text
//!                endianness  element size  mixed
//! section (L1)   bit 15      bits 11:10    bit 17     supersection flag: bit 18
//! page (L2)      bit 9       bits 5:4      bit 11
//! ```

use crate::PhysicalAddress;

const TYPE_MASK: u32 = 0b11;
const L1_COARSE: u32 = 0b01;
const L1_SECTION: u32 = 0b10;
const L1_SUPERSECTION_BIT: u32 = 1 << 18;
const L2_LARGE: u32 = 0b01;
const L2_SMALL: u32 = 0b10;

const COARSE_ADDRESS_MASK: u32 = 0xFFFF_FC00;

/// The four page sizes the device MMU can map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageSize {
    /// 4 KiB page, second level.
    Small,
    /// 64 KiB page, second level, replicated over 16 entries.
    Large,
    /// 1 MiB section, first level.
    Section,
    /// 16 MiB supersection, first level, replicated over 16 entries.
    Supersection,
}

impl PageSize {
    /// All page sizes, largest first.
    pub const DESCENDING: [PageSize; 4] = [
        PageSize::Supersection,
        PageSize::Section,
        PageSize::Large,
        PageSize::Small,
    ];

    /// Size in bytes.
    pub const fn bytes(self) -> u32 {
        match self {
            PageSize::Small => 0x1000,
            PageSize::Large => 0x1_0000,
            PageSize::Section => 0x10_0000,
            PageSize::Supersection => 0x100_0000,
        }
    }

    /// Address mask selecting the page frame.
    pub const fn frame_mask(self) -> u32 {
        !(self.bytes() - 1)
    }

    /// Returns true if the page is mapped directly by a first-level entry.
    pub const fn is_first_level(self) -> bool {
        matches!(self, PageSize::Section | PageSize::Supersection)
    }

    /// Number of consecutive table entries holding the descriptor.
    pub const fn replicas(self) -> usize {
        match self {
            PageSize::Large | PageSize::Supersection => 16,
            PageSize::Small | PageSize::Section => 1,
        }
    }

    /// Returns the largest page size that fits `len` bytes with `addr_bits` aligned to it.
    ///
    /// `addr_bits` is the bitwise OR of every address that must be aligned.
    pub fn largest_fitting(addr_bits: u32, len: u32) -> Option<PageSize> {
        Self::DESCENDING
            .into_iter()
            .find(|size| len >= size.bytes() && addr_bits & (size.bytes() - 1) == 0)
    }
}

/// Byte order the device uses when accessing a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    pub(crate) const fn bit(self) -> u32 {
        match self {
            Endianness::Little => 0,
            Endianness::Big => 1,
        }
    }
}

/// Element size the device uses when accessing a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementSize {
    Bits8,
    #[default]
    Bits16,
    Bits32,
    Bits64,
}

impl ElementSize {
    pub(crate) const fn bits(self) -> u32 {
        match self {
            ElementSize::Bits8 => 0,
            ElementSize::Bits16 => 1,
            ElementSize::Bits32 => 2,
            ElementSize::Bits64 => 3,
        }
    }

    const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => ElementSize::Bits8,
            1 => ElementSize::Bits16,
            2 => ElementSize::Bits32,
            _ => ElementSize::Bits64,
        }
    }
}

/// Attributes carried by every direct mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapAttributes {
    pub endianness: Endianness,
    pub element_size: ElementSize,
    /// Use the CPU access size instead of the page element size.
    pub mixed_size: bool,
    /// Lock the translation into the TLB as a preserved entry once it is mapped.
    ///
    /// Not stored in the page table; decoded descriptors always report `false`.
    pub lock: bool,
}

impl MapAttributes {
    const fn encode(self, endian_shift: u32, size_shift: u32, mixed_shift: u32) -> u32 {
        (self.endianness.bit() << endian_shift)
            | (self.element_size.bits() << size_shift)
            | ((self.mixed_size as u32) << mixed_shift)
    }

    const fn decode(raw: u32, endian_shift: u32, size_shift: u32, mixed_shift: u32) -> Self {
        Self {
            endianness: if raw & (1 << endian_shift) != 0 {
                Endianness::Big
            } else {
                Endianness::Little
            },
            element_size: ElementSize::from_bits(raw >> size_shift),
            mixed_size: raw & (1 << mixed_shift) != 0,
            lock: false,
        }
    }

    const fn encode_section(self) -> u32 {
        self.encode(15, 10, 17)
    }

    const fn encode_page(self) -> u32 {
        self.encode(9, 4, 11)
    }
}

/// A decoded page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Nothing mapped.
    Unmapped,
    /// First-level pointer to a coarse second-level table.
    Coarse(PhysicalAddress),
    /// 1 MiB direct mapping.
    Section {
        address: PhysicalAddress,
        attrs: MapAttributes,
    },
    /// 16 MiB direct mapping.
    Supersection {
        address: PhysicalAddress,
        attrs: MapAttributes,
    },
    /// 64 KiB direct mapping.
    LargePage {
        address: PhysicalAddress,
        attrs: MapAttributes,
    },
    /// 4 KiB direct mapping.
    SmallPage {
        address: PhysicalAddress,
        attrs: MapAttributes,
    },
}

impl Entry {
    /// Builds the leaf entry mapping `address` with a page of `size`.
    pub const fn leaf(address: PhysicalAddress, size: PageSize, attrs: MapAttributes) -> Self {
        match size {
            PageSize::Small => Entry::SmallPage { address, attrs },
            PageSize::Large => Entry::LargePage { address, attrs },
            PageSize::Section => Entry::Section { address, attrs },
            PageSize::Supersection => Entry::Supersection { address, attrs },
        }
    }

    /// Returns the page size of a leaf entry.
    pub const fn page_size(&self) -> Option<PageSize> {
        match self {
            Entry::SmallPage { .. } => Some(PageSize::Small),
            Entry::LargePage { .. } => Some(PageSize::Large),
            Entry::Section { .. } => Some(PageSize::Section),
            Entry::Supersection { .. } => Some(PageSize::Supersection),
            Entry::Unmapped | Entry::Coarse(_) => None,
        }
    }

    /// Returns the physical frame and attributes of a leaf entry.
    pub const fn target(&self) -> Option<(PhysicalAddress, MapAttributes)> {
        match *self {
            Entry::SmallPage { address, attrs }
            | Entry::LargePage { address, attrs }
            | Entry::Section { address, attrs }
            | Entry::Supersection { address, attrs } => Some((address, attrs)),
            Entry::Unmapped | Entry::Coarse(_) => None,
        }
    }

    /// Encodes a first-level entry.
    ///
    /// # Panics
    ///
    /// Panics if called on a second-level page.
    pub const fn encode_l1(&self) -> u32 {
        match *self {
            Entry::Unmapped => 0,
            Entry::Coarse(table) => (table.as_u32() & COARSE_ADDRESS_MASK) | L1_COARSE,
            Entry::Section { address, attrs } => {
                ((address.as_u32() & PageSize::Section.frame_mask()) | attrs.encode_section())
                    & !L1_SUPERSECTION_BIT
                    | L1_SECTION
            }
            Entry::Supersection { address, attrs } => {
                (address.as_u32() & PageSize::Supersection.frame_mask())
                    | attrs.encode_section()
                    | L1_SUPERSECTION_BIT
                    | L1_SECTION
            }
            Entry::LargePage { .. } | Entry::SmallPage { .. } => {
                panic!("second-level page in a first-level table")
            }
        }
    }

    /// Encodes a second-level entry.
    ///
    /// # Panics
    ///
    /// Panics if called on a first-level entry kind.
    pub const fn encode_l2(&self) -> u32 {
        match *self {
            Entry::Unmapped => 0,
            Entry::LargePage { address, attrs } => {
                (address.as_u32() & PageSize::Large.frame_mask()) | attrs.encode_page() | L2_LARGE
            }
            Entry::SmallPage { address, attrs } => {
                (address.as_u32() & PageSize::Small.frame_mask()) | attrs.encode_page() | L2_SMALL
            }
            Entry::Coarse(_) | Entry::Section { .. } | Entry::Supersection { .. } => {
                panic!("first-level entry in a second-level table")
            }
        }
    }

    /// Decodes a first-level entry.
    pub const fn decode_l1(raw: u32) -> Self {
        match raw & TYPE_MASK {
            L1_COARSE => Entry::Coarse(PhysicalAddress::new(raw & COARSE_ADDRESS_MASK)),
            L1_SECTION if raw & L1_SUPERSECTION_BIT != 0 => Entry::Supersection {
                address: PhysicalAddress::new(raw & PageSize::Supersection.frame_mask()),
                attrs: MapAttributes::decode(raw, 15, 10, 17),
            },
            L1_SECTION => Entry::Section {
                address: PhysicalAddress::new(raw & PageSize::Section.frame_mask()),
                attrs: MapAttributes::decode(raw, 15, 10, 17),
            },
            // Fine tables are never installed by this driver.
            _ => Entry::Unmapped,
        }
    }

    /// Decodes a second-level entry.
    pub const fn decode_l2(raw: u32) -> Self {
        match raw & TYPE_MASK {
            0 => Entry::Unmapped,
            L2_LARGE => Entry::LargePage {
                address: PhysicalAddress::new(raw & PageSize::Large.frame_mask()),
                attrs: MapAttributes::decode(raw, 9, 4, 11),
            },
            _ => Entry::SmallPage {
                address: PhysicalAddress::new(raw & PageSize::Small.frame_mask()),
                attrs: MapAttributes::decode(raw, 9, 4, 11),
            },
        }
    }
}
