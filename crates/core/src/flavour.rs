//! Protocol flavour: heap address width and legacy bug compatibility.
//!
//! A SPEAD-64-N item pointer is one big-endian 64-bit word:
//!
//! ```text
//!  63   62 ........... N   N-1 .......... 0
//! +----+------------------+-----------------+
//! | IM |  item id         | value / address |
//! +----+------------------+-----------------+
//! ```
//!
//! `IM` set means the low N bits hold the value itself (an immediate);
//! clear means they hold an offset into the heap payload. N is the heap
//! address width in bits ("heap address bits", 40 or 48 in practice).
//!
//! All width arithmetic, including the legacy PySPEAD deviations, lives here
//! so the generator and reassembler never branch on bug-compat flags.

use bitflags::bitflags;

use crate::error::{Error, PacketError, Result};

/// Heap address width used when none is configured.
pub const DEFAULT_HEAP_ADDRESS_BITS: u32 = 40;

/// Reserved item ids.
pub mod ids {
    pub const NULL: u64 = 0x00;
    pub const HEAP_CNT: u64 = 0x01;
    pub const HEAP_LENGTH: u64 = 0x02;
    pub const PAYLOAD_OFFSET: u64 = 0x03;
    pub const PAYLOAD_LENGTH: u64 = 0x04;
    pub const DESCRIPTOR: u64 = 0x05;
    pub const STREAM_CTRL: u64 = 0x06;
    pub const DESCRIPTOR_NAME: u64 = 0x10;
    pub const DESCRIPTOR_DESCRIPTION: u64 = 0x11;
    pub const DESCRIPTOR_SHAPE: u64 = 0x12;
    pub const DESCRIPTOR_FORMAT: u64 = 0x13;
    pub const DESCRIPTOR_ID: u64 = 0x14;
    pub const DESCRIPTOR_DTYPE: u64 = 0x15;

    /// First id available to applications; everything below is protocol space.
    pub const FIRST_USER_ID: u64 = 0x1000;
}

/// Values carried by the `STREAM_CTRL` item.
pub mod ctrl {
    pub const STREAM_START: u64 = 0;
    pub const DESCRIPTOR_REISSUE: u64 = 1;
    pub const STREAM_STOP: u64 = 2;
    pub const DESCRIPTOR_UPDATE: u64 = 3;
}

bitflags! {
    /// Deviations from the SPEAD protocol made by PySPEAD 0.5.2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BugCompat: u32 {
        /// Descriptor format fields are 4 bytes and shape fields 8 bytes,
        /// instead of being derived from the heap address width.
        const DESCRIPTOR_WIDTHS = 1 << 0;
        /// A variable-length dimension is flagged with bit 1 instead of bit 0.
        const SHAPE_BIT_1 = 1 << 1;
        /// The dtype in a descriptor declares the opposite byte order to the data.
        const SWAP_ENDIAN = 1 << 2;
        /// An item only becomes an immediate if it is strictly shorter than
        /// the immediate field.
        const NARROW_IMMEDIATES = 1 << 3;
        /// Everything needed to talk to PySPEAD 0.5.2.
        const PYSPEAD_0_5_2 = Self::DESCRIPTOR_WIDTHS.bits()
            | Self::SHAPE_BIT_1.bits()
            | Self::SWAP_ENDIAN.bits()
            | Self::NARROW_IMMEDIATES.bits();
    }
}

impl BugCompat {
    /// Parse a flag by its configuration name (case-insensitive).
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "descriptor_widths" => Some(Self::DESCRIPTOR_WIDTHS),
            "shape_bit_1" => Some(Self::SHAPE_BIT_1),
            "swap_endian" => Some(Self::SWAP_ENDIAN),
            "narrow_immediates" => Some(Self::NARROW_IMMEDIATES),
            "pyspead_0_5_2" | "pyspead" => Some(Self::PYSPEAD_0_5_2),
            _ => None,
        }
    }
}

/// A decoded item pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPointer {
    pub id: u64,
    pub is_immediate: bool,
    /// Immediate value, or payload offset for address-mode pointers
    pub value: u64,
}

/// Heap address width plus bug-compat flags. Immutable once built and
/// passed explicitly to everything that touches the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flavour {
    heap_address_bits: u32,
    bug_compat: BugCompat,
}

impl Default for Flavour {
    fn default() -> Self {
        Self {
            heap_address_bits: DEFAULT_HEAP_ADDRESS_BITS,
            bug_compat: BugCompat::empty(),
        }
    }
}

impl Flavour {
    /// Build a flavour.
    ///
    /// # Errors
    /// `Error::Config` unless `heap_address_bits` is a multiple of 8 in 8..=56.
    /// Legacy mode (any bug-compat flag) only exists as SPEAD-64-40 and
    /// SPEAD-64-48.
    pub fn new(heap_address_bits: u32, bug_compat: BugCompat) -> Result<Self> {
        if heap_address_bits == 0 || heap_address_bits >= 64 || heap_address_bits % 8 != 0 {
            return Err(Error::Config(format!(
                "heap_address_bits {heap_address_bits} must be a multiple of 8 between 8 and 56"
            )));
        }
        if !bug_compat.is_empty() && heap_address_bits != 40 && heap_address_bits != 48 {
            return Err(Error::Config(format!(
                "bug compatibility {bug_compat:?} requires 40 or 48 heap address bits, got {heap_address_bits}"
            )));
        }
        Ok(Self {
            heap_address_bits,
            bug_compat,
        })
    }

    pub fn heap_address_bits(&self) -> u32 {
        self.heap_address_bits
    }

    pub fn bug_compat(&self) -> BugCompat {
        self.bug_compat
    }

    /// Width of the id field in bits.
    pub fn id_bits(&self) -> u32 {
        63 - self.heap_address_bits
    }

    /// Largest id an item pointer can carry.
    pub fn max_id(&self) -> u64 {
        (1u64 << self.id_bits()) - 1
    }

    /// Largest value or address an item pointer can carry.
    pub fn max_address(&self) -> u64 {
        (1u64 << self.heap_address_bits) - 1
    }

    /// Item-pointer width byte of the packet header.
    pub fn item_pointer_width(&self) -> u8 {
        ((64 - self.heap_address_bits) / 8) as u8
    }

    /// Heap-address width byte of the packet header.
    pub fn heap_address_width(&self) -> u8 {
        (self.heap_address_bits / 8) as u8
    }

    /// Bytes available to an immediate value.
    pub fn immediate_size(&self) -> usize {
        (self.heap_address_bits / 8) as usize
    }

    /// Whether an item of `len` bytes is sent inline in its pointer.
    pub fn fits_immediate(&self, len: usize) -> bool {
        if self.bug_compat.contains(BugCompat::NARROW_IMMEDIATES) {
            len < self.immediate_size()
        } else {
            len <= self.immediate_size()
        }
    }

    /// Bytes per entry of a descriptor's format list.
    pub fn format_field_size(&self) -> usize {
        if self.bug_compat.contains(BugCompat::DESCRIPTOR_WIDTHS) {
            4
        } else {
            9 - (self.heap_address_bits / 8) as usize
        }
    }

    /// Bytes per entry of a descriptor's shape list.
    pub fn shape_field_size(&self) -> usize {
        if self.bug_compat.contains(BugCompat::DESCRIPTOR_WIDTHS) {
            8
        } else {
            1 + (self.heap_address_bits / 8) as usize
        }
    }

    /// Flag byte marking a variable-length shape dimension.
    pub fn variable_shape_tag(&self) -> u8 {
        if self.bug_compat.contains(BugCompat::SHAPE_BIT_1) {
            2
        } else {
            1
        }
    }

    /// True if `id` may be used for an application item.
    pub fn is_user_id(&self, id: u64) -> bool {
        id >= ids::FIRST_USER_ID && id <= self.max_id()
    }

    fn check_id(&self, id: u64) -> Result<()> {
        if id > self.max_id() {
            return Err(PacketError::FieldOverflow {
                field: "item id",
                value: id,
                bits: self.id_bits(),
            }
            .into());
        }
        Ok(())
    }

    /// Pointer whose low bits are the value itself.
    pub fn encode_immediate(&self, id: u64, value: u64) -> Result<u64> {
        self.check_id(id)?;
        if value > self.max_address() {
            return Err(PacketError::FieldOverflow {
                field: "immediate value",
                value,
                bits: self.heap_address_bits,
            }
            .into());
        }
        Ok((1u64 << 63) | (id << self.heap_address_bits) | value)
    }

    /// Pointer whose low bits are an offset into the heap payload.
    pub fn encode_address(&self, id: u64, offset: u64) -> Result<u64> {
        self.check_id(id)?;
        if offset > self.max_address() {
            return Err(PacketError::FieldOverflow {
                field: "heap address",
                value: offset,
                bits: self.heap_address_bits,
            }
            .into());
        }
        Ok((id << self.heap_address_bits) | offset)
    }

    pub fn decode_pointer(&self, raw: u64) -> ItemPointer {
        ItemPointer {
            id: (raw >> self.heap_address_bits) & self.max_id(),
            is_immediate: raw >> 63 == 1,
            value: raw & self.max_address(),
        }
    }

    /// The immediate field of a pointer as big-endian bytes.
    pub fn immediate_bytes(&self, value: u64) -> Vec<u8> {
        value.to_be_bytes()[8 - self.immediate_size()..].to_vec()
    }
}
