//! Packet format and packetization.
//!
//! A heap is split into packets that each carry the full item pointer table
//! plus a contiguous slice of the heap payload.
//!
//! # Packet Format
//!
//! ```text
//! +---------------------------+
//! | 0x53 0x04 ipw haw 0 0 n n |  magic, version, widths, item count (u16 BE)
//! +---------------------------+
//! | HEAP_CNT       (imm)      |
//! | HEAP_LENGTH    (imm)      |
//! | PAYLOAD_OFFSET (imm)      |  packet items, 8 bytes each, big-endian
//! | PAYLOAD_LENGTH (imm)      |
//! +---------------------------+
//! | item pointers             |  (n - 4) x 8 bytes, same in every packet
//! +---------------------------+
//! | payload slice             |  PAYLOAD_LENGTH bytes at PAYLOAD_OFFSET
//! +---------------------------+
//! ```
//!
//! `ipw + haw` is always 8; `haw` is the heap address width in bytes.
//!
//! # Size Constraint
//!
//! `HEADER_SIZE + POINTER_SIZE * n + payload_length <= max_packet_size`
//!
//! Packets are identified by payload offset, so receiving one twice is
//! harmless.

use crate::error::{PacketError, Result};
use crate::flavour::{ids, BugCompat, Flavour};
use crate::heap::Heap;

/// First header byte
pub const MAGIC: u8 = 0x53;

/// Protocol version
pub const VERSION: u8 = 4;

/// Size of packet header in bytes
pub const HEADER_SIZE: usize = 8;

/// Size of one item pointer in bytes
pub const POINTER_SIZE: usize = 8;

/// Number of pointers every packet spends on its own bookkeeping
pub const PACKET_ITEMS: usize = 4;

/// Total size of a packet with `n_pointers` heap pointers and `payload_len`
/// payload bytes.
pub fn packet_size(n_pointers: usize, payload_len: usize) -> usize {
    HEADER_SIZE + POINTER_SIZE * (PACKET_ITEMS + n_pointers) + payload_len
}

/// One SPEAD packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub heap_cnt: u64,

    /// Length of the whole heap payload
    pub heap_length: u64,

    /// Where this packet's payload slice starts within the heap
    pub payload_offset: u64,

    pub payload_length: u64,

    pub heap_address_bits: u32,

    /// Heap item pointers (raw, packet items excluded), in table order
    pub pointers: Vec<u64>,

    pub payload: Vec<u8>,
}

fn immediate_word(heap_address_bits: u32, id: u64, value: u64) -> u64 {
    (1u64 << 63) | (id << heap_address_bits) | value
}

/// Write one packet. Every field must already be known to fit.
fn write_packet(
    out: &mut Vec<u8>,
    heap_address_bits: u32,
    heap_cnt: u64,
    heap_length: u64,
    payload_offset: u64,
    pointers: &[u64],
    payload: &[u8],
) {
    let haw = (heap_address_bits / 8) as u8;
    let n_items = (PACKET_ITEMS + pointers.len()) as u16;
    out.reserve(packet_size(pointers.len(), payload.len()));

    out.extend_from_slice(&[MAGIC, VERSION, 8 - haw, haw, 0, 0]);
    out.extend_from_slice(&n_items.to_be_bytes());
    for (id, value) in [
        (ids::HEAP_CNT, heap_cnt),
        (ids::HEAP_LENGTH, heap_length),
        (ids::PAYLOAD_OFFSET, payload_offset),
        (ids::PAYLOAD_LENGTH, payload.len() as u64),
    ] {
        out.extend_from_slice(&immediate_word(heap_address_bits, id, value).to_be_bytes());
    }
    for pointer in pointers {
        out.extend_from_slice(&pointer.to_be_bytes());
    }
    out.extend_from_slice(payload);
}

fn check_fits(flavour: &Flavour, field: &'static str, value: u64) -> Result<()> {
    if value > flavour.max_address() {
        return Err(PacketError::FieldOverflow {
            field,
            value,
            bits: flavour.heap_address_bits(),
        }
        .into());
    }
    Ok(())
}

fn check_item_count(n_pointers: usize) -> Result<()> {
    if PACKET_ITEMS + n_pointers > u16::MAX as usize {
        return Err(PacketError::TooManyItems(n_pointers).into());
    }
    Ok(())
}

impl Packet {
    /// Serialize this packet into bytes for transmission.
    ///
    /// # Errors
    /// - `PacketError::FieldOverflow` if a packet item exceeds the heap address width
    /// - `PacketError::PayloadLengthMismatch` if `payload_length` disagrees with `payload`
    /// - `PacketError::TooManyItems` if the pointer table does not fit the header
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let flavour = Flavour::new(self.heap_address_bits, BugCompat::empty())?;
        if self.payload_length != self.payload.len() as u64 {
            return Err(PacketError::PayloadLengthMismatch {
                expected: self.payload_length as usize,
                actual: self.payload.len(),
            }
            .into());
        }
        check_item_count(self.pointers.len())?;
        check_fits(&flavour, "heap cnt", self.heap_cnt)?;
        check_fits(&flavour, "heap length", self.heap_length)?;
        check_fits(&flavour, "payload offset", self.payload_offset)?;

        let mut bytes = Vec::new();
        write_packet(
            &mut bytes,
            self.heap_address_bits,
            self.heap_cnt,
            self.heap_length,
            self.payload_offset,
            &self.pointers,
            &self.payload,
        );
        Ok(bytes)
    }

    /// Deserialize a packet from the front of `bytes`.
    ///
    /// Returns the packet and the number of bytes it occupied; anything after
    /// that belongs to the next packet.
    ///
    /// # Errors
    /// - `PacketError::PacketTooShort` if the header or pointer table is cut off
    /// - `PacketError::InvalidMagic` / `InvalidVersion` / `InvalidFlavour` for a bad header
    /// - `PacketError::MissingItem` / `NotImmediate` for bad packet items
    /// - `PacketError::PayloadLengthMismatch` if the payload is cut off
    /// - `PacketError::PayloadOutOfRange` if the slice does not lie inside the heap
    pub fn deserialize(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::PacketTooShort {
                required: HEADER_SIZE,
                actual: bytes.len(),
            }
            .into());
        }
        if bytes[0] != MAGIC {
            return Err(PacketError::InvalidMagic {
                expected: MAGIC,
                actual: bytes[0],
            }
            .into());
        }
        if bytes[1] != VERSION {
            return Err(PacketError::InvalidVersion(bytes[1]).into());
        }
        let (ipw, haw) = (bytes[2], bytes[3]);
        if haw == 0 || haw >= 8 || ipw as u32 + haw as u32 != 8 {
            return Err(PacketError::InvalidFlavour {
                item_pointer_width: ipw,
                heap_address_width: haw,
            }
            .into());
        }
        let heap_address_bits = haw as u32 * 8;
        let flavour = Flavour::new(heap_address_bits, BugCompat::empty())?;

        let n_items = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;
        let payload_start = HEADER_SIZE + n_items * POINTER_SIZE;
        if bytes.len() < payload_start {
            return Err(PacketError::PacketTooShort {
                required: payload_start,
                actual: bytes.len(),
            }
            .into());
        }

        let mut heap_cnt = None;
        let mut heap_length = None;
        let mut payload_offset = None;
        let mut payload_length = None;
        let mut pointers = Vec::with_capacity(n_items.saturating_sub(PACKET_ITEMS));
        for chunk in bytes[HEADER_SIZE..payload_start].chunks_exact(POINTER_SIZE) {
            let mut word = [0u8; POINTER_SIZE];
            word.copy_from_slice(chunk);
            let raw = u64::from_be_bytes(word);
            let ptr = flavour.decode_pointer(raw);
            let slot = match ptr.id {
                ids::HEAP_CNT => &mut heap_cnt,
                ids::HEAP_LENGTH => &mut heap_length,
                ids::PAYLOAD_OFFSET => &mut payload_offset,
                ids::PAYLOAD_LENGTH => &mut payload_length,
                _ => {
                    pointers.push(raw);
                    continue;
                }
            };
            if !ptr.is_immediate {
                return Err(PacketError::NotImmediate { id: ptr.id }.into());
            }
            *slot = Some(ptr.value);
        }

        let heap_cnt = heap_cnt.ok_or(PacketError::MissingItem("heap cnt"))?;
        let heap_length = heap_length.ok_or(PacketError::MissingItem("heap length"))?;
        let payload_offset = payload_offset.ok_or(PacketError::MissingItem("payload offset"))?;
        let payload_length = payload_length.ok_or(PacketError::MissingItem("payload length"))?;

        let available = bytes.len() - payload_start;
        if (available as u64) < payload_length {
            return Err(PacketError::PayloadLengthMismatch {
                expected: payload_length as usize,
                actual: available,
            }
            .into());
        }
        if payload_offset + payload_length > heap_length {
            return Err(PacketError::PayloadOutOfRange {
                offset: payload_offset,
                length: payload_length,
                heap_length,
            }
            .into());
        }

        let end = payload_start + payload_length as usize;
        let packet = Self {
            heap_cnt,
            heap_length,
            payload_offset,
            payload_length,
            heap_address_bits,
            pointers,
            payload: bytes[payload_start..end].to_vec(),
        };
        Ok((packet, end))
    }

    /// Size of this packet when serialized.
    pub fn size(&self) -> usize {
        packet_size(self.pointers.len(), self.payload.len())
    }

    /// Byte range of the heap covered by this packet.
    pub fn payload_range(&self) -> std::ops::Range<u64> {
        self.payload_offset..self.payload_offset + self.payload_length
    }
}

/// Decode the packet at the front of `bytes`. See [`Packet::deserialize`].
pub fn decode_packet(bytes: &[u8]) -> Result<(Packet, usize)> {
    Packet::deserialize(bytes)
}

/// Iterator over the wire packets of one heap.
#[derive(Debug, Clone)]
pub struct PacketGenerator {
    heap_cnt: u64,
    heap_address_bits: u32,
    pointers: Vec<u64>,
    payload: Vec<u8>,
    max_slice: usize,
    next_offset: usize,
    done: bool,
}

impl PacketGenerator {
    /// Number of packets the heap needs.
    pub fn packet_count(&self) -> usize {
        self.payload.len().div_ceil(self.max_slice).max(1)
    }

    pub fn heap_cnt(&self) -> u64 {
        self.heap_cnt
    }
}

impl Iterator for PacketGenerator {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }
        let start = self.next_offset;
        let end = (start + self.max_slice).min(self.payload.len());
        let mut packet = Vec::new();
        write_packet(
            &mut packet,
            self.heap_address_bits,
            self.heap_cnt,
            self.payload.len() as u64,
            start as u64,
            &self.pointers,
            &self.payload[start..end],
        );
        self.next_offset = end;
        self.done = end >= self.payload.len();
        Some(packet)
    }
}

/// Split a heap into packets of at most `max_packet_size` bytes.
///
/// A heap with no payload still yields one packet carrying its pointers.
///
/// # Errors
/// - `PacketError::PacketTooSmall` if the pointer table leaves no room for payload
/// - `PacketError::TooManyItems` / `FieldOverflow` if the heap cannot be represented
pub fn packetize(heap: &Heap, max_packet_size: usize) -> Result<PacketGenerator> {
    let flavour = heap.flavour();
    let (pointers, payload) = heap.layout()?;
    check_item_count(pointers.len())?;
    check_fits(flavour, "heap cnt", heap.cnt())?;
    check_fits(flavour, "heap length", payload.len() as u64)?;

    let overhead = packet_size(pointers.len(), 0);
    let needed = overhead + usize::from(!payload.is_empty());
    if max_packet_size < needed {
        return Err(PacketError::PacketTooSmall {
            max_packet_size,
            overhead,
        }
        .into());
    }

    Ok(PacketGenerator {
        heap_cnt: heap.cnt(),
        heap_address_bits: flavour.heap_address_bits(),
        pointers,
        payload,
        max_slice: (max_packet_size - overhead).max(1),
        next_offset: 0,
        done: false,
    })
}
