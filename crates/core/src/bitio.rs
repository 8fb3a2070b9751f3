//! Bit cursor for packing fields that are not byte aligned.
//!
//! Fallback-format items lay out their fields as one contiguous MSB-first
//! bitstream: a 4-bit field followed by a 64-bit field occupies bits 0..4 and
//! 4..68, with no padding in between. `BitWriter` and `BitReader` are the only
//! place in the crate that shifts bits across byte boundaries.
//!
//! # Padding Rules
//! - BitWriter: pads the final partial byte with trailing zeros
//! - BitReader: the caller decides how many bits are meaningful
//!
//! # Example
//! ```
//! use spead_core::bitio::{BitReader, BitWriter};
//!
//! let mut writer = BitWriter::new();
//! writer.write_bits(12, 4).unwrap();
//! writer.write_signed(-3, 4).unwrap();
//! let bytes = writer.finish();
//! assert_eq!(bytes, vec![0xCD]);
//!
//! let mut reader = BitReader::new(&bytes);
//! assert_eq!(reader.read_bits(4).unwrap(), 12);
//! assert_eq!(reader.read_signed(4).unwrap(), -3);
//! ```

use crate::error::{BitIoError, Result};

/// Largest field the cursor moves in one call.
pub const MAX_FIELD_BITS: usize = 64;

fn low_mask(count: usize) -> u64 {
    if count >= 64 {
        u64::MAX
    } else {
        (1u64 << count) - 1
    }
}

/// Writes fields MSB-first into a growing byte buffer.
///
/// # Invariants
/// - `pending_bits` < 8; the pending bits sit in the top of `pending`
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    pending: u8,
    pending_bits: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer with room for `bits` bits preallocated.
    pub fn with_capacity_bits(bits: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bits.div_ceil(8)),
            ..Self::default()
        }
    }

    /// Write the low `count` bits of `value`, most significant first.
    ///
    /// Bits of `value` above `count` are ignored.
    ///
    /// # Errors
    /// Returns `BitIoError::InvalidBitCount` if count > 64.
    pub fn write_bits(&mut self, value: u64, count: usize) -> Result<()> {
        if count > MAX_FIELD_BITS {
            return Err(BitIoError::InvalidBitCount(count).into());
        }
        let value = value & low_mask(count);
        let mut remaining = count;

        while remaining > 0 {
            let room = 8 - self.pending_bits as usize;
            let take = remaining.min(room);
            let chunk = ((value >> (remaining - take)) & low_mask(take)) as u8;
            self.pending |= chunk << (room - take);
            self.pending_bits += take as u8;
            remaining -= take;

            if self.pending_bits == 8 {
                self.bytes.push(self.pending);
                self.pending = 0;
                self.pending_bits = 0;
            }
        }
        Ok(())
    }

    /// Write a two's complement field of `count` bits.
    pub fn write_signed(&mut self, value: i64, count: usize) -> Result<()> {
        self.write_bits(value as u64, count)
    }

    /// Copy whole bytes; fast path when the cursor is byte aligned.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.pending_bits == 0 {
            self.bytes.extend_from_slice(data);
            return Ok(());
        }
        for &byte in data {
            self.write_bits(byte as u64, 8)?;
        }
        Ok(())
    }

    /// Total number of bits written.
    pub fn bit_len(&self) -> usize {
        self.bytes.len() * 8 + self.pending_bits as usize
    }

    /// Finish and return the bytes, zero-padding the last partial byte.
    pub fn finish(mut self) -> Vec<u8> {
        if self.pending_bits > 0 {
            self.bytes.push(self.pending);
        }
        self.bytes
    }
}

/// Reads fields MSB-first from a byte slice.
///
/// # Invariants
/// - `position` never exceeds `data.len() * 8`
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read an unsigned field of `count` bits (0-64).
    ///
    /// # Errors
    /// - `BitIoError::InvalidBitCount` if count > 64
    /// - `BitIoError::UnexpectedEof` if fewer than `count` bits remain
    pub fn read_bits(&mut self, count: usize) -> Result<u64> {
        if count > MAX_FIELD_BITS {
            return Err(BitIoError::InvalidBitCount(count).into());
        }
        let available = self.bits_remaining();
        if count > available {
            return Err(BitIoError::UnexpectedEof {
                requested: count,
                available,
            }
            .into());
        }

        let mut result = 0u64;
        let mut remaining = count;
        while remaining > 0 {
            let byte = self.data[self.position / 8];
            let offset = self.position % 8;
            let take = remaining.min(8 - offset);
            let bits = (byte >> (8 - offset - take)) as u64 & low_mask(take);
            // take < 64 here, so the shift cannot overflow
            result = (result << take) | bits;
            self.position += take;
            remaining -= take;
        }
        Ok(result)
    }

    /// Read a two's complement field of `count` bits, sign-extended to i64.
    pub fn read_signed(&mut self, count: usize) -> Result<i64> {
        let raw = self.read_bits(count)?;
        if count == 0 || count == 64 {
            return Ok(raw as i64);
        }
        let shift = 64 - count as u32;
        Ok(((raw << shift) as i64) >> shift)
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn bits_remaining(&self) -> usize {
        self.data.len() * 8 - self.position
    }

    pub fn position(&self) -> usize {
        self.position
    }
}
