//! Item descriptors and their wire encoding.
//!
//! A descriptor travels as the value of a `DESCRIPTOR` item. That value is a
//! complete single-packet SPEAD heap whose items are the descriptor fields:
//!
//! | Sub-item                 | Mode      | Content                           |
//! |--------------------------|-----------|-----------------------------------|
//! | `DESCRIPTOR_ID`          | immediate | id of the described item          |
//! | `DESCRIPTOR_NAME`        | address   | UTF-8 name                        |
//! | `DESCRIPTOR_DESCRIPTION` | address   | UTF-8 description                 |
//! | `DESCRIPTOR_FORMAT`      | address   | `(type char, BE width)` entries   |
//! | `DESCRIPTOR_SHAPE`       | address   | `(flag byte, BE dimension)` entries |
//! | `DESCRIPTOR_DTYPE`       | address   | numpy header, dtype items only    |
//!
//! Entry widths depend on the flavour, see [`Flavour::format_field_size`] and
//! [`Flavour::shape_field_size`].

use std::fmt;

use crate::dtype::{DType, NumpyHeader, Order};
use crate::error::{CodecError, Error, ItemError, PacketError, Result};
use crate::flavour::{ids, BugCompat, Flavour};
use crate::heap::resolve_items;
use crate::packet::{decode_packet, Packet};

/// One dimension of an item's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Fixed(usize),
    /// Length taken from the value on send and from the item size on receive
    Variable,
}

impl Dim {
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(n) => Some(*n),
            Dim::Variable => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{n}"),
            Dim::Variable => write!(f, "?"),
        }
    }
}

/// Type of one field of a fallback format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    UInt,
    Int,
    Float,
    Bool,
    Char,
}

impl FieldType {
    pub fn code(&self) -> char {
        match self {
            FieldType::UInt => 'u',
            FieldType::Int => 'i',
            FieldType::Float => 'f',
            FieldType::Bool => 'b',
            FieldType::Char => 'c',
        }
    }
}

/// A `(type, width)` pair of a fallback format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatField {
    kind: FieldType,
    bits: u32,
}

impl FormatField {
    /// Build a field from its type character and width in bits.
    ///
    /// Accepted: `u`/`i`/`b` 1..=64 bits, `f` 32 or 64, `c` 1..=8.
    pub fn new(code: char, bits: u64) -> Result<Self> {
        let invalid = || Error::from(CodecError::InvalidFormatField { kind: code, bits });
        let kind = match code {
            'u' => FieldType::UInt,
            'i' => FieldType::Int,
            'f' => FieldType::Float,
            'b' => FieldType::Bool,
            'c' => FieldType::Char,
            _ => return Err(invalid()),
        };
        let valid = match kind {
            FieldType::UInt | FieldType::Int | FieldType::Bool => (1..=64).contains(&bits),
            FieldType::Float => bits == 32 || bits == 64,
            FieldType::Char => (1..=8).contains(&bits),
        };
        if !valid {
            return Err(invalid());
        }
        Ok(Self {
            kind,
            bits: bits as u32,
        })
    }

    pub fn kind(&self) -> FieldType {
        self.kind
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }
}

/// How the elements of an item are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoding {
    /// Whole-byte elements of one dtype
    DType { dtype: DType, order: Order },
    /// Bit-packed records of the listed fields
    Format(Vec<FormatField>),
}

/// Metadata describing an item: identity, shape and encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub shape: Vec<Dim>,
    pub encoding: Encoding,
}

impl ItemDescriptor {
    /// Build a descriptor for an application item.
    ///
    /// # Errors
    /// - `ItemError::InvalidId` for ids in the reserved range
    /// - `CodecError::TooManyVariableDims` if more than one dimension is variable
    /// - `CodecError::InvalidDescriptor` for an empty format
    pub fn new(
        id: u64,
        name: impl Into<String>,
        description: impl Into<String>,
        shape: Vec<Dim>,
        encoding: Encoding,
    ) -> Result<Self> {
        if id < ids::FIRST_USER_ID {
            return Err(ItemError::InvalidId(id).into());
        }
        let variable = shape.iter().filter(|d| **d == Dim::Variable).count();
        if variable > 1 {
            return Err(CodecError::TooManyVariableDims(variable).into());
        }
        if let Encoding::Format(fields) = &encoding {
            if fields.is_empty() {
                return Err(CodecError::InvalidDescriptor("empty format".into()).into());
            }
        }
        let descriptor = Self {
            id,
            name: name.into(),
            description: description.into(),
            shape,
            encoding,
        };
        descriptor.fixed_bits()?;
        Ok(descriptor)
    }

    /// Shorthand for a dtype item in C order.
    pub fn with_dtype(
        id: u64,
        name: impl Into<String>,
        description: impl Into<String>,
        shape: Vec<Dim>,
        dtype: DType,
    ) -> Result<Self> {
        Self::new(
            id,
            name,
            description,
            shape,
            Encoding::DType {
                dtype,
                order: Order::C,
            },
        )
    }

    /// Shorthand for a fallback-format item.
    pub fn with_format(
        id: u64,
        name: impl Into<String>,
        description: impl Into<String>,
        shape: Vec<Dim>,
        format: &[(char, u64)],
    ) -> Result<Self> {
        let fields = format
            .iter()
            .map(|&(code, bits)| FormatField::new(code, bits))
            .collect::<Result<Vec<_>>>()?;
        Self::new(id, name, description, shape, Encoding::Format(fields))
    }

    pub fn is_variable_size(&self) -> bool {
        self.shape.contains(&Dim::Variable)
    }

    /// Bits occupied by one element.
    pub fn bits_per_element(&self) -> usize {
        match &self.encoding {
            Encoding::DType { dtype, .. } => dtype.size() * 8,
            Encoding::Format(fields) => fields.iter().map(|f| f.bits as usize).sum(),
        }
    }

    /// Bits taken by `count` elements.
    pub(crate) fn bits_for(&self, count: usize) -> Result<usize> {
        count
            .checked_mul(self.bits_per_element())
            .ok_or_else(|| CodecError::SizeOverflow { id: self.id }.into())
    }

    /// Bits of one value with the variable dimension (if any) treated as 1.
    pub(crate) fn fixed_bits(&self) -> Result<usize> {
        let count = element_count(self.shape.iter().filter_map(Dim::fixed))
            .ok_or(CodecError::SizeOverflow { id: self.id })?;
        self.bits_for(count)
    }

    /// Encoded size in bytes, if the shape is fully fixed.
    pub fn fixed_size_bytes(&self) -> Option<usize> {
        if self.is_variable_size() {
            return None;
        }
        self.fixed_bits().ok().map(|bits| bits.div_ceil(8))
    }

    pub(crate) fn shape_string(&self) -> String {
        let dims: Vec<String> = self.shape.iter().map(Dim::to_string).collect();
        format!("({})", dims.join(", "))
    }

    /// Encode as the value of a `DESCRIPTOR` item.
    pub fn to_raw(&self, flavour: &Flavour) -> Result<Vec<u8>> {
        let bug_compat = flavour.bug_compat();
        let field_size = flavour.format_field_size();
        let shape_size = flavour.shape_field_size();

        let mut format = Vec::new();
        let mut numpy = Vec::new();
        match &self.encoding {
            Encoding::Format(fields) => {
                for field in fields {
                    format.push(field.kind.code() as u8);
                    format.extend_from_slice(&be_field(field.bits as u64, field_size - 1, "format width")?);
                }
            }
            Encoding::DType { dtype, order } => {
                let declared = if bug_compat.contains(BugCompat::SWAP_ENDIAN) {
                    dtype.swapped()
                } else {
                    *dtype
                };
                let header = NumpyHeader {
                    dtype: declared,
                    order: *order,
                    shape: self.shape.iter().map(Dim::fixed).collect(),
                };
                numpy = header.render().into_bytes();
            }
        }

        let mut shape = Vec::with_capacity(self.shape.len() * shape_size);
        for dim in &self.shape {
            let (tag, len) = match dim {
                Dim::Fixed(n) => (0, *n as u64),
                Dim::Variable => (flavour.variable_shape_tag(), 0),
            };
            shape.push(tag);
            shape.extend_from_slice(&be_field(len, shape_size - 1, "shape dimension")?);
        }

        let mut payload = Vec::new();
        let mut pointers = vec![flavour.encode_immediate(ids::DESCRIPTOR_ID, self.id)?];
        let fields: [(u64, &[u8]); 4] = [
            (ids::DESCRIPTOR_NAME, self.name.as_bytes()),
            (ids::DESCRIPTOR_DESCRIPTION, self.description.as_bytes()),
            (ids::DESCRIPTOR_FORMAT, &format),
            (ids::DESCRIPTOR_SHAPE, &shape),
        ];
        for (id, bytes) in fields {
            pointers.push(flavour.encode_address(id, payload.len() as u64)?);
            payload.extend_from_slice(bytes);
        }
        if !numpy.is_empty() {
            pointers.push(flavour.encode_address(ids::DESCRIPTOR_DTYPE, payload.len() as u64)?);
            payload.extend_from_slice(&numpy);
        }

        let packet = Packet {
            heap_cnt: 1,
            heap_length: payload.len() as u64,
            payload_offset: 0,
            payload_length: payload.len() as u64,
            heap_address_bits: flavour.heap_address_bits(),
            pointers,
            payload,
        };
        packet.serialize()
    }

    /// Decode the value of a `DESCRIPTOR` item.
    ///
    /// The flavour is taken from the embedded packet header; `bug_compat`
    /// says how to interpret the fields.
    pub fn from_raw(raw: &[u8], bug_compat: BugCompat) -> Result<Self> {
        let (packet, _) = decode_packet(raw)?;
        if packet.payload_offset != 0 || packet.payload_length != packet.heap_length {
            return Err(CodecError::InvalidDescriptor(format!(
                "descriptor spans more than one packet ({} of {} bytes)",
                packet.payload_length, packet.heap_length
            ))
            .into());
        }
        let flavour = Flavour::new(packet.heap_address_bits, bug_compat)?;
        let items = resolve_items(packet.heap_cnt, &flavour, &packet.pointers, &packet.payload)?;

        let mut id = None;
        let mut name = String::new();
        let mut description = String::new();
        let mut format = Vec::new();
        let mut shape = Vec::new();
        let mut numpy = None;
        for item in &items {
            match item.id {
                ids::DESCRIPTOR_ID => id = Some(be_value(&item.data)),
                ids::DESCRIPTOR_NAME => name = utf8(&item.data, "name")?,
                ids::DESCRIPTOR_DESCRIPTION => description = utf8(&item.data, "description")?,
                ids::DESCRIPTOR_FORMAT => {
                    for entry in item.data.chunks_exact(flavour.format_field_size()) {
                        format.push(FormatField::new(entry[0] as char, be_value(&entry[1..]))?);
                    }
                }
                ids::DESCRIPTOR_SHAPE => {
                    let tag = flavour.variable_shape_tag();
                    for entry in item.data.chunks_exact(flavour.shape_field_size()) {
                        if entry[0] & tag != 0 {
                            shape.push(Dim::Variable);
                        } else {
                            shape.push(Dim::Fixed(be_value(&entry[1..]) as usize));
                        }
                    }
                }
                ids::DESCRIPTOR_DTYPE => numpy = Some(utf8(&item.data, "dtype")?),
                _ => {}
            }
        }

        let id = id.ok_or(PacketError::MissingItem("descriptor id"))?;
        let encoding = match numpy {
            Some(text) => {
                let header = NumpyHeader::parse(&text)?;
                shape = header
                    .shape
                    .iter()
                    .map(|d| d.map_or(Dim::Variable, Dim::Fixed))
                    .collect();
                let dtype = if bug_compat.contains(BugCompat::SWAP_ENDIAN) {
                    header.dtype.swapped()
                } else {
                    header.dtype
                };
                Encoding::DType {
                    dtype,
                    order: header.order,
                }
            }
            None => Encoding::Format(format),
        };
        Self::new(id, name, description, shape, encoding)
    }
}

/// Product of `dims`, or `None` on overflow.
pub(crate) fn element_count(dims: impl IntoIterator<Item = usize>) -> Option<usize> {
    dims.into_iter().try_fold(1usize, |acc, d| acc.checked_mul(d))
}

/// `value` as a big-endian field of `len` bytes.
fn be_field(value: u64, len: usize, field: &'static str) -> Result<Vec<u8>> {
    if len < 8 && value >> (len * 8) != 0 {
        return Err(PacketError::FieldOverflow {
            field,
            value,
            bits: (len * 8) as u32,
        }
        .into());
    }
    let bytes = value.to_be_bytes();
    Ok(bytes[8 - len.min(8)..].to_vec())
}

/// Big-endian unsigned value of up to 8 bytes; longer fields keep the low 8.
fn be_value(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

fn utf8(bytes: &[u8], field: &'static str) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field }.into())
}
