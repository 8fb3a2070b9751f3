//! Item values and the codec between values and bytes.
//!
//! Two paths, picked by the descriptor's encoding:
//!
//! - **dtype**: whole-byte elements written in the dtype's byte order, in C
//!   or Fortran element order. Values are held in memory in C order.
//! - **format**: records of bit fields, packed MSB-first with no padding
//!   between fields or elements. Only the last byte is padded.
//!
//! One variable dimension is taken from the value when encoding and from
//! the number of bytes when decoding.

use crate::bitio::{BitReader, BitWriter};
use crate::descriptor::{element_count, Dim, Encoding, FieldType, FormatField, ItemDescriptor};
use crate::dtype::{DType, Endian, Order, ScalarKind};
use crate::error::{CodecError, Result};
use crate::flavour::Flavour;

/// Typed element storage of an array value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Bool(Vec<bool>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! with_array_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ArrayData::Bool($v) => $body,
            ArrayData::I8($v) => $body,
            ArrayData::U8($v) => $body,
            ArrayData::I16($v) => $body,
            ArrayData::U16($v) => $body,
            ArrayData::I32($v) => $body,
            ArrayData::U32($v) => $body,
            ArrayData::I64($v) => $body,
            ArrayData::U64($v) => $body,
            ArrayData::F32($v) => $body,
            ArrayData::F64($v) => $body,
        }
    };
}

macro_rules! array_data_from {
    ($($t:ty => $variant:ident),* $(,)?) => {$(
        impl From<Vec<$t>> for ArrayData {
            fn from(v: Vec<$t>) -> Self {
                ArrayData::$variant(v)
            }
        }
    )*};
}

array_data_from!(
    bool => Bool, i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32,
    u32 => U32, i64 => I64, u64 => U64, f32 => F32, f64 => F64,
);

impl ArrayData {
    pub fn len(&self) -> usize {
        with_array_data!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element kind and size in bytes.
    pub fn element_type(&self) -> (ScalarKind, usize) {
        with_array_data!(self, v => element_type_of(v.as_slice()))
    }
}

fn element_type_of<T: Element>(_: &[T]) -> (ScalarKind, usize) {
    (T::KIND, T::SIZE)
}

/// An n-dimensional array held in C order.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    shape: Vec<usize>,
    data: ArrayData,
}

impl ArrayValue {
    pub fn new(shape: Vec<usize>, data: impl Into<ArrayData>) -> Result<Self> {
        let data = data.into();
        check_count(&shape, data.len())?;
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }
}

/// One field of a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    Char(char),
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Scalar::UInt(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<char> for Scalar {
    fn from(v: char) -> Self {
        Scalar::Char(v)
    }
}

/// An n-dimensional array of records, for fallback-format items.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordValue {
    shape: Vec<usize>,
    records: Vec<Vec<Scalar>>,
}

impl RecordValue {
    pub fn new(shape: Vec<usize>, records: Vec<Vec<Scalar>>) -> Result<Self> {
        check_count(&shape, records.len())?;
        Ok(Self { shape, records })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn records(&self) -> &[Vec<Scalar>] {
        &self.records
    }
}

/// The value of an item.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Array(ArrayValue),
    Records(RecordValue),
}

impl Value {
    /// Array of the given shape, elements in C order.
    pub fn array(shape: Vec<usize>, data: impl Into<ArrayData>) -> Result<Self> {
        Ok(Value::Array(ArrayValue::new(shape, data)?))
    }

    pub fn records(shape: Vec<usize>, records: Vec<Vec<Scalar>>) -> Result<Self> {
        Ok(Value::Records(RecordValue::new(shape, records)?))
    }

    /// A single record (shape `()`).
    pub fn record(fields: Vec<Scalar>) -> Self {
        Value::Records(RecordValue {
            shape: Vec::new(),
            records: vec![fields],
        })
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Array(a) => &a.shape,
            Value::Records(r) => &r.shape,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Value::Array(a) => Some(a),
            Value::Records(_) => None,
        }
    }

    pub fn as_records(&self) -> Option<&RecordValue> {
        match self {
            Value::Records(r) => Some(r),
            Value::Array(_) => None,
        }
    }
}

impl<T> From<Vec<T>> for Value
where
    ArrayData: From<Vec<T>>,
{
    /// One-dimensional array.
    fn from(v: Vec<T>) -> Self {
        let data = ArrayData::from(v);
        Value::Array(ArrayValue {
            shape: vec![data.len()],
            data,
        })
    }
}

fn check_count(shape: &[usize], len: usize) -> Result<()> {
    if element_count(shape.iter().copied()) != Some(len) {
        return Err(CodecError::ElementCount {
            shape: shape.to_vec(),
            len,
        }
        .into());
    }
    Ok(())
}

trait Element: Copy + Default {
    const KIND: ScalarKind;
    const SIZE: usize;
    fn put(self, endian: Endian, out: &mut Vec<u8>);
    fn get(bytes: &[u8], endian: Endian) -> Self;
}

macro_rules! numeric_element {
    ($($t:ty => $kind:ident),* $(,)?) => {$(
        impl Element for $t {
            const KIND: ScalarKind = ScalarKind::$kind;
            const SIZE: usize = std::mem::size_of::<$t>();

            fn put(self, endian: Endian, out: &mut Vec<u8>) {
                match endian {
                    Endian::Little => out.extend_from_slice(&self.to_le_bytes()),
                    Endian::Big => out.extend_from_slice(&self.to_be_bytes()),
                }
            }

            fn get(bytes: &[u8], endian: Endian) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                match endian {
                    Endian::Little => <$t>::from_le_bytes(raw),
                    Endian::Big => <$t>::from_be_bytes(raw),
                }
            }
        }
    )*};
}

numeric_element!(
    i8 => Int, u8 => UInt, i16 => Int, u16 => UInt, i32 => Int,
    u32 => UInt, i64 => Int, u64 => UInt, f32 => Float, f64 => Float,
);

impl Element for bool {
    const KIND: ScalarKind = ScalarKind::Bool;
    const SIZE: usize = 1;

    fn put(self, _: Endian, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn get(bytes: &[u8], _: Endian) -> Self {
        bytes[0] != 0
    }
}

/// For each position in Fortran order, the matching index in C order.
fn fortran_positions(shape: &[usize]) -> Vec<usize> {
    let count: usize = shape.iter().product();
    // strides of an empty array may overflow even though the count does not
    if count == 0 {
        return Vec::new();
    }
    let mut strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }

    let mut index = vec![0usize; shape.len()];
    let mut positions = Vec::with_capacity(count);
    for _ in 0..count {
        positions.push(index.iter().zip(&strides).map(|(i, s)| i * s).sum());
        for d in 0..shape.len() {
            index[d] += 1;
            if index[d] < shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    positions
}

fn encode_elements<T: Element>(
    values: &[T],
    endian: Endian,
    positions: Option<&[usize]>,
    out: &mut Vec<u8>,
) {
    out.reserve(values.len() * T::SIZE);
    match positions {
        Some(positions) => positions.iter().for_each(|&p| values[p].put(endian, out)),
        None => values.iter().for_each(|v| v.put(endian, out)),
    }
}

fn decode_elements<T: Element>(
    bytes: &[u8],
    count: usize,
    endian: Endian,
    positions: Option<&[usize]>,
) -> Vec<T> {
    let mut values = vec![T::default(); count];
    for (k, chunk) in bytes.chunks_exact(T::SIZE).take(count).enumerate() {
        let target = positions.map_or(k, |p| p[k]);
        values[target] = T::get(chunk, endian);
    }
    values
}

fn decode_array(dtype: &DType, bytes: &[u8], count: usize, positions: Option<&[usize]>) -> Result<ArrayData> {
    let e = dtype.endian();
    Ok(match (dtype.kind(), dtype.size()) {
        (ScalarKind::Bool, 1) => ArrayData::Bool(decode_elements(bytes, count, e, positions)),
        (ScalarKind::Int, 1) => ArrayData::I8(decode_elements(bytes, count, e, positions)),
        (ScalarKind::UInt, 1) => ArrayData::U8(decode_elements(bytes, count, e, positions)),
        (ScalarKind::Int, 2) => ArrayData::I16(decode_elements(bytes, count, e, positions)),
        (ScalarKind::UInt, 2) => ArrayData::U16(decode_elements(bytes, count, e, positions)),
        (ScalarKind::Int, 4) => ArrayData::I32(decode_elements(bytes, count, e, positions)),
        (ScalarKind::UInt, 4) => ArrayData::U32(decode_elements(bytes, count, e, positions)),
        (ScalarKind::Int, 8) => ArrayData::I64(decode_elements(bytes, count, e, positions)),
        (ScalarKind::UInt, 8) => ArrayData::U64(decode_elements(bytes, count, e, positions)),
        (ScalarKind::Float, 4) => ArrayData::F32(decode_elements(bytes, count, e, positions)),
        (ScalarKind::Float, 8) => ArrayData::F64(decode_elements(bytes, count, e, positions)),
        _ => return Err(CodecError::UnsupportedDtype(dtype.descr()).into()),
    })
}

/// Shape of `value` checked against the descriptor, variable dimension filled in.
fn resolve_shape(desc: &ItemDescriptor, actual: &[usize]) -> Result<Vec<usize>> {
    let matches = desc.shape.len() == actual.len()
        && desc
            .shape
            .iter()
            .zip(actual)
            .all(|(dim, &n)| dim.fixed().map_or(true, |f| f == n));
    if !matches {
        return Err(CodecError::ShapeMismatch {
            id: desc.id,
            expected: desc.shape_string(),
            actual: actual.to_vec(),
        }
        .into());
    }
    Ok(actual.to_vec())
}

/// Shape implied by `len` bytes of encoded data.
fn shape_from_len(desc: &ItemDescriptor, len: usize) -> Result<Vec<usize>> {
    let unit_bits = desc.fixed_bits()?;
    let variable = if unit_bits == 0 {
        0
    } else if unit_bits % 8 == 0 {
        let unit = unit_bits / 8;
        if len % unit != 0 {
            return Err(CodecError::RaggedValue { id: desc.id, actual: len }.into());
        }
        len / unit
    } else {
        // sub-byte records: as many as fit, the rest is padding
        len * 8 / unit_bits
    };
    Ok(desc
        .shape
        .iter()
        .map(|d| d.fixed().unwrap_or(variable))
        .collect())
}

fn type_mismatch(desc: &ItemDescriptor, reason: impl Into<String>) -> crate::error::Error {
    CodecError::TypeMismatch {
        id: desc.id,
        reason: reason.into(),
    }
    .into()
}

/// Bytes needed for `value`.
pub fn encoded_len(desc: &ItemDescriptor, value: &Value) -> Result<usize> {
    let shape = resolve_shape(desc, value.shape())?;
    let count = element_count(shape.iter().copied()).ok_or(CodecError::SizeOverflow { id: desc.id })?;
    Ok(desc.bits_for(count)?.div_ceil(8))
}

/// True if `value` would travel inline in its item pointer.
pub fn immediate_fits(desc: &ItemDescriptor, value: &Value, flavour: &Flavour) -> bool {
    if desc.is_variable_size() {
        return false;
    }
    encoded_len(desc, value).is_ok_and(|len| flavour.fits_immediate(len))
}

/// Encode `value` as described by `desc`.
pub fn encode(desc: &ItemDescriptor, value: &Value) -> Result<Vec<u8>> {
    let shape = resolve_shape(desc, value.shape())?;
    match (&desc.encoding, value) {
        (Encoding::DType { dtype, order }, Value::Array(array)) => {
            let (kind, size) = array.data.element_type();
            if kind != dtype.kind() || size != dtype.size() {
                return Err(type_mismatch(
                    desc,
                    format!("{kind:?} elements of {size} bytes for dtype {}", dtype.descr()),
                ));
            }
            let positions = match order {
                Order::F if shape.len() > 1 => Some(fortran_positions(&shape)),
                _ => None,
            };
            let mut out = Vec::new();
            with_array_data!(&array.data, v => {
                encode_elements(v, dtype.endian(), positions.as_deref(), &mut out)
            });
            Ok(out)
        }
        (Encoding::Format(fields), Value::Records(records)) => {
            let bits = records.records.len() * desc.bits_per_element();
            let mut writer = BitWriter::with_capacity_bits(bits);
            for record in &records.records {
                if record.len() != fields.len() {
                    return Err(type_mismatch(
                        desc,
                        format!("record has {} fields, format has {}", record.len(), fields.len()),
                    ));
                }
                for (field, scalar) in fields.iter().zip(record) {
                    write_field(desc, &mut writer, field, scalar)?;
                }
            }
            Ok(writer.finish())
        }
        (Encoding::DType { .. }, Value::Records(_)) => {
            Err(type_mismatch(desc, "records given for a dtype item"))
        }
        (Encoding::Format(_), Value::Array(_)) => {
            Err(type_mismatch(desc, "array given for a format item"))
        }
    }
}

fn write_field(desc: &ItemDescriptor, writer: &mut BitWriter, field: &FormatField, scalar: &Scalar) -> Result<()> {
    let bits = field.bits();
    let width = bits as usize;
    let out_of_range = |value: String| CodecError::OutOfRange {
        id: desc.id,
        value,
        bits,
    };
    match (field.kind(), scalar) {
        (FieldType::UInt, Scalar::UInt(v)) => {
            if bits < 64 && v >> bits != 0 {
                return Err(out_of_range(v.to_string()).into());
            }
            writer.write_bits(*v, width)
        }
        (FieldType::Int, Scalar::Int(v)) => {
            if bits < 64 {
                let limit = 1i64 << (bits - 1);
                if *v < -limit || *v >= limit {
                    return Err(out_of_range(v.to_string()).into());
                }
            }
            writer.write_signed(*v, width)
        }
        (FieldType::Float, Scalar::Float(v)) => match bits {
            32 => writer.write_bits((*v as f32).to_bits() as u64, 32),
            _ => writer.write_bits(v.to_bits(), 64),
        },
        (FieldType::Bool, Scalar::Bool(v)) => writer.write_bits(*v as u64, width),
        (FieldType::Char, Scalar::Char(c)) => {
            let code = *c as u64;
            if !c.is_ascii() || code >> bits != 0 {
                return Err(out_of_range(format!("{c:?}")).into());
            }
            writer.write_bits(code, width)
        }
        (kind, scalar) => Err(type_mismatch(desc, format!("{scalar:?} for a {} field", kind.code()))),
    }
}

fn read_field(reader: &mut BitReader<'_>, field: &FormatField) -> Result<Scalar> {
    let width = field.bits() as usize;
    Ok(match field.kind() {
        FieldType::UInt => Scalar::UInt(reader.read_bits(width)?),
        FieldType::Int => Scalar::Int(reader.read_signed(width)?),
        FieldType::Float if width == 32 => Scalar::Float(f32::from_bits(reader.read_bits(32)? as u32) as f64),
        FieldType::Float => Scalar::Float(f64::from_bits(reader.read_bits(64)?)),
        FieldType::Bool => Scalar::Bool(reader.read_bits(width)? != 0),
        FieldType::Char => Scalar::Char(char::from(reader.read_bits(width)? as u8)),
    })
}

/// Decode an address-mode item. Bytes beyond the described size are ignored.
pub fn decode(desc: &ItemDescriptor, bytes: &[u8]) -> Result<Value> {
    let shape = if desc.is_variable_size() {
        shape_from_len(desc, bytes.len())?
    } else {
        desc.shape.iter().filter_map(Dim::fixed).collect()
    };
    let count = element_count(shape.iter().copied()).ok_or(CodecError::SizeOverflow { id: desc.id })?;
    let required = desc.bits_for(count)?.div_ceil(8);
    if bytes.len() < required {
        return Err(CodecError::ValueTooShort {
            id: desc.id,
            required,
            actual: bytes.len(),
        }
        .into());
    }

    match &desc.encoding {
        Encoding::DType { dtype, order } => {
            let positions = match order {
                Order::F if shape.len() > 1 => Some(fortran_positions(&shape)),
                _ => None,
            };
            let data = decode_array(dtype, &bytes[..required], count, positions.as_deref())?;
            Ok(Value::Array(ArrayValue { shape, data }))
        }
        Encoding::Format(fields) => {
            let mut reader = BitReader::new(&bytes[..required]);
            let mut records = Vec::with_capacity(count);
            for _ in 0..count {
                let record = fields
                    .iter()
                    .map(|field| read_field(&mut reader, field))
                    .collect::<Result<Vec<_>>>()?;
                records.push(record);
            }
            Ok(Value::Records(RecordValue { shape, records }))
        }
    }
}

/// Decode an immediate item. The value sits at the tail of the pointer's
/// value field; the leading bytes are padding.
pub fn decode_immediate(desc: &ItemDescriptor, field: &[u8]) -> Result<Value> {
    match desc.fixed_size_bytes() {
        Some(size) if size <= field.len() => decode(desc, &field[field.len() - size..]),
        Some(size) => Err(CodecError::ValueTooShort {
            id: desc.id,
            required: size,
            actual: field.len(),
        }
        .into()),
        None => decode(desc, field),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavour::BugCompat;

    fn dtype_desc(shape: Vec<Dim>, dtype: DType, order: Order) -> ItemDescriptor {
        ItemDescriptor::new(0x2345, "name", "", shape, Encoding::DType { dtype, order }).unwrap()
    }

    fn format_desc(shape: Vec<Dim>, format: &[(char, u64)]) -> ItemDescriptor {
        ItemDescriptor::with_format(0x2345, "name", "", shape, format).unwrap()
    }

    #[test]
    fn test_numpy_simple() {
        let desc = dtype_desc(vec![Dim::Fixed(2), Dim::Fixed(3)], DType::u16(), Order::C);
        let value = Value::array(vec![2, 3], vec![6u16, 7, 8, 10, 11, 12000]).unwrap();
        let bytes = encode(&desc, &value).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..4], &[6, 0, 7, 0]);
        assert_eq!(decode(&desc, &bytes).unwrap(), value);
    }

    #[test]
    fn test_big_endian_on_the_wire() {
        let desc = dtype_desc(vec![Dim::Fixed(2)], DType::i32().with_endian(Endian::Big), Order::C);
        let value = Value::array(vec![2], vec![1i32, -2]).unwrap();
        let bytes = encode(&desc, &value).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(decode(&desc, &bytes).unwrap(), value);
    }

    #[test]
    fn test_fortran_order() {
        let desc = dtype_desc(vec![Dim::Fixed(2), Dim::Fixed(3)], DType::u8(), Order::F);
        // [[1, 2, 3], [4, 5, 6]] goes out column by column
        let value = Value::array(vec![2, 3], vec![1u8, 2, 3, 4, 5, 6]).unwrap();
        let bytes = encode(&desc, &value).unwrap();
        assert_eq!(bytes, vec![1, 4, 2, 5, 3, 6]);
        assert_eq!(decode(&desc, &bytes).unwrap(), value);
    }

    #[test]
    fn test_fortran_positions_3d() {
        assert_eq!(fortran_positions(&[2, 2, 2]), vec![0, 4, 2, 6, 1, 5, 3, 7]);
        assert_eq!(fortran_positions(&[]), vec![0]);
    }

    #[test]
    fn test_sub_byte_struct_is_nine_bytes() {
        let desc = format_desc(vec![], &[('u', 4), ('f', 64), ('i', 4)]);
        let value = Value::record(vec![Scalar::UInt(12), Scalar::Float(1.5), Scalar::Int(-3)]);
        let bytes = encode(&desc, &value).unwrap();
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[0] >> 4, 12);
        assert_eq!(bytes[8] & 0x0F, 0b1101);
        assert_eq!(decode(&desc, &bytes).unwrap(), value);
    }

    #[test]
    fn test_partial_byte_array() {
        let desc = format_desc(vec![Dim::Fixed(3)], &[('u', 7)]);
        let value = Value::records(
            vec![3],
            vec![vec![Scalar::UInt(127)], vec![Scalar::UInt(12)], vec![Scalar::UInt(123)]],
        )
        .unwrap();
        let bytes = encode(&desc, &value).unwrap();
        assert_eq!(bytes.len(), 3);
        assert_eq!(decode(&desc, &bytes).unwrap(), value);
    }

    #[test]
    fn test_mixed_fallback_types() {
        let desc = format_desc(vec![Dim::Fixed(2)], &[('b', 1), ('c', 7), ('f', 32)]);
        let value = Value::records(
            vec![2],
            vec![
                vec![true.into(), 'y'.into(), 1.0.into()],
                vec![false.into(), 'n'.into(), (-1.0).into()],
            ],
        )
        .unwrap();
        let bytes = encode(&desc, &value).unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(decode(&desc, &bytes).unwrap(), value);
    }

    #[test]
    fn test_variable_dimension() {
        let desc = dtype_desc(vec![Dim::Variable, Dim::Fixed(2)], DType::i16(), Order::C);
        let value = Value::array(vec![3, 2], vec![1i16, 2, 3, 4, 5, 6]).unwrap();
        let bytes = encode(&desc, &value).unwrap();
        assert_eq!(decode(&desc, &bytes).unwrap(), value);
        assert!(matches!(
            decode(&desc, &bytes[..5]),
            Err(crate::error::Error::Codec(CodecError::RaggedValue { .. }))
        ));
    }

    #[test]
    fn test_shape_and_type_checks() {
        let desc = dtype_desc(vec![Dim::Fixed(4)], DType::u16(), Order::C);
        assert!(matches!(
            encode(&desc, &Value::from(vec![1u16, 2])),
            Err(crate::error::Error::Codec(CodecError::ShapeMismatch { .. }))
        ));
        assert!(matches!(
            encode(&desc, &Value::from(vec![1u32, 2, 3, 4])),
            Err(crate::error::Error::Codec(CodecError::TypeMismatch { .. }))
        ));
        assert!(matches!(
            decode(&desc, &[0; 7]),
            Err(crate::error::Error::Codec(CodecError::ValueTooShort {
                required: 8,
                actual: 7,
                ..
            }))
        ));
        assert!(Value::array(vec![2, 2], vec![1u8, 2, 3]).is_err());
    }

    #[test]
    fn test_out_of_range_fields() {
        let desc = format_desc(vec![], &[('u', 4), ('i', 4), ('c', 7)]);
        let too_big = Value::record(vec![Scalar::UInt(16), Scalar::Int(0), Scalar::Char('a')]);
        assert!(encode(&desc, &too_big).is_err());
        let too_small = Value::record(vec![Scalar::UInt(0), Scalar::Int(-9), Scalar::Char('a')]);
        assert!(encode(&desc, &too_small).is_err());
        let wide_char = Value::record(vec![Scalar::UInt(0), Scalar::Int(-8), Scalar::Char('é')]);
        assert!(encode(&desc, &wide_char).is_err());
        let ok = Value::record(vec![Scalar::UInt(15), Scalar::Int(-8), Scalar::Char('z')]);
        assert_eq!(decode(&desc, &encode(&desc, &ok).unwrap()).unwrap(), ok);
    }

    #[test]
    fn test_immediate_threshold() {
        let f40 = Flavour::default();
        let f48 = Flavour::new(48, BugCompat::empty()).unwrap();
        let five = format_desc(vec![Dim::Fixed(5)], &[('u', 8)]);
        let six = format_desc(vec![Dim::Fixed(6)], &[('u', 8)]);
        let seven = format_desc(vec![Dim::Fixed(7)], &[('u', 8)]);
        let records = |n: usize| Value::records(vec![n], vec![vec![Scalar::UInt(1)]; n]).unwrap();

        assert!(immediate_fits(&five, &records(5), &f40));
        assert!(!immediate_fits(&six, &records(6), &f40));
        assert!(immediate_fits(&six, &records(6), &f48));
        assert!(!immediate_fits(&seven, &records(7), &f48));

        let variable = dtype_desc(vec![Dim::Variable], DType::u8(), Order::C);
        assert!(!immediate_fits(&variable, &Value::from(vec![1u8]), &f40));
    }

    #[test]
    fn test_decode_immediate_strips_head_padding() {
        let desc = dtype_desc(vec![], DType::u16().with_endian(Endian::Big), Order::C);
        let value = decode_immediate(&desc, &[0, 0, 0, 0x12, 0x34]).unwrap();
        assert_eq!(value, Value::array(vec![], vec![0x1234u16]).unwrap());
    }

    #[test]
    fn test_encoded_len() {
        let desc = format_desc(vec![Dim::Variable], &[('u', 4)]);
        let value = Value::records(vec![3], vec![vec![Scalar::UInt(1)]; 3]).unwrap();
        assert_eq!(encoded_len(&desc, &value).unwrap(), 2);
    }

    #[test]
    fn test_empty_fortran_array_with_huge_dims() {
        let desc = dtype_desc(
            vec![Dim::Fixed(0), Dim::Fixed(1 << 40), Dim::Fixed(1 << 40)],
            DType::u8(),
            Order::F,
        );
        let value = decode(&desc, &[]).unwrap();
        assert_eq!(value.shape(), &[0, 1 << 40, 1 << 40]);
    }
}
