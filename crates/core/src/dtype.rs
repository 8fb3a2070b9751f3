//! Element types for whole-byte items.
//!
//! A dtype is written on the wire the way numpy spells it: a byte-order
//! character (`<`, `>` or `|`), a kind character and a size in bytes, e.g.
//! `<u2` or `|b1`. Descriptors carry it inside a numpy header string:
//!
//! ```text
//! {'descr': '<u2', 'fortran_order': False, 'shape': (2, 3)}
//! ```

use crate::error::{CodecError, Result};

/// Byte order of multi-byte elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn swapped(self) -> Self {
        match self {
            Endian::Little => Endian::Big,
            Endian::Big => Endian::Little,
        }
    }
}

/// Element kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Int,
    UInt,
    Float,
}

/// Element order of a multi-dimensional value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Order {
    /// Row-major
    #[default]
    C,
    /// Column-major
    F,
}

/// A whole-byte element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    kind: ScalarKind,
    size: usize,
    endian: Endian,
}

impl DType {
    /// Build a dtype, rejecting sizes the codec cannot represent.
    pub fn new(kind: ScalarKind, size: usize, endian: Endian) -> Result<Self> {
        let valid = match kind {
            ScalarKind::Bool => size == 1,
            ScalarKind::Int | ScalarKind::UInt => matches!(size, 1 | 2 | 4 | 8),
            ScalarKind::Float => matches!(size, 4 | 8),
        };
        if !valid {
            return Err(CodecError::UnsupportedDtype(format!("{kind:?} of {size} bytes")).into());
        }
        Ok(Self { kind, size, endian })
    }

    // Infallible constructors for the common little-endian types.
    pub const fn bool() -> Self {
        Self { kind: ScalarKind::Bool, size: 1, endian: Endian::Little }
    }
    pub const fn i8() -> Self {
        Self { kind: ScalarKind::Int, size: 1, endian: Endian::Little }
    }
    pub const fn u8() -> Self {
        Self { kind: ScalarKind::UInt, size: 1, endian: Endian::Little }
    }
    pub const fn i16() -> Self {
        Self { kind: ScalarKind::Int, size: 2, endian: Endian::Little }
    }
    pub const fn u16() -> Self {
        Self { kind: ScalarKind::UInt, size: 2, endian: Endian::Little }
    }
    pub const fn i32() -> Self {
        Self { kind: ScalarKind::Int, size: 4, endian: Endian::Little }
    }
    pub const fn u32() -> Self {
        Self { kind: ScalarKind::UInt, size: 4, endian: Endian::Little }
    }
    pub const fn i64() -> Self {
        Self { kind: ScalarKind::Int, size: 8, endian: Endian::Little }
    }
    pub const fn u64() -> Self {
        Self { kind: ScalarKind::UInt, size: 8, endian: Endian::Little }
    }
    pub const fn f32() -> Self {
        Self { kind: ScalarKind::Float, size: 4, endian: Endian::Little }
    }
    pub const fn f64() -> Self {
        Self { kind: ScalarKind::Float, size: 8, endian: Endian::Little }
    }

    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    /// Element size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn with_endian(self, endian: Endian) -> Self {
        Self { endian, ..self }
    }

    /// Same dtype with the byte order flipped. Single-byte types are unchanged.
    pub fn swapped(self) -> Self {
        if self.size == 1 {
            return self;
        }
        self.with_endian(self.endian.swapped())
    }

    /// Equality ignoring byte order.
    pub fn same_type(&self, other: &DType) -> bool {
        self.kind == other.kind && self.size == other.size
    }

    /// numpy type string, e.g. `<u2`.
    pub fn descr(&self) -> String {
        let order = if self.size == 1 {
            '|'
        } else {
            match self.endian {
                Endian::Little => '<',
                Endian::Big => '>',
            }
        };
        let kind = match self.kind {
            ScalarKind::Bool => 'b',
            ScalarKind::Int => 'i',
            ScalarKind::UInt => 'u',
            ScalarKind::Float => 'f',
        };
        format!("{order}{kind}{}", self.size)
    }

    /// Parse a numpy type string. A missing byte-order character or `=`
    /// means little endian.
    pub fn parse(descr: &str) -> Result<Self> {
        let unsupported = || CodecError::UnsupportedDtype(descr.to_string());
        let mut chars = descr.chars().peekable();
        let endian = match chars.peek() {
            Some('<') | Some('=') | Some('|') => {
                chars.next();
                Endian::Little
            }
            Some('>') | Some('!') => {
                chars.next();
                Endian::Big
            }
            _ => Endian::Little,
        };
        let kind = match chars.next() {
            Some('b') | Some('?') => ScalarKind::Bool,
            Some('i') => ScalarKind::Int,
            Some('u') => ScalarKind::UInt,
            Some('f') => ScalarKind::Float,
            _ => return Err(unsupported().into()),
        };
        let size: usize = chars
            .collect::<String>()
            .parse()
            .map_err(|_| unsupported())?;
        Self::new(kind, size, endian).map_err(|_| unsupported().into())
    }
}

/// A dimension as written in a numpy header: `None` or `-1` is variable.
pub type HeaderDim = Option<usize>;

/// Parsed contents of a numpy header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumpyHeader {
    pub dtype: DType,
    pub order: Order,
    pub shape: Vec<HeaderDim>,
}

impl NumpyHeader {
    /// Render as the dict literal numpy writes.
    pub fn render(&self) -> String {
        let dims: Vec<String> = self
            .shape
            .iter()
            .map(|d| match d {
                Some(n) => n.to_string(),
                None => "-1".to_string(),
            })
            .collect();
        let shape = match dims.len() {
            1 => format!("({},)", dims[0]),
            _ => format!("({})", dims.join(", ")),
        };
        let fortran = match self.order {
            Order::C => "False",
            Order::F => "True",
        };
        format!(
            "{{'descr': '{}', 'fortran_order': {}, 'shape': {}}}",
            self.dtype.descr(),
            fortran,
            shape
        )
    }

    /// Parse a numpy header dict literal.
    ///
    /// Accepts either quote style, optional trailing commas and surrounding
    /// whitespace or padding, and `None`/`-1` for a variable dimension.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parser = HeaderParser::new(text);
        parser.expect('{')?;

        let mut dtype = None;
        let mut order = None;
        let mut shape = None;
        loop {
            if parser.eat('}') {
                break;
            }
            let key = parser.string()?;
            parser.expect(':')?;
            match key.as_str() {
                "descr" => dtype = Some(DType::parse(&parser.string()?)?),
                "fortran_order" => {
                    order = Some(if parser.boolean()? { Order::F } else { Order::C })
                }
                "shape" => shape = Some(parser.tuple()?),
                other => return Err(parser.error(&format!("unexpected key {other:?}"))),
            }
            if !parser.eat(',') {
                parser.expect('}')?;
                break;
            }
        }

        match (dtype, order, shape) {
            (Some(dtype), Some(order), Some(shape)) => Ok(Self {
                dtype,
                order,
                shape,
            }),
            _ => Err(parser.error("descr, fortran_order and shape are all required")),
        }
    }
}

/// Just enough of a Python literal parser for numpy headers.
struct HeaderParser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> HeaderParser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn error(&self, what: &str) -> crate::error::Error {
        CodecError::InvalidNumpyHeader(format!("{what} at byte {} of {:?}", self.pos, self.text)).into()
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {c:?}")))
        }
    }

    fn string(&mut self) -> Result<String> {
        self.skip_ws();
        let quote = match self.rest().chars().next() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.error("expected string")),
        };
        self.pos += 1;
        let end = self
            .rest()
            .find(quote)
            .ok_or_else(|| self.error("unterminated string"))?;
        let value = self.rest()[..end].to_string();
        self.pos += end + 1;
        Ok(value)
    }

    fn word(&mut self) -> &'a str {
        self.skip_ws();
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn boolean(&mut self) -> Result<bool> {
        match self.word() {
            "True" => Ok(true),
            "False" => Ok(false),
            _ => Err(self.error("expected True or False")),
        }
    }

    fn tuple(&mut self) -> Result<Vec<HeaderDim>> {
        self.expect('(')?;
        let mut dims = Vec::new();
        loop {
            if self.eat(')') {
                return Ok(dims);
            }
            let word = self.word();
            let dim = match word {
                "None" | "-1" => None,
                _ => Some(
                    word.trim_end_matches('L')
                        .parse::<usize>()
                        .map_err(|_| self.error(&format!("bad dimension {word:?}")))?,
                ),
            };
            dims.push(dim);
            if !self.eat(',') {
                self.expect(')')?;
                return Ok(dims);
            }
        }
    }
}
