//! Error types for the SPEAD engine.
//!
//! Every operation returns a structured error instead of panicking. Errors
//! are grouped by failure domain so a receiver can tell a corrupt packet
//! (drop it, keep going) from a failed transport (the stream is over).

use thiserror::Error;

/// Top-level error type for all operations in the engine.
///
/// Each variant corresponds to a failure domain:
/// - Bit I/O: reading/writing bit fields from/to byte buffers
/// - Codec: converting values and descriptors to and from bytes
/// - Packet: malformed packets, or heaps that cannot be packetized
/// - Reassembly: heaps that were abandoned, evicted or truncated
/// - Item: item group lookups and unknown item ids
/// - Transport: the packet source or sink failed
#[derive(Debug, Error)]
pub enum Error {
    /// Bit I/O operation failed (e.g., reading past end of buffer)
    #[error("bit I/O error: {0}")]
    BitIo(#[from] BitIoError),

    /// Value or descriptor could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Malformed packet or packetization failure
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// A heap could not be reassembled
    #[error("reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    /// Item group error (unknown id, reserved id, ...)
    #[error("item error: {0}")]
    Item(#[from] ItemError),

    /// Transport failure; fatal to the stream
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True if the stream cannot continue after this error.
    ///
    /// Only transport failures are fatal; everything else is isolated to a
    /// single packet, heap or item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// Bit-level I/O errors.
#[derive(Debug, Error)]
pub enum BitIoError {
    /// Attempted to read past the end of the buffer
    #[error("unexpected end of bit stream: requested {requested} bits, {available} available")]
    UnexpectedEof { requested: usize, available: usize },

    /// Invalid bit count (more than 64 bits in one field)
    #[error("invalid bit count: {0}")]
    InvalidBitCount(usize),
}

/// Value, dtype and descriptor codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// dtype string could not be parsed
    #[error("unsupported dtype {0:?}")]
    UnsupportedDtype(String),

    /// numpy header could not be parsed
    #[error("invalid numpy header: {0}")]
    InvalidNumpyHeader(String),

    /// A format field has an unknown type character or an invalid width
    #[error("invalid format field ({kind:?}, {bits})")]
    InvalidFormatField { kind: char, bits: u64 },

    /// Descriptor carries neither a dtype nor a format, or is otherwise unusable
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// More than one shape dimension is variable
    #[error("at most one dimension may be variable, got {0}")]
    TooManyVariableDims(usize),

    /// The value does not match the descriptor's dtype or format
    #[error("value does not match descriptor of item {id:#x}: {reason}")]
    TypeMismatch { id: u64, reason: String },

    /// The value's shape does not match the descriptor's shape
    #[error("shape mismatch for item {id:#x}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        id: u64,
        expected: String,
        actual: Vec<usize>,
    },

    /// An array or record value built with the wrong number of elements
    #[error("shape {shape:?} does not hold {len} elements")]
    ElementCount { shape: Vec<usize>, len: usize },

    /// A scalar does not fit in its format field
    #[error("value {value} does not fit in {bits} bits for item {id:#x}")]
    OutOfRange { id: u64, value: String, bits: u32 },

    /// Not enough bytes to decode the value
    #[error("item {id:#x} needs {required} bytes, got {actual}")]
    ValueTooShort {
        id: u64,
        required: usize,
        actual: usize,
    },

    /// Variable-size item transmitted as an immediate with an ambiguous length
    #[error("item {id:#x}: {actual} bytes is not a whole number of elements")]
    RaggedValue { id: u64, actual: usize },

    /// Shape times element width does not fit in memory arithmetic
    #[error("item {id:#x}: shape is too large to address")]
    SizeOverflow { id: u64 },

    /// A string field was not valid UTF-8
    #[error("descriptor field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

/// Packet errors. Everything except `PacketTooSmall` and `TooManyItems`
/// is a malformed packet seen on the receive side.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Packet is too short to contain a valid header
    #[error("packet too short: need at least {required} bytes, got {actual}")]
    PacketTooShort { required: usize, actual: usize },

    /// Invalid magic number in packet header
    #[error("invalid packet magic: expected {expected:#04x}, got {actual:#04x}")]
    InvalidMagic { expected: u8, actual: u8 },

    /// Unsupported protocol version
    #[error("unsupported protocol version {0}")]
    InvalidVersion(u8),

    /// Item pointer and heap address widths do not add up to 64 bits
    #[error("invalid flavour: item pointer width {item_pointer_width}, heap address width {heap_address_width}")]
    InvalidFlavour {
        item_pointer_width: u8,
        heap_address_width: u8,
    },

    /// A required packet item (heap cnt, heap length, ...) is missing
    #[error("packet is missing the {0} item")]
    MissingItem(&'static str),

    /// A packet item that must be immediate was sent in address mode
    #[error("packet item {id:#x} must be immediate")]
    NotImmediate { id: u64 },

    /// The payload slice lies outside the heap
    #[error("payload [{offset}, {offset}+{length}) lies outside heap of {heap_length} bytes")]
    PayloadOutOfRange {
        offset: u64,
        length: u64,
        heap_length: u64,
    },

    /// Fewer payload bytes than the header declared
    #[error("payload length mismatch: header says {expected}, got {actual}")]
    PayloadLengthMismatch { expected: usize, actual: usize },

    /// The packet cannot hold its pointer table plus at least one payload byte
    #[error("max packet size {max_packet_size} too small for {overhead} bytes of header and pointers")]
    PacketTooSmall {
        max_packet_size: usize,
        overhead: usize,
    },

    /// More item pointers than the header can count
    #[error("too many items in one heap: {0}")]
    TooManyItems(usize),

    /// An id or value does not fit its item pointer field
    #[error("{field} {value:#x} does not fit in {bits} bits")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        bits: u32,
    },
}

/// Reassembly errors. Each one concerns a single heap; the stream carries on.
#[derive(Debug, Error)]
pub enum ReassemblyError {
    /// Packets of the same heap disagree on the heap length
    #[error("heap {heap_cnt}: heap length mismatch, expected {expected}, got {actual}")]
    HeapLengthMismatch {
        heap_cnt: u64,
        expected: u64,
        actual: u64,
    },

    /// Packets of the same heap disagree on heap address bits
    #[error("heap {heap_cnt}: heap address bits changed from {expected} to {actual}")]
    FlavourMismatch {
        heap_cnt: u64,
        expected: u32,
        actual: u32,
    },

    /// Packets of the same heap carry different item pointer tables
    #[error("heap {heap_cnt}: item pointer tables disagree between packets")]
    PointerMismatch { heap_cnt: u64 },

    /// Stream ended while the heap was incomplete
    #[error("heap {heap_cnt} truncated: {received} of {heap_length} bytes received")]
    TruncatedHeap {
        heap_cnt: u64,
        received: u64,
        heap_length: u64,
    },

    /// Heap evicted because too many heaps were in flight
    #[error("heap {heap_cnt} evicted (max {max_heaps} live heaps): {received} of {heap_length} bytes received")]
    EvictedHeap {
        heap_cnt: u64,
        received: u64,
        heap_length: u64,
        max_heaps: usize,
    },

    /// The declared heap length exceeds what the receiver will buffer
    #[error("heap {heap_cnt}: declared length {heap_length} exceeds the {max_heap_size}-byte limit")]
    HeapTooLarge {
        heap_cnt: u64,
        heap_length: u64,
        max_heap_size: u64,
    },

    /// An item pointer of a completed heap addresses bytes outside the payload
    #[error("heap {heap_cnt}: item {id:#x} at offset {offset} lies outside {heap_length}-byte payload")]
    InvalidItemPointer {
        heap_cnt: u64,
        id: u64,
        offset: u64,
        heap_length: u64,
    },

    /// A completed heap could not be interpreted
    #[error("heap {heap_cnt} is unusable: {reason}")]
    InvalidHeap { heap_cnt: u64, reason: String },
}

/// Item group errors.
#[derive(Debug, Error)]
pub enum ItemError {
    /// A heap carried a value for an item with no known descriptor
    #[error("unknown item id {0:#x}")]
    UnknownItemId(u64),

    /// No item with this name
    #[error("unknown item name {0:?}")]
    UnknownItemName(String),

    /// Id is reserved by the protocol or does not fit the item pointer
    #[error("item id {0:#x} is reserved or out of range")]
    InvalidId(u64),

    /// get_heap was called after get_end
    #[error("heap generator already produced its end-of-stream heap")]
    GeneratorExhausted,
}

/// Transport errors: the source or sink itself failed.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The other end of an in-memory link went away
    #[error("transport closed")]
    Closed,

    /// I/O failure reported by the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
