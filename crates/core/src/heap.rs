//! Heaps on both sides of the wire.
//!
//! A send-side [`Heap`] is an ordered list of items, each either an inline
//! 64-bit value or a byte blob. Laying it out gives the item pointer table
//! and the payload that `packet::packetize` splits into packets.
//!
//! A receive-side [`FrozenHeap`] is what the reassembler hands out once
//! every payload byte has arrived: the pointer table resolved into
//! [`RawItem`]s.

use tracing::trace;

use crate::descriptor::ItemDescriptor;
use crate::error::{ReassemblyError, Result};
use crate::flavour::{ctrl, ids, BugCompat, Flavour};
use crate::packet::{packetize, PacketGenerator};

/// Payload of one send-side item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemData {
    /// Always sent as an immediate
    Inline(u64),
    /// Sent as an immediate if allowed and short enough, otherwise in the payload
    Bytes { data: Vec<u8>, allow_immediate: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapItem {
    pub id: u64,
    pub data: ItemData,
}

/// A heap being built for sending.
#[derive(Debug, Clone)]
pub struct Heap {
    cnt: u64,
    flavour: Flavour,
    items: Vec<HeapItem>,
}

impl Heap {
    pub fn new(cnt: u64, flavour: Flavour) -> Self {
        Self {
            cnt,
            flavour,
            items: Vec::new(),
        }
    }

    pub fn cnt(&self) -> u64 {
        self.cnt
    }

    pub fn flavour(&self) -> &Flavour {
        &self.flavour
    }

    pub fn items(&self) -> &[HeapItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn add_item(&mut self, id: u64, data: Vec<u8>, allow_immediate: bool) {
        self.items.push(HeapItem {
            id,
            data: ItemData::Bytes {
                data,
                allow_immediate,
            },
        });
    }

    pub fn add_inline(&mut self, id: u64, value: u64) {
        self.items.push(HeapItem {
            id,
            data: ItemData::Inline(value),
        });
    }

    /// Encode `descriptor` for this heap's flavour and append it.
    pub fn add_descriptor(&mut self, descriptor: &ItemDescriptor) -> Result<()> {
        let raw = descriptor.to_raw(&self.flavour)?;
        self.add_item(ids::DESCRIPTOR, raw, false);
        Ok(())
    }

    pub fn add_start(&mut self) {
        self.add_inline(ids::STREAM_CTRL, ctrl::STREAM_START);
    }

    pub fn add_end(&mut self) {
        self.add_inline(ids::STREAM_CTRL, ctrl::STREAM_STOP);
    }

    pub fn has_descriptors(&self) -> bool {
        self.items.iter().any(|item| item.id == ids::DESCRIPTOR)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.items
            .iter()
            .any(|item| item.id == ids::STREAM_CTRL && item.data == ItemData::Inline(ctrl::STREAM_STOP))
    }

    /// Item pointer table and payload, in item order.
    pub fn layout(&self) -> Result<(Vec<u64>, Vec<u8>)> {
        let flavour = &self.flavour;
        let mut pointers = Vec::with_capacity(self.items.len());
        let mut payload = Vec::new();
        for item in &self.items {
            let pointer = match &item.data {
                ItemData::Inline(value) => flavour.encode_immediate(item.id, *value)?,
                ItemData::Bytes {
                    data,
                    allow_immediate: true,
                } if flavour.fits_immediate(data.len()) => {
                    let value = data.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
                    flavour.encode_immediate(item.id, value)?
                }
                ItemData::Bytes { data, .. } => {
                    let pointer = flavour.encode_address(item.id, payload.len() as u64)?;
                    payload.extend_from_slice(data);
                    pointer
                }
            };
            pointers.push(pointer);
        }
        trace!(
            heap_cnt = self.cnt,
            items = pointers.len(),
            payload = payload.len(),
            "laid out heap"
        );
        Ok((pointers, payload))
    }

    /// Split into packets of at most `max_packet_size` bytes.
    pub fn packets(&self, max_packet_size: usize) -> Result<PacketGenerator> {
        packetize(self, max_packet_size)
    }
}

/// An item of a received heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    pub id: u64,
    pub is_immediate: bool,
    /// For immediates, the whole value field (heap address width) big-endian
    pub data: Vec<u8>,
}

impl RawItem {
    /// The data as a big-endian integer (meaningful for immediates).
    pub fn as_u64(&self) -> u64 {
        self.data.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
    }
}

/// Resolve an item pointer table against a complete payload.
///
/// Address-mode items run from their offset to the next larger offset, the
/// last one to the end of the payload. `NULL` pointers only delimit.
pub(crate) fn resolve_items(
    heap_cnt: u64,
    flavour: &Flavour,
    pointers: &[u64],
    payload: &[u8],
) -> Result<Vec<RawItem>> {
    let decoded: Vec<_> = pointers.iter().map(|&raw| flavour.decode_pointer(raw)).collect();

    // NULL pointers delimit too, so they are checked with the rest
    if let Some(ptr) = decoded
        .iter()
        .find(|ptr| !ptr.is_immediate && ptr.value > payload.len() as u64)
    {
        return Err(ReassemblyError::InvalidItemPointer {
            heap_cnt,
            id: ptr.id,
            offset: ptr.value,
            heap_length: payload.len() as u64,
        }
        .into());
    }

    let mut by_offset: Vec<usize> = (0..decoded.len()).filter(|&i| !decoded[i].is_immediate).collect();
    by_offset.sort_by_key(|&i| decoded[i].value);
    let mut ends = vec![payload.len() as u64; decoded.len()];
    for pair in by_offset.windows(2) {
        ends[pair[0]] = decoded[pair[1]].value;
    }

    let mut items = Vec::with_capacity(decoded.len());
    for (i, ptr) in decoded.iter().enumerate() {
        if ptr.id == ids::NULL {
            continue;
        }
        let data = if ptr.is_immediate {
            flavour.immediate_bytes(ptr.value)
        } else {
            payload[ptr.value as usize..ends[i] as usize].to_vec()
        };
        items.push(RawItem {
            id: ptr.id,
            is_immediate: ptr.is_immediate,
            data,
        });
    }
    Ok(items)
}

/// A completely received heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenHeap {
    cnt: u64,
    flavour: Flavour,
    items: Vec<RawItem>,
}

impl FrozenHeap {
    /// Freeze a heap from its pointer table and complete payload.
    pub fn new(cnt: u64, flavour: Flavour, pointers: &[u64], payload: &[u8]) -> Result<Self> {
        let items = resolve_items(cnt, &flavour, pointers, payload)?;
        Ok(Self { cnt, flavour, items })
    }

    pub fn cnt(&self) -> u64 {
        self.cnt
    }

    pub fn flavour(&self) -> &Flavour {
        &self.flavour
    }

    pub fn bug_compat(&self) -> BugCompat {
        self.flavour.bug_compat()
    }

    pub fn items(&self) -> &[RawItem] {
        &self.items
    }

    /// Descriptors carried by this heap, in heap order.
    pub fn descriptors(&self) -> impl Iterator<Item = Result<ItemDescriptor>> + '_ {
        self.items
            .iter()
            .filter(|item| item.id == ids::DESCRIPTOR)
            .map(|item| ItemDescriptor::from_raw(&item.data, self.flavour.bug_compat()))
    }

    fn ctrl_value(&self) -> Option<u64> {
        self.items
            .iter()
            .find(|item| item.id == ids::STREAM_CTRL && item.is_immediate)
            .map(RawItem::as_u64)
    }

    pub fn is_start_of_stream(&self) -> bool {
        self.ctrl_value() == Some(ctrl::STREAM_START)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.ctrl_value() == Some(ctrl::STREAM_STOP)
    }

    /// True if the heap carries nothing besides stream control.
    pub fn is_ctrl_only(&self) -> bool {
        self.items.iter().all(|item| item.id == ids::STREAM_CTRL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_modes() {
        let mut heap = Heap::new(1, Flavour::default());
        heap.add_item(0x1000, vec![1, 2, 3, 4, 5], true);
        heap.add_item(0x1001, vec![1, 2, 3, 4, 5, 6], true);
        heap.add_item(0x1002, vec![7], false);
        heap.add_inline(0x1003, 42);

        let (pointers, payload) = heap.layout().unwrap();
        let flavour = Flavour::default();
        let ptrs: Vec<_> = pointers.iter().map(|&p| flavour.decode_pointer(p)).collect();
        assert!(ptrs[0].is_immediate);
        assert_eq!(ptrs[0].value, 0x01_0203_0405);
        assert!(!ptrs[1].is_immediate);
        assert_eq!(ptrs[1].value, 0);
        assert!(!ptrs[2].is_immediate);
        assert_eq!(ptrs[2].value, 6);
        assert!(ptrs[3].is_immediate);
        assert_eq!(payload, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_short_immediate_is_right_aligned() {
        let mut heap = Heap::new(1, Flavour::default());
        heap.add_item(0x1000, vec![0xAB, 0xCD], true);
        let (pointers, payload) = heap.layout().unwrap();
        assert!(payload.is_empty());
        let frozen = FrozenHeap::new(1, Flavour::default(), &pointers, &payload).unwrap();
        assert_eq!(frozen.items()[0].data, vec![0, 0, 0, 0xAB, 0xCD]);
    }

    #[test]
    fn test_resolve_lengths_follow_offsets() {
        let flavour = Flavour::default();
        // pointers out of offset order, one empty item sharing an offset
        let pointers = vec![
            flavour.encode_address(0x1002, 5).unwrap(),
            flavour.encode_address(0x1000, 0).unwrap(),
            flavour.encode_address(0x1001, 3).unwrap(),
            flavour.encode_address(0x1003, 5).unwrap(),
        ];
        let payload = b"abcdefgh";
        let frozen = FrozenHeap::new(9, flavour, &pointers, payload).unwrap();
        let items = frozen.items();
        assert_eq!(items[0].id, 0x1002);
        assert_eq!(items[0].data, b"".to_vec());
        assert_eq!(items[1].data, b"abc".to_vec());
        assert_eq!(items[2].data, b"de".to_vec());
        assert_eq!(items[3].data, b"fgh".to_vec());
    }

    #[test]
    fn test_pointer_outside_payload() {
        let flavour = Flavour::default();
        let pointers = vec![flavour.encode_address(0x1000, 9).unwrap()];
        assert!(matches!(
            FrozenHeap::new(4, flavour, &pointers, b"abc"),
            Err(crate::error::Error::Reassembly(ReassemblyError::InvalidItemPointer {
                heap_cnt: 4,
                offset: 9,
                ..
            }))
        ));
    }

    #[test]
    fn test_later_pointer_outside_payload() {
        let flavour = Flavour::default();
        let pointers = vec![
            flavour.encode_address(0x1000, 0).unwrap(),
            flavour.encode_address(0x1001, 100).unwrap(),
        ];
        assert!(matches!(
            FrozenHeap::new(2, flavour, &pointers, &[0; 8]),
            Err(crate::error::Error::Reassembly(ReassemblyError::InvalidItemPointer {
                id: 0x1001,
                offset: 100,
                ..
            }))
        ));

        let pointers = vec![
            flavour.encode_address(0x1000, 0).unwrap(),
            flavour.encode_address(ids::NULL, 100).unwrap(),
        ];
        assert!(FrozenHeap::new(2, flavour, &pointers, &[0; 8]).is_err());
    }

    #[test]
    fn test_stream_control() {
        let mut heap = Heap::new(3, Flavour::default());
        heap.add_end();
        assert!(heap.is_end_of_stream());
        assert!(!heap.has_descriptors());
        let (pointers, payload) = heap.layout().unwrap();
        let frozen = FrozenHeap::new(3, Flavour::default(), &pointers, &payload).unwrap();
        assert!(frozen.is_end_of_stream());
        assert!(!frozen.is_start_of_stream());
        assert!(frozen.is_ctrl_only());
    }
}
