//! Heap reassembly with bounded memory.
//!
//! The reassembler collects packets by heap cnt until every payload byte of
//! a heap has arrived, then freezes and emits it. Packets may arrive in any
//! order and any number of times.
//!
//! # Design
//!
//! - **Bounded table**: at most `max_heaps` partial heaps; a new heap that
//!   does not complete at once evicts the oldest one
//! - **Per-heap state**: a payload buffer of the declared heap length and
//!   the set of byte ranges received so far
//! - **Consistency**: every packet of a heap must agree on heap length,
//!   heap address width and the item pointer table; a disagreement abandons
//!   the heap
//! - **History**: cnts of recently finished heaps, so late packets do not
//!   start a heap that can never complete
//! - **End of stream**: a packet carrying `STREAM_CTRL = STOP` flushes all
//!   partial heaps as truncated and stops the reassembler
//!
//! # Memory Bounds
//!
//! ```text
//! max_heaps * largest heap length + history_len * 8 bytes
//! ```
//!
//! # Thread Safety
//!
//! This structure is NOT thread-safe. Each receive stream owns one.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::error::{Error, ReassemblyError, Result};
use crate::flavour::{ctrl, ids, BugCompat, Flavour};
use crate::heap::FrozenHeap;
use crate::metrics::{ReorderTracker, StreamStats};
use crate::packet::{decode_packet, Packet};
use crate::ranges::RangeSet;

/// Default number of partial heaps kept at once.
pub const DEFAULT_MAX_HEAPS: usize = 4;

/// Default number of finished heap cnts remembered.
pub const DEFAULT_HISTORY_LEN: usize = 64;

/// Default upper bound on a heap's declared length (64 MiB).
pub const DEFAULT_MAX_HEAP_SIZE: u64 = 64 << 20;

/// Reassembler settings.
#[derive(Debug, Clone, Copy)]
pub struct ReassemblerConfig {
    /// Partial heaps kept before the oldest is evicted
    pub max_heaps: usize,
    /// How received descriptors are interpreted
    pub bug_compat: BugCompat,
    /// Finished heap cnts remembered for ignoring late packets
    pub history_len: usize,
    /// Largest heap length a packet may declare; bigger heaps are abandoned
    pub max_heap_size: u64,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            max_heaps: DEFAULT_MAX_HEAPS,
            bug_compat: BugCompat::empty(),
            history_len: DEFAULT_HISTORY_LEN,
            max_heap_size: DEFAULT_MAX_HEAP_SIZE,
        }
    }
}

/// Where a heap cnt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapState {
    Unseen,
    Assembling,
    Complete,
    Abandoned,
}

/// Output of the reassembler.
#[derive(Debug)]
pub enum ReassemblyEvent {
    /// A heap was fully received
    Heap(FrozenHeap),
    /// A heap was given up on
    Dropped(ReassemblyError),
    /// The stream ended; nothing follows
    EndOfStream,
}

/// A heap in the process of being received.
#[derive(Debug)]
struct PartialHeap {
    cnt: u64,
    heap_address_bits: u32,
    heap_length: u64,
    payload: Vec<u8>,
    received: RangeSet,
    /// Pointer table of the first packet; all others must match it
    pointers: Vec<u64>,
    end_of_stream: bool,
    packets: u64,
    /// Creation order, for eviction
    seq: u64,
}

impl PartialHeap {
    fn new(packet: &Packet, seq: u64) -> Self {
        Self {
            cnt: packet.heap_cnt,
            heap_address_bits: packet.heap_address_bits,
            heap_length: packet.heap_length,
            payload: vec![0; packet.heap_length as usize],
            received: RangeSet::new(),
            pointers: packet.pointers.clone(),
            end_of_stream: false,
            packets: 0,
            seq,
        }
    }

    /// Add a packet. Returns the number of payload bytes not seen before.
    fn add_packet(
        &mut self,
        packet: &Packet,
        end_of_stream: bool,
    ) -> std::result::Result<u64, ReassemblyError> {
        if packet.heap_length != self.heap_length {
            return Err(ReassemblyError::HeapLengthMismatch {
                heap_cnt: self.cnt,
                expected: self.heap_length,
                actual: packet.heap_length,
            });
        }
        if packet.heap_address_bits != self.heap_address_bits {
            return Err(ReassemblyError::FlavourMismatch {
                heap_cnt: self.cnt,
                expected: self.heap_address_bits,
                actual: packet.heap_address_bits,
            });
        }
        if packet.pointers != self.pointers {
            return Err(ReassemblyError::PointerMismatch { heap_cnt: self.cnt });
        }

        let range = packet.payload_range();
        let slot = (range.end <= self.heap_length && packet.payload.len() as u64 == packet.payload_length)
            .then(|| self.payload.get_mut(range.start as usize..range.end as usize))
            .flatten();
        let Some(slot) = slot else {
            return Err(ReassemblyError::InvalidHeap {
                heap_cnt: self.cnt,
                reason: format!("payload slice {range:?} does not fit the heap"),
            });
        };
        slot.copy_from_slice(&packet.payload);
        self.packets += 1;
        self.end_of_stream |= end_of_stream;
        Ok(self.received.insert(packet.payload_range()))
    }

    fn is_complete(&self) -> bool {
        self.received.is_complete(self.heap_length)
    }

    fn truncated(&self) -> ReassemblyError {
        ReassemblyError::TruncatedHeap {
            heap_cnt: self.cnt,
            received: self.received.total(),
            heap_length: self.heap_length,
        }
    }

    fn freeze(self, bug_compat: BugCompat) -> Result<FrozenHeap> {
        let flavour = Flavour::new(self.heap_address_bits, bug_compat)?;
        FrozenHeap::new(self.cnt, flavour, &self.pointers, &self.payload)
    }
}

/// True if the packet's pointer table carries the end-of-stream marker.
fn carries_stop(packet: &Packet) -> bool {
    let mask = (1u64 << packet.heap_address_bits) - 1;
    packet.pointers.iter().any(|&raw| {
        let id = (raw & !(1u64 << 63)) >> packet.heap_address_bits;
        raw >> 63 == 1 && id == ids::STREAM_CTRL && raw & mask == ctrl::STREAM_STOP
    })
}

/// Reassembler for turning packets back into heaps.
#[derive(Debug)]
pub struct Reassembler {
    config: ReassemblerConfig,

    /// Partial heaps indexed by heap cnt
    heaps: HashMap<u64, PartialHeap>,

    /// Finished heap cnts, oldest first
    history: VecDeque<u64>,
    finished: HashMap<u64, HeapState>,

    next_seq: u64,
    stopped: bool,
    reorder: ReorderTracker,
    stats: StreamStats,
}

impl Reassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config: ReassemblerConfig {
                max_heaps: config.max_heaps.max(1),
                ..config
            },
            heaps: HashMap::new(),
            history: VecDeque::new(),
            finished: HashMap::new(),
            next_seq: 0,
            stopped: false,
            reorder: ReorderTracker::new(),
            stats: StreamStats::new(),
        }
    }

    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    /// Decode and insert one wire packet.
    ///
    /// # Errors
    /// Packet errors if `bytes` is not a valid packet; the reassembler is
    /// unaffected and the caller may carry on.
    pub fn insert_bytes(&mut self, bytes: &[u8]) -> Result<Vec<ReassemblyEvent>> {
        match decode_packet(bytes) {
            Ok((packet, _)) => Ok(self.insert_packet(packet)),
            Err(err) => {
                self.stats.packets_malformed += 1;
                warn!(error = %err, len = bytes.len(), "malformed packet");
                Err(err)
            }
        }
    }

    /// Insert a decoded packet and return whatever it caused.
    ///
    /// # Behavior
    ///
    /// Heaps are emitted as they complete, in completion order. A packet
    /// carrying the end-of-stream marker is followed by `Dropped` events for
    /// every partial heap and a final `EndOfStream`.
    pub fn insert_packet(&mut self, packet: Packet) -> Vec<ReassemblyEvent> {
        let mut events = Vec::new();
        if self.stopped {
            self.stats.packets_ignored += 1;
            debug!(heap_cnt = packet.heap_cnt, "packet after end of stream ignored");
            return events;
        }
        let cnt = packet.heap_cnt;
        if self.finished.contains_key(&cnt) {
            self.stats.packets_ignored += 1;
            debug!(heap_cnt = cnt, "packet for finished heap ignored");
            return events;
        }
        self.stats.packets_received += 1;
        let stop = carries_stop(&packet);

        if !self.heaps.contains_key(&cnt) {
            if packet.heap_length > self.config.max_heap_size {
                let err = ReassemblyError::HeapTooLarge {
                    heap_cnt: cnt,
                    heap_length: packet.heap_length,
                    max_heap_size: self.config.max_heap_size,
                };
                warn!(error = %err, "abandoning heap");
                self.finish(cnt, HeapState::Abandoned);
                self.stats.heaps_abandoned += 1;
                events.push(ReassemblyEvent::Dropped(err));
                if stop {
                    events.extend(self.stop());
                }
                return events;
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.heaps.insert(cnt, PartialHeap::new(&packet, seq));
        }
        if self.reorder.track(cnt, packet.payload_offset) {
            self.stats.packets_reordered += 1;
        }

        let added = match self.heaps.get_mut(&cnt) {
            Some(heap) => heap.add_packet(&packet, stop),
            None => return events,
        };
        match added {
            Ok(0) if packet.payload_length > 0 => {
                self.stats.packets_duplicate += 1;
                debug!(heap_cnt = cnt, offset = packet.payload_offset, "duplicate packet");
            }
            Ok(bytes) => self.stats.bytes_received += bytes,
            Err(err) => {
                warn!(error = %err, "abandoning heap");
                self.heaps.remove(&cnt);
                self.finish(cnt, HeapState::Abandoned);
                self.stats.heaps_abandoned += 1;
                events.push(ReassemblyEvent::Dropped(err));
            }
        }

        if self.heaps.get(&cnt).is_some_and(PartialHeap::is_complete) {
            if let Some(heap) = self.heaps.remove(&cnt) {
                self.complete(heap, &mut events);
            }
        } else if self.heaps.contains_key(&cnt) {
            self.enforce_limit(cnt, &mut events);
        }

        if stop {
            info!(heap_cnt = cnt, "end of stream");
            events.extend(self.stop());
        }
        events
    }

    fn complete(&mut self, heap: PartialHeap, events: &mut Vec<ReassemblyEvent>) {
        let cnt = heap.cnt;
        let end_of_stream = heap.end_of_stream;
        match heap.freeze(self.config.bug_compat) {
            Ok(frozen) => {
                self.finish(cnt, HeapState::Complete);
                // a bare end-of-stream marker is not a heap the application sees
                if end_of_stream && frozen.is_ctrl_only() {
                    return;
                }
                self.stats.heaps_completed += 1;
                events.push(ReassemblyEvent::Heap(frozen));
            }
            Err(err) => {
                warn!(heap_cnt = cnt, error = %err, "cannot freeze heap");
                self.finish(cnt, HeapState::Abandoned);
                self.stats.heaps_abandoned += 1;
                let err = match err {
                    Error::Reassembly(err) => err,
                    other => ReassemblyError::InvalidHeap {
                        heap_cnt: cnt,
                        reason: other.to_string(),
                    },
                };
                events.push(ReassemblyEvent::Dropped(err));
            }
        }
    }

    /// Evict the oldest partial heaps (other than `keep`) until within bounds.
    fn enforce_limit(&mut self, keep: u64, events: &mut Vec<ReassemblyEvent>) {
        while self.heaps.len() > self.config.max_heaps {
            let oldest = self
                .heaps
                .values()
                .filter(|heap| heap.cnt != keep)
                .min_by_key(|heap| heap.seq)
                .map(|heap| heap.cnt);
            let Some(oldest) = oldest else { break };
            if let Some(heap) = self.heaps.remove(&oldest) {
                warn!(
                    heap_cnt = oldest,
                    received = heap.received.total(),
                    heap_length = heap.heap_length,
                    "evicting partial heap"
                );
                self.finish(oldest, HeapState::Abandoned);
                self.stats.heaps_evicted += 1;
                events.push(ReassemblyEvent::Dropped(ReassemblyError::EvictedHeap {
                    heap_cnt: oldest,
                    received: heap.received.total(),
                    heap_length: heap.heap_length,
                    max_heaps: self.config.max_heaps,
                }));
            }
        }
    }

    fn finish(&mut self, cnt: u64, state: HeapState) {
        self.reorder.clear_heap(cnt);
        if self.config.history_len == 0 {
            return;
        }
        if self.finished.insert(cnt, state).is_none() {
            self.history.push_back(cnt);
        }
        while self.history.len() > self.config.history_len {
            if let Some(old) = self.history.pop_front() {
                self.finished.remove(&old);
            }
        }
    }

    /// Stop: flush partial heaps as truncated, oldest first, then end the
    /// stream. Does nothing if already stopped.
    pub fn stop(&mut self) -> Vec<ReassemblyEvent> {
        if self.stopped {
            return Vec::new();
        }
        self.stopped = true;
        let mut partial: Vec<PartialHeap> = self.heaps.drain().map(|(_, heap)| heap).collect();
        partial.sort_by_key(|heap| heap.seq);

        let mut events = Vec::with_capacity(partial.len() + 1);
        for heap in partial {
            let err = heap.truncated();
            warn!(error = %err, "flushing partial heap");
            self.stats.heaps_truncated += 1;
            events.push(ReassemblyEvent::Dropped(err));
        }
        events.push(ReassemblyEvent::EndOfStream);
        self.stats.complete();
        events
    }

    pub fn heap_state(&self, cnt: u64) -> HeapState {
        if self.heaps.contains_key(&cnt) {
            HeapState::Assembling
        } else {
            self.finished.get(&cnt).copied().unwrap_or(HeapState::Unseen)
        }
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut StreamStats {
        &mut self.stats
    }

    /// True if no heap is partially received.
    pub fn is_idle(&self) -> bool {
        self.heaps.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::packet::packet_size;

    fn packets_of(heap: &Heap, slice: usize) -> Vec<Packet> {
        let n = heap.layout().unwrap().0.len();
        heap.packets(packet_size(n, slice))
            .unwrap()
            .map(|bytes| decode_packet(&bytes).unwrap().0)
            .collect()
    }

    fn data_heap(cnt: u64, len: usize) -> Heap {
        let mut heap = Heap::new(cnt, Flavour::default());
        heap.add_item(0x1000, (0..len).map(|i| i as u8).collect(), false);
        heap
    }

    fn heaps(events: &[ReassemblyEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                ReassemblyEvent::Heap(h) => Some(h.cnt()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_heap_in_order() {
        let mut reassembler = Reassembler::new(ReassemblerConfig::default());
        let packets = packets_of(&data_heap(1, 30), 10);
        assert_eq!(packets.len(), 3);

        assert!(reassembler.insert_packet(packets[0].clone()).is_empty());
        assert!(reassembler.insert_packet(packets[1].clone()).is_empty());
        assert_eq!(reassembler.heap_state(1), HeapState::Assembling);

        let events = reassembler.insert_packet(packets[2].clone());
        assert_eq!(heaps(&events), vec![1]);
        assert_eq!(reassembler.heap_state(1), HeapState::Complete);
        match &events[0] {
            ReassemblyEvent::Heap(heap) => {
                assert_eq!(heap.items()[0].data, (0..30).map(|i| i as u8).collect::<Vec<_>>())
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_out_of_order_and_duplicates() {
        let mut reassembler = Reassembler::new(ReassemblerConfig::default());
        let packets = packets_of(&data_heap(1, 30), 10);

        assert!(reassembler.insert_packet(packets[2].clone()).is_empty());
        assert!(reassembler.insert_packet(packets[2].clone()).is_empty());
        assert!(reassembler.insert_packet(packets[0].clone()).is_empty());
        let events = reassembler.insert_packet(packets[1].clone());
        assert_eq!(heaps(&events), vec![1]);

        let stats = reassembler.stats();
        assert_eq!(stats.packets_duplicate, 1);
        assert_eq!(stats.packets_reordered, 2);

        // late duplicate of a finished heap
        assert!(reassembler.insert_packet(packets[0].clone()).is_empty());
        assert_eq!(reassembler.stats().packets_ignored, 1);
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_heap_length_mismatch_abandons_only_that_heap() {
        let mut reassembler = Reassembler::new(ReassemblerConfig::default());
        let first = packets_of(&data_heap(1, 30), 10);
        let other = packets_of(&data_heap(2, 20), 10);
        reassembler.insert_packet(first[0].clone());
        reassembler.insert_packet(other[0].clone());

        let mut bad = first[1].clone();
        bad.heap_length = 40;
        let events = reassembler.insert_packet(bad);
        assert!(matches!(
            events.as_slice(),
            [ReassemblyEvent::Dropped(ReassemblyError::HeapLengthMismatch { heap_cnt: 1, .. })]
        ));
        assert_eq!(reassembler.heap_state(1), HeapState::Abandoned);

        let events = reassembler.insert_packet(other[1].clone());
        assert_eq!(heaps(&events), vec![2]);
    }

    #[test]
    fn test_pointer_mismatch() {
        let mut reassembler = Reassembler::new(ReassemblerConfig::default());
        let packets = packets_of(&data_heap(1, 30), 10);
        reassembler.insert_packet(packets[0].clone());
        let mut bad = packets[1].clone();
        bad.pointers.push(0);
        let events = reassembler.insert_packet(bad);
        assert!(matches!(
            events.as_slice(),
            [ReassemblyEvent::Dropped(ReassemblyError::PointerMismatch { heap_cnt: 1 })]
        ));
    }

    #[test]
    fn test_eviction_of_oldest() {
        let mut reassembler = Reassembler::new(ReassemblerConfig {
            max_heaps: 1,
            ..Default::default()
        });
        let first = packets_of(&data_heap(1, 20), 10);
        let second = packets_of(&data_heap(2, 20), 10);

        assert!(reassembler.insert_packet(first[0].clone()).is_empty());
        let events = reassembler.insert_packet(second[0].clone());
        assert!(matches!(
            events.as_slice(),
            [ReassemblyEvent::Dropped(ReassemblyError::EvictedHeap {
                heap_cnt: 1,
                received: 10,
                heap_length: 20,
                max_heaps: 1,
            })]
        ));
        assert_eq!(reassembler.stats().heaps_evicted, 1);
        assert_eq!(heaps(&reassembler.insert_packet(second[1].clone())), vec![2]);
    }

    #[test]
    fn test_single_packet_heap_does_not_evict() {
        let mut reassembler = Reassembler::new(ReassemblerConfig {
            max_heaps: 1,
            ..Default::default()
        });
        let first = packets_of(&data_heap(1, 20), 10);
        reassembler.insert_packet(first[0].clone());
        let small = packets_of(&data_heap(2, 5), 10);
        let events = reassembler.insert_packet(small[0].clone());
        assert_eq!(heaps(&events), vec![2]);
        assert_eq!(reassembler.heap_state(1), HeapState::Assembling);
    }

    #[test]
    fn test_end_of_stream_truncates() {
        let mut reassembler = Reassembler::new(ReassemblerConfig::default());
        let partial = packets_of(&data_heap(1, 20), 10);
        reassembler.insert_packet(partial[0].clone());

        let mut end = Heap::new(2, Flavour::default());
        end.add_end();
        let events = reassembler.insert_packet(packets_of(&end, 10)[0].clone());
        assert!(matches!(
            events.as_slice(),
            [
                ReassemblyEvent::Dropped(ReassemblyError::TruncatedHeap {
                    heap_cnt: 1,
                    received: 10,
                    heap_length: 20,
                }),
                ReassemblyEvent::EndOfStream,
            ]
        ));
        assert!(reassembler.is_stopped());

        assert!(reassembler.insert_packet(partial[1].clone()).is_empty());
        assert!(reassembler.stop().is_empty());
    }

    #[test]
    fn test_end_heap_with_data_is_emitted() {
        let mut reassembler = Reassembler::new(ReassemblerConfig::default());
        let mut end = data_heap(5, 4);
        end.add_end();
        let events = reassembler.insert_packet(packets_of(&end, 10)[0].clone());
        assert_eq!(heaps(&events), vec![5]);
        assert!(matches!(events.last(), Some(ReassemblyEvent::EndOfStream)));
    }

    #[test]
    fn test_malformed_bytes() {
        let mut reassembler = Reassembler::new(ReassemblerConfig::default());
        assert!(reassembler.insert_bytes(&[0x53, 0x04, 3]).is_err());
        assert_eq!(reassembler.stats().packets_malformed, 1);
        assert!(!reassembler.is_stopped());
    }

    #[test]
    fn test_pointer_past_heap_end_drops_heap() {
        let flavour = Flavour::default();
        let packet = Packet {
            heap_cnt: 3,
            heap_length: 8,
            payload_offset: 0,
            payload_length: 8,
            heap_address_bits: flavour.heap_address_bits(),
            pointers: vec![
                flavour.encode_address(0x1000, 0).unwrap(),
                flavour.encode_address(0x1001, 100).unwrap(),
            ],
            payload: vec![0; 8],
        };
        let mut reassembler = Reassembler::new(ReassemblerConfig::default());
        let events = reassembler.insert_bytes(&packet.serialize().unwrap()).unwrap();
        assert!(matches!(
            events.as_slice(),
            [ReassemblyEvent::Dropped(ReassemblyError::InvalidItemPointer {
                heap_cnt: 3,
                id: 0x1001,
                ..
            })]
        ));
        assert_eq!(reassembler.heap_state(3), HeapState::Abandoned);
    }

    #[test]
    fn test_oversized_heap_is_abandoned() {
        let mut reassembler = Reassembler::new(ReassemblerConfig {
            max_heap_size: 1024,
            ..Default::default()
        });
        let mut packet = packets_of(&data_heap(7, 4), 10)[0].clone();
        packet.heap_length = (1 << 40) - 1;
        let events = reassembler.insert_packet(packet.clone());
        assert!(matches!(
            events.as_slice(),
            [ReassemblyEvent::Dropped(ReassemblyError::HeapTooLarge {
                heap_cnt: 7,
                max_heap_size: 1024,
                ..
            })]
        ));
        assert_eq!(reassembler.heap_state(7), HeapState::Abandoned);
        assert_eq!(reassembler.stats().heaps_abandoned, 1);

        // later packets of the same heap are ignored, other heaps still work
        assert!(reassembler.insert_packet(packet).is_empty());
        let events = reassembler.insert_packet(packets_of(&data_heap(8, 4), 10)[0].clone());
        assert_eq!(heaps(&events), vec![8]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut reassembler = Reassembler::new(ReassemblerConfig {
            history_len: 2,
            ..Default::default()
        });
        for cnt in 1..=3 {
            reassembler.insert_packet(packets_of(&data_heap(cnt, 4), 10)[0].clone());
        }
        assert_eq!(reassembler.heap_state(1), HeapState::Unseen);
        assert_eq!(reassembler.heap_state(3), HeapState::Complete);
    }
}
