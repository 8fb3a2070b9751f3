//! Stream statistics.
//!
//! - [`StreamStats`]: what a receiver saw (packets, heaps, bytes)
//! - [`SendStats`]: what a sender handed to its transport
//!
//! # Thread Safety
//!
//! Neither struct is shared. The receive worker owns its `StreamStats` and
//! publishes copies; callers get a snapshot, not a live view.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Receive-side statistics.
#[derive(Debug, Clone)]
pub struct StreamStats {
    // === Timing ===
    /// When the stream started
    pub start_time: Instant,

    /// When the stream stopped
    pub end_time: Option<Instant>,

    // === Packets ===
    /// Packets handed to the reassembler
    pub packets_received: u64,

    /// Packets that failed to decode
    pub packets_malformed: u64,

    /// Packets whose payload was already covered
    pub packets_duplicate: u64,

    /// Packets that arrived behind a later slice of the same heap
    pub packets_reordered: u64,

    /// Packets for finished heaps or after end of stream
    pub packets_ignored: u64,

    /// Payload bytes copied into heaps
    pub bytes_received: u64,

    // === Heaps ===
    /// Heaps completed and handed out
    pub heaps_completed: u64,

    /// Partial heaps evicted to make room
    pub heaps_evicted: u64,

    /// Partial heaps flushed at end of stream
    pub heaps_truncated: u64,

    /// Heaps dropped for inconsistent packets or bad item pointers
    pub heaps_abandoned: u64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            end_time: None,
            packets_received: 0,
            packets_malformed: 0,
            packets_duplicate: 0,
            packets_reordered: 0,
            packets_ignored: 0,
            bytes_received: 0,
            heaps_completed: 0,
            heaps_evicted: 0,
            heaps_truncated: 0,
            heaps_abandoned: 0,
        }
    }

    /// Mark the stream as stopped.
    pub fn complete(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Instant::now());
        }
    }

    /// Total duration (or current elapsed if still running).
    pub fn duration(&self) -> Duration {
        match self.end_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// Heaps lost one way or another.
    pub fn heaps_lost(&self) -> u64 {
        self.heaps_evicted + self.heaps_truncated + self.heaps_abandoned
    }

    pub fn duplicate_rate(&self) -> f64 {
        ratio(self.packets_duplicate, self.packets_received)
    }

    pub fn reorder_rate(&self) -> f64 {
        ratio(self.packets_reordered, self.packets_received)
    }

    /// Payload bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.bytes_received as f64 / secs
        }
    }

    /// Human-readable summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Receive ===");
        let _ = writeln!(out, "Duration: {} ms", self.duration().as_millis());
        let _ = writeln!(out, "Packets received: {}", self.packets_received);
        let _ = writeln!(out, "Packets malformed: {}", self.packets_malformed);
        let _ = writeln!(
            out,
            "Packets duplicate: {} ({:.2}%)",
            self.packets_duplicate,
            self.duplicate_rate() * 100.0
        );
        let _ = writeln!(
            out,
            "Packets reordered: {} ({:.2}%)",
            self.packets_reordered,
            self.reorder_rate() * 100.0
        );
        let _ = writeln!(out, "Packets ignored: {}", self.packets_ignored);
        let _ = writeln!(out, "Heaps completed: {}", self.heaps_completed);
        let _ = writeln!(out, "Heaps evicted: {}", self.heaps_evicted);
        let _ = writeln!(out, "Heaps truncated: {}", self.heaps_truncated);
        let _ = writeln!(out, "Heaps abandoned: {}", self.heaps_abandoned);
        let _ = writeln!(
            out,
            "Throughput: {:.2} MB/s",
            self.throughput_bps() / 1_000_000.0
        );
        out
    }

    /// Export as `key=value` lines (for parsing/testing).
    pub fn export_text(&self) -> String {
        format!(
            "duration_ms={}\n\
             packets_received={}\n\
             packets_malformed={}\n\
             packets_duplicate={}\n\
             packets_reordered={}\n\
             packets_ignored={}\n\
             bytes_received={}\n\
             heaps_completed={}\n\
             heaps_evicted={}\n\
             heaps_truncated={}\n\
             heaps_abandoned={}\n",
            self.duration().as_millis(),
            self.packets_received,
            self.packets_malformed,
            self.packets_duplicate,
            self.packets_reordered,
            self.packets_ignored,
            self.bytes_received,
            self.heaps_completed,
            self.heaps_evicted,
            self.heaps_truncated,
            self.heaps_abandoned,
        )
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Send-side statistics.
#[derive(Debug, Clone)]
pub struct SendStats {
    pub start_time: Instant,
    pub heaps_sent: u64,
    pub packets_sent: u64,
    /// Wire bytes, headers included
    pub bytes_sent: u64,
}

impl SendStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            heaps_sent: 0,
            packets_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "=== Send ===\nHeaps sent: {}\nPackets sent: {}\nBytes sent: {}\n",
            self.heaps_sent, self.packets_sent, self.bytes_sent
        )
    }
}

impl Default for SendStats {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Helper for tracking reordering.
///
/// Tracks the highest payload offset seen for each heap; a packet behind it
/// arrived out of order.
#[derive(Debug, Default)]
pub struct ReorderTracker {
    last_offsets: HashMap<u64, u64>,
}

impl ReorderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet and return true if it arrived out of order.
    pub fn track(&mut self, heap_cnt: u64, payload_offset: u64) -> bool {
        let last = self.last_offsets.entry(heap_cnt).or_insert(payload_offset);
        let is_reordered = payload_offset < *last;
        if payload_offset > *last {
            *last = payload_offset;
        }
        is_reordered
    }

    /// Forget a heap (when it completes or is dropped).
    pub fn clear_heap(&mut self, heap_cnt: u64) {
        self.last_offsets.remove(&heap_cnt);
    }
}
