//! Simulated datagram link with latency, jitter, loss and duplication.
//!
//! SPEAD assumes an unreliable datagram transport, so the receive path has to
//! cope with packets that arrive late, out of order, twice or not at all.
//! [`NetworkSimulator`] produces exactly those conditions from a seed, which
//! makes every lossy run replayable.
//!
//! Each packet handed to [`NetworkSimulator::send`] is either dropped or
//! scheduled for `base_latency_ms +/- jitter_ms`. A scheduled packet may get a
//! second copy with its own delay. Differing delays reorder packets.
//!
//! Scheduled packets sit in a min-heap keyed by delivery instant; `seq` keeps
//! send order among equal instants. [`link`] shares one simulator between a
//! [`PacketSink`] and a [`PacketSource`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use crate::error::{Result, TransportError};
use crate::transport::{PacketSink, PacketSource, Poll};

/// Impairments applied by [`NetworkSimulator`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Delay every packet gets, in ms
    pub base_latency_ms: u64,

    /// Uniform spread around the base delay, in ms
    pub jitter_ms: u64,

    /// Chance a packet is dropped
    pub loss_rate: f64,

    /// Probability that a delivered packet arrives twice [0.0, 1.0]
    pub duplicate_rate: f64,

    pub seed: u64,
}

impl NetworkConfig {
    /// No delay, no loss, no copies.
    pub fn perfect(seed: u64) -> Self {
        Self {
            base_latency_ms: 0,
            jitter_ms: 0,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            seed,
        }
    }

    /// A mildly lossy LAN.
    pub fn default_with_seed(seed: u64) -> Self {
        Self {
            base_latency_ms: 5,
            jitter_ms: 4,
            loss_rate: 0.01,
            duplicate_rate: 0.02,
            seed,
        }
    }

    /// Check that rates are probabilities.
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [("loss_rate", self.loss_rate), ("duplicate_rate", self.duplicate_rate)] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(crate::Error::Config(format!("{name} must be in [0, 1], got {rate}")));
            }
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::perfect(0)
    }
}

/// One datagram waiting in the delivery queue.
#[derive(Debug, Clone)]
struct ScheduledPacket {
    packet: Vec<u8>,
    delivery_time: Instant,
    seq: u64,
}

impl PartialEq for ScheduledPacket {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledPacket {}

impl PartialOrd for ScheduledPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; the earliest delivery must compare greatest
        other
            .delivery_time
            .cmp(&self.delivery_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Seeded lossy datagram channel. Single-threaded; [`link`] wraps it in a mutex.
#[derive(Debug)]
pub struct NetworkSimulator {
    config: NetworkConfig,
    rng: ChaCha8Rng,
    queue: BinaryHeap<ScheduledPacket>,
    next_seq: u64,

    packets_sent: u64,
    packets_dropped: u64,
    packets_duplicated: u64,
    packets_delivered: u64,
}

impl NetworkSimulator {
    pub fn new(config: NetworkConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);

        Self {
            config,
            rng,
            queue: BinaryHeap::new(),
            next_seq: 0,
            packets_sent: 0,
            packets_dropped: 0,
            packets_duplicated: 0,
            packets_delivered: 0,
        }
    }

    /// Drop, copy or schedule `packet` according to the config.
    pub fn send(&mut self, packet: Vec<u8>) {
        self.packets_sent += 1;

        if self.config.loss_rate > 0.0 && self.rng.gen::<f64>() < self.config.loss_rate {
            self.packets_dropped += 1;
            return;
        }

        if self.config.duplicate_rate > 0.0 && self.rng.gen::<f64>() < self.config.duplicate_rate {
            self.packets_duplicated += 1;
            self.schedule(packet.clone());
        }
        self.schedule(packet);
    }

    fn schedule(&mut self, packet: Vec<u8>) {
        let delay_ms = self.compute_delay();
        self.queue.push(ScheduledPacket {
            packet,
            delivery_time: Instant::now() + Duration::from_millis(delay_ms),
            seq: self.next_seq,
        });
        self.next_seq += 1;
    }

    /// The next packet whose delivery time has passed, if any.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        let ready = self
            .queue
            .peek()
            .is_some_and(|scheduled| Instant::now() >= scheduled.delivery_time);
        if !ready {
            return None;
        }
        let scheduled = self.queue.pop()?;
        self.packets_delivered += 1;
        Some(scheduled.packet)
    }

    /// Time until the next packet is due, if any is queued.
    pub fn next_delivery(&self) -> Option<Duration> {
        self.queue
            .peek()
            .map(|scheduled| scheduled.delivery_time.saturating_duration_since(Instant::now()))
    }

    /// Receive a packet, waiting up to the specified duration.
    ///
    /// Sleeps until the next delivery time rather than spinning.
    pub fn recv_wait(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(packet) = self.recv() {
                return Some(packet);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = self.next_delivery()?.min(deadline - now);
            std::thread::sleep(wait.max(Duration::from_micros(100)));
        }
    }

    /// Drain all remaining packets immediately, in delivery order.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut packets = Vec::with_capacity(self.queue.len());
        while let Some(scheduled) = self.queue.pop() {
            packets.push(scheduled.packet);
            self.packets_delivered += 1;
        }
        packets
    }

    /// Get statistics about network behavior.
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            packets_sent: self.packets_sent,
            packets_dropped: self.packets_dropped,
            packets_duplicated: self.packets_duplicated,
            packets_delivered: self.packets_delivered,
            packets_in_flight: self.queue.len(),
        }
    }

    /// Delay = base_latency ± jitter, in milliseconds.
    fn compute_delay(&mut self) -> u64 {
        let base = self.config.base_latency_ms;

        if self.config.jitter_ms == 0 {
            return base;
        }

        let jitter_range = self.config.jitter_ms * 2;
        let jitter = self.rng.gen_range(0..=jitter_range);
        let jitter_offset = jitter as i64 - self.config.jitter_ms as i64;

        (base as i64 + jitter_offset).max(0) as u64
    }
}

/// Statistics about network simulator behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStats {
    /// Total packets sent into the simulator
    pub packets_sent: u64,

    /// Packets dropped due to loss
    pub packets_dropped: u64,

    /// Extra copies scheduled
    pub packets_duplicated: u64,

    /// Packets (copies included) handed to the receiver
    pub packets_delivered: u64,

    /// Packets currently in flight
    pub packets_in_flight: usize,
}

impl NetworkStats {
    /// Compute packet loss rate.
    pub fn loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_dropped as f64 / self.packets_sent as f64
        }
    }

    /// Compute delivery rate (delivered / sent); above 1.0 with duplication.
    pub fn delivery_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_delivered as f64 / self.packets_sent as f64
        }
    }
}

#[derive(Debug)]
struct Link {
    sim: NetworkSimulator,
    closed: bool,
}

fn lock(link: &Mutex<Link>) -> Result<MutexGuard<'_, Link>> {
    link.lock().map_err(|_| TransportError::Closed.into())
}

/// Sending end of a simulated link. Dropping it closes the link.
#[derive(Debug)]
pub struct SimulatedSink {
    link: Arc<Mutex<Link>>,
}

/// Receiving end of a simulated link.
#[derive(Debug)]
pub struct SimulatedSource {
    link: Arc<Mutex<Link>>,
}

/// Create a simulated link.
///
/// The source reports [`Poll::Closed`] after the sink is closed and every
/// packet still in flight has been delivered.
pub fn link(config: NetworkConfig) -> (SimulatedSink, SimulatedSource) {
    let link = Arc::new(Mutex::new(Link {
        sim: NetworkSimulator::new(config),
        closed: false,
    }));
    (
        SimulatedSink {
            link: Arc::clone(&link),
        },
        SimulatedSource { link },
    )
}

impl SimulatedSink {
    pub fn stats(&self) -> Result<NetworkStats> {
        Ok(lock(&self.link)?.sim.stats())
    }
}

impl SimulatedSource {
    pub fn stats(&self) -> Result<NetworkStats> {
        Ok(lock(&self.link)?.sim.stats())
    }
}

impl PacketSink for SimulatedSink {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        let mut link = lock(&self.link)?;
        if link.closed {
            return Err(TransportError::Closed.into());
        }
        link.sim.send(packet.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        lock(&self.link)?.closed = true;
        Ok(())
    }
}

impl Drop for SimulatedSink {
    fn drop(&mut self) {
        if let Ok(mut link) = self.link.lock() {
            link.closed = true;
        }
    }
}

impl PacketSource for SimulatedSource {
    fn receive(&mut self, timeout: Duration) -> Result<Poll> {
        let deadline = Instant::now() + timeout;
        loop {
            // never sleep while holding the lock; the sender needs it
            let wait = {
                let mut link = lock(&self.link)?;
                if let Some(packet) = link.sim.recv() {
                    return Ok(Poll::Packet(packet));
                }
                match link.sim.next_delivery() {
                    Some(wait) => wait,
                    None if link.closed => return Ok(Poll::Closed),
                    None => Duration::from_millis(1),
                }
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(Poll::Pending);
            }
            std::thread::sleep(wait.min(deadline - now).max(Duration::from_micros(100)));
        }
    }
}
