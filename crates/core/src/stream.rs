//! Send and receive streams.
//!
//! A [`SendStream`] packetizes heaps onto a [`PacketSink`] on the caller's
//! thread. A [`RecvStream`] runs a reassembler in short turns on a
//! [`ThreadPool`] and hands completed heaps to the application through a
//! bounded ring. A full ring makes the stream stop reading, not block the
//! pool thread.
//!
//! ```text
//! PacketSource -> worker: decode -> Reassembler -> ring -> recv() / Iterator
//! ```
//!
//! Errors for a single heap (evicted, truncated, inconsistent) come out of
//! the ring as `Err` and the stream carries on. A transport failure is the
//! last thing a stream yields.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flume::{Receiver, SendTimeoutError, Sender};
use tracing::{error, info, warn};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::flavour::Flavour;
use crate::heap::{FrozenHeap, Heap};
use crate::metrics::{SendStats, StreamStats};
use crate::reassembly::{Reassembler, ReassemblyEvent};
use crate::thread_pool::{CancelToken, Spawner, ThreadPool};
use crate::transport::{PacketSink, PacketSource, Poll};

/// Sends heaps over a packet sink.
#[derive(Debug)]
pub struct SendStream<S> {
    sink: S,
    flavour: Flavour,
    max_packet_size: usize,
    stats: SendStats,
}

impl<S: PacketSink> SendStream<S> {
    /// # Errors
    /// `Error::Config` if `config` does not validate.
    pub fn new(sink: S, config: &StreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sink,
            flavour: config.flavour()?,
            max_packet_size: config.max_packet_size,
            stats: SendStats::new(),
        })
    }

    pub fn flavour(&self) -> &Flavour {
        &self.flavour
    }

    /// Packetize `heap` and hand every packet to the sink, in offset order.
    ///
    /// Blocks until the sink has accepted all of them. Packetization errors
    /// are reported before anything is sent.
    pub fn send_heap(&mut self, heap: &Heap) -> Result<()> {
        let packets = heap.packets(self.max_packet_size)?;
        for packet in packets {
            if let Err(err) = self.sink.send(&packet) {
                error!(heap_cnt = heap.cnt(), error = %err, "sink failed");
                return Err(err);
            }
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += packet.len() as u64;
        }
        self.stats.heaps_sent += 1;
        Ok(())
    }

    pub fn stats(&self) -> &SendStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Close the sink and give it back.
    pub fn close(mut self) -> Result<S> {
        self.sink.close()?;
        info!(heaps = self.stats.heaps_sent, "send stream closed");
        Ok(self.sink)
    }
}

/// Receives heaps from a packet source on a worker thread.
///
/// Iterating blocks until the next heap or error; iteration ends after end
/// of stream, a transport failure, or [`stop`](Self::stop).
#[derive(Debug)]
pub struct RecvStream {
    rx: Receiver<Result<FrozenHeap>>,
    token: CancelToken,
    stats: Arc<Mutex<StreamStats>>,
}

impl RecvStream {
    /// Start receiving from `source` on `pool`.
    ///
    /// The stream stops on its own when the source closes or an
    /// end-of-stream heap arrives, and when `pool` is dropped. Streams take
    /// turns on the pool's threads, so one thread can serve many streams.
    pub fn new<S>(pool: &ThreadPool, source: S, config: &StreamConfig) -> Result<Self>
    where
        S: PacketSource + 'static,
    {
        config.validate()?;
        let (tx, rx) = flume::bounded(config.ring_capacity);
        let token = pool.token().child();
        let stats = Arc::new(Mutex::new(StreamStats::new()));
        let worker = Worker {
            source,
            reassembler: Reassembler::new(config.reassembler()?),
            tx,
            token: token.clone(),
            pool: pool.spawner()?,
            stats: Arc::clone(&stats),
            poll_interval: config.poll_interval(),
            backlog: VecDeque::new(),
            ended: false,
        };
        info!("receive stream started");
        worker.schedule()?;
        Ok(Self { rx, token, stats })
    }

    /// Next heap or per-heap error; `None` once the stream is over.
    pub fn recv(&self) -> Option<Result<FrozenHeap>> {
        self.rx.recv().ok()
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<FrozenHeap>> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Ask the worker to stop. Partial heaps are flushed as truncated and
    /// can still be read; after them the iterator ends.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Snapshot of the worker's statistics.
    pub fn stats(&self) -> StreamStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Iterator for RecvStream {
    type Item = Result<FrozenHeap>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Drop for RecvStream {
    fn drop(&mut self) {
        // the worker winds down on its next turn
        self.token.cancel();
    }
}

/// Packets read in one turn before the thread goes back to the pool.
const PACKETS_PER_TURN: usize = 64;

struct Worker<S> {
    source: S,
    reassembler: Reassembler,
    tx: Sender<Result<FrozenHeap>>,
    token: CancelToken,
    pool: Spawner,
    stats: Arc<Mutex<StreamStats>>,
    poll_interval: Duration,
    /// Results waiting for room in the ring
    backlog: VecDeque<Result<FrozenHeap>>,
    /// Nothing more will be read from the source
    ended: bool,
}

impl<S: PacketSource + 'static> Worker<S> {
    fn schedule(self) -> Result<()> {
        let pool = self.pool.clone();
        pool.spawn(move || self.turn())
    }

    /// Flush what is waiting, read a batch of packets, then queue the next
    /// turn unless the stream is over.
    fn turn(mut self) {
        if self.token.is_cancelled() && !self.ended {
            info!("receive stream stopped");
            self.end();
        }
        if !self.ended && self.backlog.is_empty() {
            self.read_batch();
        }
        let open = self.flush();
        self.publish_stats();

        // a pool going away takes no more turns; whatever the ring cannot
        // hold by now is lost
        let over = !open || (self.ended && self.backlog.is_empty()) || self.pool.is_shutting_down();
        if over {
            self.reassembler.stats_mut().complete();
            self.publish_stats();
            return;
        }
        if let Err(err) = self.schedule() {
            warn!(error = %err, "receive stream lost its pool");
        }
    }

    fn read_batch(&mut self) {
        let mut timeout = self.poll_interval;
        for _ in 0..PACKETS_PER_TURN {
            match self.source.receive(timeout) {
                Ok(Poll::Packet(bytes)) => {
                    // malformed packets are counted and logged by the reassembler
                    if let Ok(events) = self.reassembler.insert_bytes(&bytes) {
                        self.queue(events);
                    }
                }
                Ok(Poll::Pending) => return,
                Ok(Poll::Closed) => {
                    info!("packet source closed");
                    self.end();
                    return;
                }
                Err(err) => {
                    error!(error = %err, "packet source failed");
                    self.end();
                    self.backlog.push_back(Err(err));
                    return;
                }
            }
            if self.ended || !self.backlog.is_empty() {
                return;
            }
            // only the first read of a turn waits
            timeout = Duration::ZERO;
        }
    }

    /// Stop the reassembler and queue what it flushes.
    fn end(&mut self) {
        let events = self.reassembler.stop();
        self.queue(events);
        self.ended = true;
    }

    fn queue(&mut self, events: Vec<ReassemblyEvent>) {
        for event in events {
            match event {
                ReassemblyEvent::Heap(heap) => self.backlog.push_back(Ok(heap)),
                ReassemblyEvent::Dropped(err) => self.backlog.push_back(Err(Error::from(err))),
                ReassemblyEvent::EndOfStream => self.ended = true,
            }
        }
    }

    /// Move the backlog into the ring, waiting at most one poll interval for
    /// room. False once the application has gone away.
    fn flush(&mut self) -> bool {
        while let Some(item) = self.backlog.pop_front() {
            match self.tx.send_timeout(item, self.poll_interval) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(item)) => {
                    self.backlog.push_front(item);
                    break;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
        true
    }

    fn publish_stats(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats = self.reassembler.stats().clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel, BufferSource, BytesSink};

    fn config() -> StreamConfig {
        StreamConfig {
            max_packet_size: 100,
            poll_interval_ms: 1,
            ..Default::default()
        }
    }

    fn data_heap(cnt: u64) -> Heap {
        let mut heap = Heap::new(cnt, Flavour::default());
        heap.add_item(0x1000, vec![cnt as u8; 150], false);
        heap
    }

    #[test]
    fn test_buffer_passthrough() {
        let mut send = SendStream::new(BytesSink::new(), &config()).unwrap();
        send.send_heap(&data_heap(1)).unwrap();
        send.send_heap(&data_heap(2)).unwrap();
        let mut end = Heap::new(3, Flavour::default());
        end.add_end();
        send.send_heap(&end).unwrap();
        assert_eq!(send.stats().heaps_sent, 3);
        assert!(send.stats().packets_sent > 3);
        let sink = send.close().unwrap();

        let pool = ThreadPool::new("recv", 1).unwrap();
        let recv = RecvStream::new(&pool, BufferSource::from(sink), &config()).unwrap();
        let cnts: Vec<u64> = recv.map(|heap| heap.unwrap().cnt()).collect();
        assert_eq!(cnts, vec![1, 2]);
    }

    #[test]
    fn test_source_close_truncates() {
        let mut sink = BytesSink::new();
        let first = data_heap(1).packets(100).unwrap().next().unwrap();
        sink.send(&first).unwrap();

        let pool = ThreadPool::new("recv", 1).unwrap();
        let recv = RecvStream::new(&pool, BufferSource::from(sink), &config()).unwrap();
        let results: Vec<_> = recv.collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            &results[0],
            Err(Error::Reassembly(crate::error::ReassemblyError::TruncatedHeap { heap_cnt: 1, .. }))
        ));
    }

    #[test]
    fn test_stop_ends_iteration() {
        let (mut sink, source) = channel(16);
        let pool = ThreadPool::new("recv", 1).unwrap();
        let mut recv = RecvStream::new(&pool, source, &config()).unwrap();

        let packets: Vec<_> = data_heap(1).packets(100).unwrap().collect();
        sink.send(&packets[0]).unwrap();
        assert!(recv.recv_timeout(Duration::from_millis(20)).is_none());

        recv.stop();
        assert!(matches!(recv.next(), Some(Err(Error::Reassembly(_)))));
        assert!(recv.next().is_none());
        assert_eq!(recv.stats().heaps_truncated, 1);
        assert!(recv.stats().end_time.is_some());
    }

    #[test]
    fn test_streams_share_one_thread() {
        let pool = ThreadPool::new("shared", 1).unwrap();
        let (_idle_sink, idle_source) = channel(16);
        let (mut busy_sink, busy_source) = channel(16);
        let idle = RecvStream::new(&pool, idle_source, &config()).unwrap();
        let busy = RecvStream::new(&pool, busy_source, &config()).unwrap();

        for packet in data_heap(4).packets(100).unwrap() {
            busy_sink.send(&packet).unwrap();
        }
        let heap = busy.recv_timeout(Duration::from_secs(5));
        assert_eq!(heap.map(|heap| heap.unwrap().cnt()), Some(4));
        assert!(idle.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_full_ring_does_not_block_other_streams() {
        let config = StreamConfig {
            ring_capacity: 1,
            ..config()
        };
        let pool = ThreadPool::new("backlog", 1).unwrap();
        let (mut slow_sink, slow_source) = channel(64);
        let (mut fast_sink, fast_source) = channel(64);
        let slow = RecvStream::new(&pool, slow_source, &config).unwrap();
        let fast = RecvStream::new(&pool, fast_source, &config).unwrap();

        // more heaps than the slow stream's ring holds, and nobody reading
        for cnt in 1..=4 {
            for packet in data_heap(cnt).packets(100).unwrap() {
                slow_sink.send(&packet).unwrap();
            }
        }
        for packet in data_heap(9).packets(100).unwrap() {
            fast_sink.send(&packet).unwrap();
        }
        let heap = fast.recv_timeout(Duration::from_secs(5));
        assert_eq!(heap.map(|heap| heap.unwrap().cnt()), Some(9));

        let cnts: Vec<u64> = (0..4)
            .filter_map(|_| slow.recv_timeout(Duration::from_secs(5)))
            .map(|heap| heap.unwrap().cnt())
            .collect();
        assert_eq!(cnts, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_drop_releases_worker() {
        let (_sink, source) = channel(1);
        let pool = ThreadPool::new("recv", 1).unwrap();
        let recv = RecvStream::new(&pool, source, &config()).unwrap();
        drop(recv);
        // joins the worker; hangs if the stream leaked it
        drop(pool);
    }
}
