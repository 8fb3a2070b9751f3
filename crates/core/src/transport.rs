//! Transport contract and in-memory transports.
//!
//! The engine never touches sockets. A send stream hands each wire packet
//! to a [`PacketSink`]; a receive stream polls a [`PacketSource`].
//!
//! - [`BytesSink`] / [`BufferSource`]: packets concatenated in one buffer
//! - [`channel`]: bounded datagram channel between threads
//!
//! The simulated lossy link lives in [`crate::network`].

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

use crate::error::{Result, TransportError};
use crate::packet::decode_packet;

/// Outcome of polling a [`PacketSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    /// One wire packet
    Packet(Vec<u8>),
    /// Nothing arrived within the timeout
    Pending,
    /// No packet will ever arrive again
    Closed,
}

/// Destination for wire packets.
pub trait PacketSink: Send {
    /// Send one packet, blocking until the transport accepted it.
    fn send(&mut self, packet: &[u8]) -> Result<()>;

    /// Signal that nothing more will be sent.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Origin of wire packets.
pub trait PacketSource: Send {
    /// Wait up to `timeout` for the next packet.
    fn receive(&mut self, timeout: Duration) -> Result<Poll>;
}

impl<T: PacketSink + ?Sized> PacketSink for Box<T> {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        (**self).send(packet)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

impl<T: PacketSource + ?Sized> PacketSource for Box<T> {
    fn receive(&mut self, timeout: Duration) -> Result<Poll> {
        (**self).receive(timeout)
    }
}

/// Sink that appends every packet to a byte buffer.
#[derive(Debug, Default, Clone)]
pub struct BytesSink {
    buffer: Vec<u8>,
    packets: usize,
}

impl BytesSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn packet_count(&self) -> usize {
        self.packets
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl PacketSink for BytesSink {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(packet);
        self.packets += 1;
        Ok(())
    }
}

/// Source that splits a buffer of concatenated packets.
///
/// Packet boundaries come from the packet headers. Once a packet fails to
/// decode the boundary of the next one is unknown, so the rest of the buffer
/// is handed out as a single (malformed) packet and the source closes.
#[derive(Debug, Clone)]
pub struct BufferSource {
    buffer: Vec<u8>,
    pos: usize,
}

impl BufferSource {
    pub fn new(buffer: Vec<u8>) -> Self {
        Self { buffer, pos: 0 }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.pos
    }
}

impl PacketSource for BufferSource {
    fn receive(&mut self, _timeout: Duration) -> Result<Poll> {
        let rest = &self.buffer[self.pos..];
        if rest.is_empty() {
            return Ok(Poll::Closed);
        }
        let used = match decode_packet(rest) {
            Ok((_, used)) => used,
            Err(_) => rest.len(),
        };
        let packet = rest[..used].to_vec();
        self.pos += used;
        Ok(Poll::Packet(packet))
    }
}

impl From<BytesSink> for BufferSource {
    fn from(sink: BytesSink) -> Self {
        Self::new(sink.into_inner())
    }
}

/// Sending half of [`channel`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Option<Sender<Vec<u8>>>,
}

/// Receiving half of [`channel`].
#[derive(Debug)]
pub struct ChannelSource {
    rx: Receiver<Vec<u8>>,
}

/// Bounded datagram channel holding up to `capacity` packets in flight.
///
/// The source reports [`Poll::Closed`] once every sink is closed or dropped
/// and the queue is drained.
pub fn channel(capacity: usize) -> (ChannelSink, ChannelSource) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    (ChannelSink { tx: Some(tx) }, ChannelSource { rx })
}

impl PacketSink for ChannelSink {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(packet.to_vec())
            .map_err(|_| TransportError::Closed.into())
    }

    fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

impl PacketSource for ChannelSource {
    fn receive(&mut self, timeout: Duration) -> Result<Poll> {
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => Ok(Poll::Packet(packet)),
            Err(RecvTimeoutError::Timeout) => Ok(Poll::Pending),
            Err(RecvTimeoutError::Disconnected) => Ok(Poll::Closed),
        }
    }
}
