//! Stream configuration.
//!
//! Everything a send or receive stream needs besides its transport. Loaded
//! from TOML by the binary, so every field has a default.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::flavour::{BugCompat, Flavour, DEFAULT_HEAP_ADDRESS_BITS};
use crate::packet::packet_size;
use crate::reassembly::{
    ReassemblerConfig, DEFAULT_HISTORY_LEN, DEFAULT_MAX_HEAPS, DEFAULT_MAX_HEAP_SIZE,
};

/// Largest UDP payload on a standard 1500-byte Ethernet MTU.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1472;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Upper bound on a wire packet, header and pointers included
    pub max_packet_size: usize,

    /// Width of heap addresses and immediates, in bits
    pub heap_address_bits: u32,

    /// Bug-compat flag names, see [`BugCompat::from_config_name`]
    pub bug_compat: Vec<String>,

    /// Partial heaps a receiver holds before evicting the oldest
    pub max_heaps: usize,

    /// Completed heaps buffered between receive worker and application
    pub ring_capacity: usize,

    /// Finished heap cnts remembered so late packets are ignored
    pub history_len: usize,

    /// Largest heap, in payload bytes, a receiver will buffer
    pub max_heap_size: u64,

    /// How long the receive worker waits on its source before checking for
    /// cancellation
    pub poll_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            heap_address_bits: DEFAULT_HEAP_ADDRESS_BITS,
            bug_compat: Vec::new(),
            max_heaps: DEFAULT_MAX_HEAPS,
            ring_capacity: 4,
            history_len: DEFAULT_HISTORY_LEN,
            max_heap_size: DEFAULT_MAX_HEAP_SIZE,
            poll_interval_ms: 10,
        }
    }
}

impl StreamConfig {
    pub fn bug_compat(&self) -> Result<BugCompat> {
        self.bug_compat.iter().try_fold(BugCompat::empty(), |acc, name| {
            BugCompat::from_config_name(name)
                .map(|flag| acc | flag)
                .ok_or_else(|| Error::Config(format!("unknown bug-compat flag {name:?}")))
        })
    }

    pub fn flavour(&self) -> Result<Flavour> {
        Flavour::new(self.heap_address_bits, self.bug_compat()?)
    }

    pub fn reassembler(&self) -> Result<ReassemblerConfig> {
        Ok(ReassemblerConfig {
            max_heaps: self.max_heaps,
            bug_compat: self.bug_compat()?,
            history_len: self.history_len,
            max_heap_size: self.max_heap_size,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings no stream can run with.
    pub fn validate(&self) -> Result<()> {
        self.flavour()?;
        let smallest = packet_size(0, 1);
        if self.max_packet_size < smallest {
            return Err(Error::Config(format!(
                "max_packet_size {} is below the {smallest}-byte minimum",
                self.max_packet_size
            )));
        }
        if self.max_heaps == 0 {
            return Err(Error::Config("max_heaps must be at least 1".into()));
        }
        if self.max_heap_size == 0 {
            return Err(Error::Config("max_heap_size must be at least 1".into()));
        }
        if self.ring_capacity == 0 {
            return Err(Error::Config("ring_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StreamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.flavour().unwrap(), Flavour::default());
    }

    #[test]
    fn test_bug_compat_names() {
        let config = StreamConfig {
            bug_compat: vec!["swap-endian".into(), "SHAPE_BIT_1".into()],
            ..Default::default()
        };
        assert_eq!(
            config.bug_compat().unwrap(),
            BugCompat::SWAP_ENDIAN | BugCompat::SHAPE_BIT_1
        );

        let config = StreamConfig {
            bug_compat: vec!["nonsense".into()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_settings() {
        let tiny = StreamConfig {
            max_packet_size: 16,
            ..Default::default()
        };
        assert!(tiny.validate().is_err());
        let odd = StreamConfig {
            heap_address_bits: 41,
            ..Default::default()
        };
        assert!(odd.validate().is_err());
        let no_ring = StreamConfig {
            ring_capacity: 0,
            ..Default::default()
        };
        assert!(no_ring.validate().is_err());
        let no_heaps = StreamConfig {
            max_heap_size: 0,
            ..Default::default()
        };
        assert!(no_heaps.validate().is_err());
    }
}
