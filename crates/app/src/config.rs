//! Configuration for the spead-sim application.
//!
//! Settings come from three layers, later ones winning:
//! 1. Defaults, with network impairments drawn from the seed
//! 2. An optional TOML file (`--config`)
//! 3. Command-line flags
//!
//! The tool works with zero arguments. The resolved configuration can be
//! printed so any run can be reproduced.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use spead_core::{network::NetworkConfig, StreamConfig};

/// Send item groups over a simulated lossy link and verify what arrives.
#[derive(Debug, Parser)]
#[command(name = "spead-sim", version)]
pub struct Cli {
    /// TOML file with `[stream]` and `[network]` tables
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Random seed for determinism (default: time based)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of data heaps to send
    #[arg(long)]
    pub heaps: Option<usize>,

    /// Resend every descriptor after this many heaps
    #[arg(long)]
    pub descriptor_interval: Option<usize>,

    /// Largest packet in bytes, header included
    #[arg(long)]
    pub max_packet_size: Option<usize>,

    /// Heap address width in bits (40 or 48 for legacy peers)
    #[arg(long)]
    pub heap_address_bits: Option<u32>,

    /// Bug-compat flag, repeatable (e.g. `pyspead`, `swap-endian`)
    #[arg(long = "bug-compat")]
    pub bug_compat: Vec<String>,

    /// Partial heaps held by the receiver
    #[arg(long)]
    pub max_heaps: Option<usize>,

    /// Base network latency in milliseconds
    #[arg(long)]
    pub latency: Option<u64>,

    /// Latency jitter in milliseconds
    #[arg(long)]
    pub jitter: Option<u64>,

    /// Packet loss rate 0.0-1.0
    #[arg(long)]
    pub loss: Option<f64>,

    /// Disable packet loss (same as --loss 0)
    #[arg(long, conflicts_with = "loss")]
    pub no_loss: bool,

    /// Packet duplication rate 0.0-1.0
    #[arg(long)]
    pub duplicate: Option<f64>,

    /// Print resolved configuration
    #[arg(long)]
    pub print_config: bool,

    /// Don't print statistics
    #[arg(long)]
    pub no_metrics: bool,
}

/// Layout of the TOML file. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    seed: Option<u64>,
    heaps: Option<usize>,
    descriptor_interval: Option<usize>,
    stream: Option<StreamConfig>,
    network: Option<NetworkConfig>,
}

/// Complete configuration for a run.
#[derive(Debug, Clone)]
pub struct Config {
    pub seed: u64,

    // === Sender ===
    pub heaps: usize,
    pub descriptor_interval: usize,

    // === Streams ===
    pub stream: StreamConfig,

    // === Network ===
    pub network: NetworkConfig,

    // === Behavior ===
    pub print_config: bool,
    pub print_metrics: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    fn resolve(cli: Cli, file: FileConfig) -> Result<Self> {
        let seed = cli.seed.or(file.seed).unwrap_or_else(time_seed);

        let mut stream = file.stream.unwrap_or_default();
        if let Some(size) = cli.max_packet_size {
            stream.max_packet_size = size;
        }
        if let Some(bits) = cli.heap_address_bits {
            stream.heap_address_bits = bits;
        }
        if !cli.bug_compat.is_empty() {
            stream.bug_compat = cli.bug_compat;
        }
        if let Some(max_heaps) = cli.max_heaps {
            stream.max_heaps = max_heaps;
        }

        let mut network = file.network.unwrap_or_else(|| random_network(seed));
        network.seed = seed;
        if let Some(latency) = cli.latency {
            network.base_latency_ms = latency;
        }
        if let Some(jitter) = cli.jitter {
            network.jitter_ms = jitter;
        }
        if let Some(loss) = cli.loss {
            network.loss_rate = loss;
        }
        if cli.no_loss {
            network.loss_rate = 0.0;
        }
        if let Some(duplicate) = cli.duplicate {
            network.duplicate_rate = duplicate;
        }

        stream.validate()?;
        network.validate()?;

        Ok(Self {
            seed,
            heaps: cli.heaps.or(file.heaps).unwrap_or(50),
            descriptor_interval: cli.descriptor_interval.or(file.descriptor_interval).unwrap_or(8).max(1),
            stream,
            network,
            print_config: cli.print_config,
            print_metrics: !cli.no_metrics,
        })
    }

    /// Print the configuration in human-readable form.
    pub fn print(&self) {
        println!("=== Configuration ===");
        println!("Seed: {}", self.seed);
        println!("Heaps: {}", self.heaps);
        println!("Descriptor interval: {} heaps", self.descriptor_interval);
        println!();
        println!("=== Stream ===");
        println!("Max packet size: {} bytes", self.stream.max_packet_size);
        println!("Heap address bits: {}", self.stream.heap_address_bits);
        println!("Bug compat: {:?}", self.stream.bug_compat);
        println!("Max partial heaps: {}", self.stream.max_heaps);
        println!("Max heap size: {} bytes", self.stream.max_heap_size);
        println!("Ring capacity: {}", self.stream.ring_capacity);
        println!();
        println!("=== Network Simulation ===");
        println!("Base latency: {} ms", self.network.base_latency_ms);
        println!("Jitter: ±{} ms", self.network.jitter_ms);
        println!("Loss rate: {:.2}%", self.network.loss_rate * 100.0);
        println!("Duplicate rate: {:.2}%", self.network.duplicate_rate * 100.0);
        println!();
    }
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Moderate impairments drawn from the seed.
fn random_network(seed: u64) -> NetworkConfig {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    // Bias toward small rates
    let mut small_rate = |max: f64| {
        let r: f64 = rng.gen();
        (r * r * max).min(max)
    };
    let loss_rate = small_rate(0.02);
    let duplicate_rate = small_rate(0.05);
    NetworkConfig {
        base_latency_ms: rng.gen_range(0..=5),
        jitter_ms: rng.gen_range(0..=3),
        loss_rate,
        duplicate_rate,
        seed,
    }
}
