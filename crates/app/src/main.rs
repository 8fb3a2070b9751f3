//! spead-sim: send an evolving item group over a simulated lossy link and
//! check every heap that arrives against what the sender had at that step.
//!
//! ```text
//! sender thread: ItemGroup -> HeapGenerator -> SendStream -> SimulatedSink
//!                                                                 |
//! main thread:   verify <- ItemGroup::update <- RecvStream <- SimulatedSource
//! ```

mod config;
mod input_gen;

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use spead_core::{
    metrics::SendStats,
    network::{link, NetworkStats, SimulatedSink},
    value::Value,
    HeapGenerator, ItemGroup, RecvStream, Selection, SendStream, ThreadPool,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Cli, Config};

#[derive(Debug, Default)]
struct Verification {
    heaps: u64,
    verified_items: u64,
    mismatched_items: u64,
    /// Items that arrived before their descriptor
    undecodable_items: u64,
    lost_heaps: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns false if any received item disagreed with what was sent.
fn run() -> Result<bool> {
    let config = Config::from_cli(Cli::parse())?;
    if config.print_config {
        config.print();
    }
    info!(seed = config.seed, heaps = config.heaps, "starting simulation");

    let pool = ThreadPool::new("spead-recv", 1)?;
    let (sink, source) = link(config.network);
    let mut recv = RecvStream::new(&pool, source, &config.stream)?;

    let sender = {
        let config = config.clone();
        thread::Builder::new()
            .name("spead-send".into())
            .spawn(move || send_all(&config, sink))
            .context("spawning sender")?
    };

    let mut received = ItemGroup::new();
    let mut verification = Verification::default();
    for result in recv.by_ref() {
        match result {
            Ok(heap) => {
                verification.heaps += 1;
                let report = received.update(&heap);
                verification.undecodable_items += report.errors.len() as u64;
                verify(&received, &report.values, config.seed, &mut verification)?;
            }
            Err(err) if !err.is_fatal() => {
                warn!(error = %err, "heap lost");
                verification.lost_heaps += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }

    let (send_stats, network_stats) = sender
        .join()
        .map_err(|_| anyhow!("sender thread panicked"))??;

    if config.print_metrics {
        print!("{}", send_stats.summary());
        print_network(&network_stats);
        print!("{}", recv.stats().summary());
        print_verification(&verification);
    }
    Ok(verification.mismatched_items == 0)
}

fn send_all(config: &Config, sink: SimulatedSink) -> Result<(SendStats, NetworkStats)> {
    let mut group = input_gen::sample_group(config.seed)?;
    let mut generator = HeapGenerator::new(config.stream.flavour()?);
    let mut send = SendStream::new(sink, &config.stream)?;

    send.send_heap(&generator.get_start()?)?;
    for step in 0..config.heaps {
        input_gen::apply_step(&mut group, config.seed, step as u32)?;
        let descriptors = if step % config.descriptor_interval == 0 {
            Selection::All
        } else {
            Selection::Stale
        };
        // every value every time: a lost heap must not leave stale items behind
        let heap = generator.get_heap_with(&group, descriptors, Selection::All)?;
        send.send_heap(&heap)?;
    }

    // let everything in flight land before the end marker overtakes it
    let settle = config.network.base_latency_ms + config.network.jitter_ms + 5;
    thread::sleep(Duration::from_millis(settle));
    send.send_heap(&generator.get_end()?)?;

    let stats = send.stats().clone();
    let network = send.sink().stats()?;
    send.close()?;
    info!(heaps = stats.heaps_sent, packets = stats.packets_sent, "sender done");
    Ok((stats, network))
}

/// Compare the items a heap just set with the values for its step.
fn verify(group: &ItemGroup, updated: &[u64], seed: u64, verification: &mut Verification) -> Result<()> {
    if !updated.contains(&input_gen::STEP_ID) {
        return Ok(());
    }
    let Some(step) = group
        .get(input_gen::STEP_ID)
        .and_then(|item| item.value())
        .and_then(step_of)
    else {
        return Ok(());
    };
    for (id, expected) in input_gen::values_for(seed, step)? {
        if !updated.contains(&id) {
            continue;
        }
        match group.get(id).and_then(|item| item.value()) {
            Some(value) if *value == expected => verification.verified_items += 1,
            _ => {
                warn!(id, step, "received value differs from sent value");
                verification.mismatched_items += 1;
            }
        }
    }
    Ok(())
}

fn step_of(value: &Value) -> Option<u32> {
    match value.as_array()?.data() {
        spead_core::value::ArrayData::U32(data) => data.first().copied(),
        _ => None,
    }
}

fn print_network(stats: &NetworkStats) {
    println!("=== Network ===");
    println!("Packets sent: {}", stats.packets_sent);
    println!(
        "Packets dropped: {} ({:.2}%)",
        stats.packets_dropped,
        stats.loss_rate() * 100.0
    );
    println!("Packets duplicated: {}", stats.packets_duplicated);
    println!("Packets delivered: {}", stats.packets_delivered);
}

fn print_verification(verification: &Verification) {
    println!("=== Verification ===");
    println!("Heaps received: {}", verification.heaps);
    println!("Heaps lost: {}", verification.lost_heaps);
    println!("Items verified: {}", verification.verified_items);
    println!("Items mismatched: {}", verification.mismatched_items);
    println!("Items without descriptor: {}", verification.undecodable_items);
}
