//! Integration tests for the full SPEAD pipeline.
//!
//! These tests verify end-to-end behavior: item group -> heaps -> packets ->
//! transport -> reassembly -> item group, with verification that the
//! received group matches the sent one.

use std::thread;
use std::time::Duration;

use spead_core::{
    descriptor::{Dim, Encoding, ItemDescriptor},
    dtype::{DType, Order},
    error::{Error, ReassemblyError},
    flavour::{BugCompat, Flavour},
    generator::{HeapGenerator, Selection},
    item::ItemGroup,
    network::{link, NetworkConfig},
    reassembly::{Reassembler, ReassemblerConfig, ReassemblyEvent},
    stream::{RecvStream, SendStream},
    thread_pool::ThreadPool,
    transport::{channel, BufferSource, BytesSink, PacketSink},
    value::{Scalar, Value},
    StreamConfig,
};

fn sample_group() -> ItemGroup {
    let mut group = ItemGroup::new();
    let add = |group: &mut ItemGroup, desc: ItemDescriptor, value: Value| {
        group.add_item(desc, Some(value)).expect("add item");
    };
    add(
        &mut group,
        ItemDescriptor::with_dtype(0x1000, "temps", "sensor grid", vec![Dim::Fixed(2), Dim::Fixed(3)], DType::u16())
            .unwrap(),
        Value::array(vec![2, 3], vec![1u16, 2, 3, 4, 5, 6]).unwrap(),
    );
    add(
        &mut group,
        ItemDescriptor::with_dtype(0x1001, "gain", "", vec![], DType::f64()).unwrap(),
        Value::array(vec![], vec![1.5f64]).unwrap(),
    );
    add(
        &mut group,
        ItemDescriptor::with_dtype(0x1002, "payload", "raw bytes", vec![Dim::Variable], DType::u8()).unwrap(),
        Value::from(vec![9u8; 40]),
    );
    add(
        &mut group,
        ItemDescriptor::with_format(0x1003, "packed", "", vec![], &[('u', 4), ('f', 64), ('i', 4)]).unwrap(),
        Value::record(vec![Scalar::UInt(12), Scalar::Float(1.5), Scalar::Int(-3)]),
    );
    add(
        &mut group,
        ItemDescriptor::new(
            0x1004,
            "matrix",
            "column major",
            vec![Dim::Fixed(2), Dim::Fixed(2)],
            Encoding::DType {
                dtype: DType::i32(),
                order: Order::F,
            },
        )
        .unwrap(),
        Value::array(vec![2, 2], vec![1i32, -2, 3, -4]).unwrap(),
    );
    add(
        &mut group,
        ItemDescriptor::with_dtype(0x1005, "flag", "", vec![], DType::u32()).unwrap(),
        Value::array(vec![], vec![7u32]).unwrap(),
    );
    group
}

fn config(heap_address_bits: u32, bug_compat: &[&str]) -> StreamConfig {
    StreamConfig {
        max_packet_size: 256,
        heap_address_bits,
        bug_compat: bug_compat.iter().map(|s| s.to_string()).collect(),
        max_heaps: 8,
        poll_interval_ms: 1,
        ..Default::default()
    }
}

/// Send start, one data heap and end; return the wire bytes.
fn send_group(group: &ItemGroup, config: &StreamConfig) -> BytesSink {
    let mut generator = HeapGenerator::new(config.flavour().unwrap());
    let mut send = SendStream::new(BytesSink::new(), config).unwrap();
    send.send_heap(&generator.get_start().unwrap()).unwrap();
    send.send_heap(&generator.get_heap(group).unwrap()).unwrap();
    send.send_heap(&generator.get_end().unwrap()).unwrap();
    send.close().unwrap()
}

/// Round trip through a byte buffer for every supported flavour.
#[test]
fn test_item_group_round_trip_all_flavours() {
    let group = sample_group();
    for (bits, compat) in [(40, vec![]), (48, vec![]), (40, vec!["pyspead"]), (48, vec!["pyspead"])] {
        let config = config(bits, &compat);
        let sink = send_group(&group, &config);

        let pool = ThreadPool::new("rt", 1).unwrap();
        let recv = RecvStream::new(&pool, BufferSource::from(sink), &config).unwrap();
        let mut received = ItemGroup::new();
        let mut heaps = 0;
        for heap in recv {
            let report = received.update(&heap.expect("heap"));
            assert!(report.is_clean(), "{bits} {compat:?}: {:?}", report.errors);
            heaps += 1;
        }
        // start heap plus data heap; the bare end marker is not a heap
        assert_eq!(heaps, 2);
        assert_eq!(received, group, "flavour {bits} {compat:?}");
    }
}

/// Send and receive concurrently over a bounded channel.
#[test]
fn test_channel_passthrough_with_updates() {
    let config = config(48, &[]);
    let (sink, source) = channel(4);
    let pool = ThreadPool::new("chan", 1).unwrap();
    let recv = RecvStream::new(&pool, source, &config).unwrap();

    let sender = {
        let config = config.clone();
        thread::spawn(move || {
            let mut group = sample_group();
            let mut generator = HeapGenerator::new(config.flavour().unwrap());
            let mut send = SendStream::new(sink, &config).unwrap();
            send.send_heap(&generator.get_heap(&group).unwrap()).unwrap();
            for i in 0..5u32 {
                group.set_value(0x1005, Value::array(vec![], vec![i]).unwrap()).unwrap();
                let heap = generator.get_heap(&group).unwrap();
                // only the changed value travels
                assert_eq!(heap.items().len(), 1);
                send.send_heap(&heap).unwrap();
            }
            send.send_heap(&generator.get_end().unwrap()).unwrap();
            group
        })
    };

    let mut received = ItemGroup::new();
    let mut heaps = 0;
    for heap in recv {
        assert!(received.update(&heap.unwrap()).is_clean());
        heaps += 1;
    }
    let sent = sender.join().unwrap();
    assert_eq!(heaps, 6);
    assert_eq!(received, sent);
}

/// Jitter reorders packets and duplicates arrive; every heap still
/// completes exactly once.
#[test]
fn test_simulated_link_reorders_and_duplicates() {
    let config = StreamConfig {
        max_heaps: 32,
        ..config(40, &[])
    };
    let (mut sink, source) = link(NetworkConfig {
        base_latency_ms: 2,
        jitter_ms: 2,
        loss_rate: 0.0,
        duplicate_rate: 0.3,
        seed: 7,
    });
    let pool = ThreadPool::new("link", 1).unwrap();
    let mut recv = RecvStream::new(&pool, source, &config).unwrap();

    let flavour = config.flavour().unwrap();
    let mut group = sample_group();
    let mut generator = HeapGenerator::new(flavour);
    for i in 0..10u32 {
        group.set_value(0x1005, Value::array(vec![], vec![i]).unwrap()).unwrap();
        // self-contained heaps: arrival order between heaps does not matter
        let heap = generator.get_heap_with(&group, Selection::All, Selection::All).unwrap();
        for packet in heap.packets(config.max_packet_size).unwrap() {
            sink.send(&packet).unwrap();
        }
    }
    thread::sleep(Duration::from_millis(30));
    drop(sink);

    let mut flags = Vec::new();
    for heap in recv.by_ref() {
        let heap = heap.expect("no heap should be lost");
        let mut g = ItemGroup::new();
        assert!(g.update(&heap).is_clean());
        let flag = g.get(0x1005).unwrap().value().unwrap().clone();
        flags.push((heap.cnt(), flag));
    }
    flags.sort_by_key(|(cnt, _)| *cnt);
    assert_eq!(flags.len(), 10);
    for (i, (_, flag)) in flags.iter().enumerate() {
        assert_eq!(flag, &Value::array(vec![], vec![i as u32]).unwrap());
    }
    let stats = recv.stats();
    assert_eq!(stats.heaps_completed, 10);
    assert!(stats.packets_duplicate + stats.packets_ignored > 0);
}

/// A lossy link loses heaps but the stream always terminates and every
/// heap it does deliver is intact.
#[test]
fn test_lossy_link_terminates() {
    let config = config(40, &[]);
    let (mut sink, source) = link(NetworkConfig {
        loss_rate: 0.2,
        ..NetworkConfig::perfect(99)
    });
    let pool = ThreadPool::new("lossy", 1).unwrap();
    let mut recv = RecvStream::new(&pool, source, &config).unwrap();

    let group = sample_group();
    let mut generator = HeapGenerator::new(config.flavour().unwrap());
    for _ in 0..20 {
        let heap = generator.get_heap_with(&group, Selection::All, Selection::All).unwrap();
        for packet in heap.packets(config.max_packet_size).unwrap() {
            sink.send(&packet).unwrap();
        }
    }
    let sent = sink.stats().unwrap();
    drop(sink);

    let mut complete = 0;
    let mut lost = 0;
    for result in recv.by_ref() {
        match result {
            Ok(heap) => {
                let mut g = ItemGroup::new();
                assert!(g.update(&heap).is_clean());
                assert_eq!(g, group);
                complete += 1;
            }
            Err(Error::Reassembly(ReassemblyError::EvictedHeap { .. }))
            | Err(Error::Reassembly(ReassemblyError::TruncatedHeap { .. })) => lost += 1,
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert!(sent.packets_dropped > 0);
    assert!(complete < 20);
    assert!(complete + lost <= 20);
    assert_eq!(recv.stats().heaps_completed, complete);
}

/// Two heaps interleaved with room for only one: the older is evicted.
#[test]
fn test_interleaved_heaps_with_one_slot() {
    let flavour = Flavour::default();
    let group = sample_group();
    let mut generator = HeapGenerator::new(flavour);
    let first: Vec<Vec<u8>> = generator.get_heap(&group).unwrap().packets(200).unwrap().collect();
    let second: Vec<Vec<u8>> = generator
        .get_heap_with(&group, Selection::None, Selection::All)
        .unwrap()
        .packets(100)
        .unwrap()
        .collect();
    assert!(first.len() > 1 && second.len() > 1);

    let mut reassembler = Reassembler::new(ReassemblerConfig {
        max_heaps: 1,
        ..Default::default()
    });
    let mut events = Vec::new();
    for (a, b) in first.iter().zip(&second) {
        events.extend(reassembler.insert_bytes(a).unwrap());
        events.extend(reassembler.insert_bytes(b).unwrap());
    }
    assert!(matches!(
        events.first(),
        Some(ReassemblyEvent::Dropped(ReassemblyError::EvictedHeap { heap_cnt: 1, max_heaps: 1, .. }))
    ));
    assert!(reassembler.stats().heaps_evicted >= 1);
}

/// Immediate threshold follows the heap address width and the legacy
/// narrow-immediate rule.
#[test]
fn test_immediate_threshold() {
    let cases = [
        (40, BugCompat::empty(), 5, true),
        (40, BugCompat::empty(), 6, false),
        (48, BugCompat::empty(), 6, true),
        (48, BugCompat::empty(), 7, false),
        (40, BugCompat::NARROW_IMMEDIATES, 5, false),
        (40, BugCompat::NARROW_IMMEDIATES, 4, true),
    ];
    for (bits, compat, len, immediate) in cases {
        let flavour = Flavour::new(bits, compat).unwrap();
        let mut group = ItemGroup::new();
        let desc = ItemDescriptor::with_dtype(0x1000, "x", "", vec![Dim::Fixed(len)], DType::u8()).unwrap();
        group.add_item(desc, Some(Value::from(vec![0xABu8; len]))).unwrap();

        let heap = HeapGenerator::new(flavour)
            .get_heap_with(&group, Selection::None, Selection::All)
            .unwrap();
        let (pointers, payload) = heap.layout().unwrap();
        let pointer = flavour.decode_pointer(pointers[0]);
        assert_eq!(pointer.is_immediate, immediate, "{bits} {compat:?} {len}");
        assert_eq!(payload.is_empty(), immediate);
    }
}

/// No heap is delivered after the end-of-stream marker.
#[test]
fn test_nothing_after_end_of_stream() {
    let config = config(40, &[]);
    let group = sample_group();
    let mut generator = HeapGenerator::new(config.flavour().unwrap());
    let mut send = SendStream::new(BytesSink::new(), &config).unwrap();
    send.send_heap(&generator.get_heap(&group).unwrap()).unwrap();
    send.send_heap(&generator.get_end().unwrap()).unwrap();

    // a heap sent after the marker by a misbehaving peer
    let mut other = HeapGenerator::new(config.flavour().unwrap());
    let late = other.get_heap_with(&group, Selection::All, Selection::All).unwrap();
    send.send_heap(&late).unwrap();
    let sink = send.close().unwrap();

    let pool = ThreadPool::new("eos", 1).unwrap();
    let recv = RecvStream::new(&pool, BufferSource::from(sink), &config).unwrap();
    let heaps: Vec<_> = recv.map(|h| h.unwrap()).collect();
    assert_eq!(heaps.len(), 1);
}
