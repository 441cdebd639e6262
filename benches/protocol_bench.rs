use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reccaster::ack_manager::calculate_backoff_ms;
use reccaster::codec::PacketCodec;
use reccaster::registry::RecordRegistry;
use reccaster::{GlobalProperties, Record, TargetId};

fn sample_records(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            Record::new(format!("DEV:BENCH:{:04}", i), "ai")
                .with_property("recordDesc", format!("Benchmark record {}", i))
                .with_property("EGU", "mA")
        })
        .collect()
}

fn globals() -> GlobalProperties {
    GlobalProperties::new()
        .with("HOSTNAME", "Example-Host-Machine")
        .with("ENGINEER", "bench")
}

fn benchmark_single_packet(c: &mut Criterion) {
    let codec = PacketCodec::default();
    let records = sample_records(1);
    let refs: Vec<&Record> = records.iter().collect();
    let globals = globals();

    c.bench_function("encode_single_record", |b| {
        b.iter(|| codec.encode(black_box(&refs), black_box(&globals), || 1))
    });
}

fn benchmark_batch_encoding(c: &mut Criterion) {
    let codec = PacketCodec::default();
    let records = sample_records(500);
    let refs: Vec<&Record> = records.iter().collect();
    let globals = globals();

    c.bench_function("encode_batch_500_records", |b| {
        b.iter(|| {
            let mut sequence = 0u32;
            codec.encode(black_box(&refs), black_box(&globals), || {
                sequence = sequence.wrapping_add(1);
                sequence
            })
        })
    });
}

fn benchmark_decoding(c: &mut Criterion) {
    let codec = PacketCodec::default();
    let records = sample_records(10);
    let refs: Vec<&Record> = records.iter().collect();
    let packets = codec.encode(&refs, &globals(), || 7).unwrap();
    let bytes = packets[0].bytes.clone();

    c.bench_function("decode_packet", |b| {
        b.iter(|| PacketCodec::decode_packet(black_box(&bytes)))
    });
}

fn benchmark_registry_scan(c: &mut Criterion) {
    let mut registry = RecordRegistry::new(2);
    for record in sample_records(2000) {
        registry.register(record).unwrap();
    }

    c.bench_function("unsent_scan_2000_records", |b| {
        b.iter(|| registry.unsent_for(black_box(TargetId(1))).len())
    });
}

fn benchmark_ack_backoff(c: &mut Criterion) {
    c.bench_function("calculate_exponential_backoff", |b| {
        b.iter(|| {
            for attempt in 0..10 {
                calculate_backoff_ms(attempt, black_box(250), black_box(2.0), black_box(5000));
            }
        });
    });
}

criterion_group!(
    benches,
    benchmark_single_packet,
    benchmark_batch_encoding,
    benchmark_decoding,
    benchmark_registry_scan,
    benchmark_ack_backoff
);
criterion_main!(benches);
