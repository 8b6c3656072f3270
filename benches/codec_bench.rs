// benches/codec_bench.rs - Wire Codec and PoR Benchmarks

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use acn::trust::{LedgerId, LedgerKeyPair, PeerKeypair, por};
use acn::wire::{AcnMessage, AgentRecord, Envelope, codec};

fn sample_record(ledger: LedgerId) -> AgentRecord {
    let peer = PeerKeypair::generate();
    let agent = LedgerKeyPair::generate(ledger);
    AgentRecord::issue(&agent, peer.public_key())
}

fn bench_envelope_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_frame");
    let record = sample_record(LedgerId::Fetchai);

    for size in [64usize, 1024, 16 * 1024, 256 * 1024] {
        let envelope = Envelope::new("receiver", record.address.clone(), vec![7u8; size])
            .with_protocol_id("fetchai/default:1.0.0");
        let msg = AcnMessage::envelope(&envelope, Some(record.clone()));
        let frame = codec::encode(&msg);
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &msg, |b, msg| {
            b.iter(|| codec::encode(black_box(msg)))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, frame| {
            b.iter(|| codec::decode(black_box(frame)))
        });
    }
    group.finish();
}

fn bench_por_verification(c: &mut Criterion) {
    let mut group = c.benchmark_group("por_verify");
    for ledger in LedgerId::ALL {
        let record = sample_record(ledger);
        group.bench_function(ledger.as_str(), |b| b.iter(|| por::verify(black_box(&record))));
    }
    group.finish();
}

criterion_group!(benches, bench_envelope_frames, bench_por_verification);
criterion_main!(benches);
