// Envelope benchmarks for the Parley protocol.
//
// Covers identity generation, sealing and opening envelopes at message and
// chunk sizes, and the binary encoding used for file chunks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use parley_protocol::config::DEFAULT_CHUNK_SIZE;
use parley_protocol::crypto::{EncryptedEnvelope, IdentityKeypair};

fn bench_keypair_generation(c: &mut Criterion) {
    c.bench_function("x25519/keypair_generate", |b| {
        b.iter(IdentityKeypair::generate);
    });
}

fn bench_seal(c: &mut Criterion) {
    let recipient = IdentityKeypair::generate().public_key();
    let mut group = c.benchmark_group("envelope/seal");

    for size in [256usize, 4 * 1024, DEFAULT_CHUNK_SIZE as usize] {
        let plaintext = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &plaintext, |b, pt| {
            b.iter(|| EncryptedEnvelope::seal(&recipient, pt).unwrap());
        });
    }
    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let identity = IdentityKeypair::generate();
    let recipient = identity.public_key();
    let mut group = c.benchmark_group("envelope/open");

    for size in [256usize, 4 * 1024, DEFAULT_CHUNK_SIZE as usize] {
        let envelope = EncryptedEnvelope::seal(&recipient, &vec![0xa5u8; size]).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &envelope, |b, env| {
            b.iter(|| env.open(&identity).unwrap());
        });
    }
    group.finish();
}

fn bench_chunk_encoding(c: &mut Criterion) {
    let recipient = IdentityKeypair::generate().public_key();
    let envelope =
        EncryptedEnvelope::seal(&recipient, &vec![7u8; DEFAULT_CHUNK_SIZE as usize]).unwrap();
    let bytes = envelope.to_bytes();

    c.bench_function("envelope/to_bytes", |b| {
        b.iter(|| envelope.to_bytes());
    });
    c.bench_function("envelope/from_bytes", |b| {
        b.iter(|| EncryptedEnvelope::from_bytes(&bytes).unwrap());
    });
    c.bench_function("envelope/to_json", |b| {
        b.iter(|| envelope.to_json().unwrap());
    });
}

criterion_group!(
    benches,
    bench_keypair_generation,
    bench_seal,
    bench_open,
    bench_chunk_encoding,
);
criterion_main!(benches);
