use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vaultkeep::config::CryptoConfig;
use vaultkeep::CryptoEngine;

fn initialized_engine(config: &CryptoConfig) -> CryptoEngine {
    let engine = CryptoEngine::ephemeral(config);
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(engine.initialize()).unwrap();
    engine
}

fn benchmark_envelopes(c: &mut Criterion) {
    let engine = initialized_engine(&CryptoConfig::default());
    let mut group = c.benchmark_group("envelope");

    let sizes = [("32B", 32), ("1KB", 1024), ("16KB", 16 * 1024)];
    for (name, size) in sizes {
        let plaintext = "x".repeat(size);
        let envelope = engine.encrypt(&plaintext).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", name), &plaintext, |b, p| {
            b.iter(|| engine.encrypt(black_box(p)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("decrypt", name), &envelope, |b, e| {
            b.iter(|| engine.decrypt(black_box(e)).unwrap());
        });
    }
    group.finish();
}

fn benchmark_hashing(c: &mut Criterion) {
    let engine = CryptoEngine::ephemeral(&CryptoConfig::default());
    let hash = engine.hash("correct horse battery staple").unwrap();
    let token = engine.generate_api_key("ak").unwrap();
    let token_hash = engine.secure_hash(&token).unwrap();

    let mut group = c.benchmark_group("hashing");
    group.sample_size(10);
    group.bench_function("password_verify_100k", |b| {
        b.iter(|| engine.verify(black_box("correct horse battery staple"), &hash));
    });
    group.bench_function("secure_hash_verify", |b| {
        b.iter(|| engine.verify_secure_hash(black_box(&token), &token_hash));
    });
    group.finish();
}

criterion_group!(benches, benchmark_envelopes, benchmark_hashing);
criterion_main!(benches);
