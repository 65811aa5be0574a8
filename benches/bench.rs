use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memring::{HashAlgorithm, LocatorKind, NodeLocator};

fn hashing(c: &mut Criterion) {
    let key = b"some-representative-cache-key:12345";
    let algorithms = [
        ("ketama", HashAlgorithm::Ketama),
        ("fnv1a", HashAlgorithm::Fnv1a32),
        ("crc", HashAlgorithm::Crc),
        ("native", HashAlgorithm::Native),
    ];
    for (name, algorithm) in algorithms {
        c.bench_function(&format!("hash/{}", name), |b| {
            b.iter(|| algorithm.hash(black_box(key)))
        });
    }
}

fn locator(c: &mut Criterion) {
    let addrs: Vec<String> = (1..=8).map(|i| format!("10.0.1.{}:11211", i)).collect();
    let locator = NodeLocator::new(LocatorKind::Ketama, HashAlgorithm::Ketama, addrs);

    c.bench_function("locator/primary", |b| {
        b.iter(|| locator.primary(black_box(b"some-key" as &[u8])))
    });
    c.bench_function("locator/sequence", |b| {
        b.iter(|| locator.sequence(black_box(b"some-key" as &[u8])))
    });
}

criterion_group!(benches, hashing, locator);
criterion_main!(benches);
