//! Engine read/write throughput over the in-memory backing store.

use std::sync::Arc;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};

use deltadisk::delta::backing::BackingStore;
use deltadisk::delta::format_image;
use deltadisk::delta::sim::SimBacking;
use deltadisk::{Config, Engine, LayerSpec, StackSpec};

fn engine_over_sim(clusters: u64) -> Engine {
    let sim = SimBacking::new();
    let backing: Arc<dyn BackingStore> = Arc::new(sim);
    format_image(&backing, 3, clusters, true).unwrap();
    Engine::open(
        Config::default(),
        StackSpec::new(vec![LayerSpec::image_store(backing)]),
    )
    .unwrap()
}

fn bench_engine_io(c: &mut Criterion) {
    let engine = engine_over_sim(1024);
    let payload = Bytes::from(vec![0xAB; 4096]);

    let mut cluster = 0u64;
    c.bench_function("write_full_cluster", |b| {
        b.iter(|| {
            engine
                .write((cluster % 1024) * 8, payload.clone())
                .unwrap();
            cluster += 1;
        })
    });

    c.bench_function("read_full_cluster", |b| {
        b.iter(|| engine.read(0, 8).unwrap())
    });

    c.bench_function("read_spanning_four_clusters", |b| {
        b.iter(|| engine.read(4, 32).unwrap())
    });
}

criterion_group!(benches, bench_engine_io);
criterion_main!(benches);
