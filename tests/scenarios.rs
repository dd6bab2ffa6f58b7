//! End-to-end scenarios over real files and the simulated backing store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use deltadisk::core::types::{CancelToken, DeltaId};
use deltadisk::delta::backing::{BackingStore, FileBacking};
use deltadisk::delta::format_image;
use deltadisk::delta::sim::SimBacking;
use deltadisk::{Config, Engine, Error, IoRequest, LayerSpec, SnapshotTarget, StackSpec};

const MIB: usize = 1024 * 1024;

fn sim_image(cluster_shift: u32, clusters: u64, base: bool) -> (SimBacking, Arc<dyn BackingStore>) {
    let sim = SimBacking::new();
    let backing: Arc<dyn BackingStore> = Arc::new(sim.clone());
    format_image(&backing, cluster_shift, clusters, base).unwrap();
    (sim, backing)
}

fn open_engine(layers: Vec<LayerSpec>) -> Engine {
    Engine::open(Config::default(), StackSpec::new(layers)).unwrap()
}

#[test]
fn test_fresh_snapshot_preserves_data() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.img");
    let snap = dir.path().join("snap.img");
    {
        let backing: Arc<dyn BackingStore> = Arc::new(FileBacking::create(&base).unwrap());
        format_image(&backing, 11, 16, true).unwrap();
    }

    // Write 0xAA, snapshot, write 0xBB over it, flush, reopen.
    let engine = open_engine(vec![LayerSpec::image_path(&base)]);
    engine.write(0, Bytes::from(vec![0xAA; 512 * 1024])).unwrap();
    engine.snapshot(SnapshotTarget::Path(snap.clone())).unwrap();
    engine.write(0, Bytes::from(vec![0xBB; 512 * 1024])).unwrap();
    engine.flush().unwrap();
    engine.close().unwrap();

    let engine = open_engine(vec![
        LayerSpec::image_path(&base),
        LayerSpec::image_path(&snap),
    ]);
    let data = engine.read(0, 2048).unwrap();
    assert!(data[..512 * 1024].iter().all(|&b| b == 0xBB));
    assert!(data[512 * 1024..].iter().all(|&b| b == 0x00));
    engine.close().unwrap();

    // Demote the top: the previous delta still holds the 0xAA image.
    let engine = open_engine(vec![LayerSpec::image_path(&base)]);
    let data = engine.read(0, 2048).unwrap();
    assert!(data[..512 * 1024].iter().all(|&b| b == 0xAA));
    assert!(data[512 * 1024..].iter().all(|&b| b == 0x00));
    engine.close().unwrap();
}

#[test]
fn test_copy_up_on_partial_write_over_raw_base() {
    let raw = SimBacking::with_image(vec![0x11; 2 * MIB]);
    let (_top_sim, top) = sim_image(11, 2, false);

    let engine = open_engine(vec![
        LayerSpec::raw_store(Arc::new(raw.clone())),
        LayerSpec::image_store(top),
    ]);

    engine.write(0, Bytes::from(vec![0x22; 4096])).unwrap();
    engine.flush().unwrap();

    let data = engine.read(0, 2048).unwrap();
    assert!(data[..4096].iter().all(|&b| b == 0x22));
    assert!(data[4096..].iter().all(|&b| b == 0x11));
    engine.close().unwrap();
}

#[test]
fn test_crash_between_data_and_metadata() {
    let (sim, backing) = sim_image(11, 16, true);

    let engine = open_engine(vec![LayerSpec::image_store(backing)]);
    // Let the data flush through, then drop every later flush: the BAT
    // page and header bump never reach stable storage.
    sim.set_flush_limit(1);
    engine
        .write(5 * 2048, Bytes::from(vec![0xCC; MIB]))
        .unwrap();
    let image = sim.crash();
    drop(engine);

    let engine = open_engine(vec![LayerSpec::image_store(Arc::new(SimBacking::with_image(
        image,
    )))]);
    let data = engine.read(5 * 2048, 2048).unwrap();
    assert!(
        data.iter().all(|&b| b == 0),
        "uncommitted write must be invisible after crash"
    );
    engine.close().unwrap();
}

#[test]
fn test_merge_is_data_preserving() {
    let (_base_sim, base) = sim_image(3, 16, true);
    let d1_sim = SimBacking::new();
    let d2_sim = SimBacking::new();

    let engine = open_engine(vec![LayerSpec::image_store(base.clone())]);
    engine.write(7 * 8, Bytes::from(vec![0xFF; 4096])).unwrap();
    engine.write(12 * 8, Bytes::from(vec![0xFF; 4096])).unwrap();
    engine
        .snapshot(SnapshotTarget::Store(Arc::new(d1_sim.clone())))
        .unwrap();
    engine.write(7 * 8, Bytes::from(vec![0xEE; 4096])).unwrap();
    engine
        .snapshot(SnapshotTarget::Store(Arc::new(d2_sim.clone())))
        .unwrap();
    engine.write(7 * 8, Bytes::from(vec![0xDD; 4096])).unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.layers().len(), 3);

    engine
        .merge(DeltaId(1), DeltaId(2), &CancelToken::new())
        .unwrap();
    assert_eq!(engine.layers().len(), 2);

    let data = engine.read(7 * 8, 8).unwrap();
    assert!(data.iter().all(|&b| b == 0xDD), "upper overrides survive");
    let data = engine.read(12 * 8, 8).unwrap();
    assert!(data.iter().all(|&b| b == 0xFF), "untouched clusters survive");
    engine.close().unwrap();

    // The merged chain persists on disk: reopen [base, d1].
    let engine = open_engine(vec![
        LayerSpec::image_store(base),
        LayerSpec::image_store(Arc::new(d1_sim)),
    ]);
    let data = engine.read(7 * 8, 8).unwrap();
    assert!(data.iter().all(|&b| b == 0xDD));
    let data = engine.read(12 * 8, 8).unwrap();
    assert!(data.iter().all(|&b| b == 0xFF));
    engine.close().unwrap();
}

#[test]
fn test_barrier_ordering() {
    let (_sim, backing) = sim_image(3, 64, true);
    let engine = open_engine(vec![LayerSpec::image_store(backing)]);

    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let record = |tag: &'static str| {
        let log = log.clone();
        Box::new(move |result: deltadisk::Result<Bytes>| {
            result.unwrap();
            log.lock().unwrap().push(tag);
        })
    };

    engine
        .submit(IoRequest::write(0, Bytes::from(vec![1u8; 4096]), record("a")))
        .unwrap();
    engine
        .submit(IoRequest::write(8, Bytes::from(vec![2u8; 4096]), record("b")))
        .unwrap();
    engine.submit(IoRequest::barrier(record("B"))).unwrap();
    engine
        .submit(IoRequest::write(0, Bytes::from(vec![3u8; 4096]), record("c")))
        .unwrap();

    // Drain everything.
    engine.flush().unwrap();
    engine.close().unwrap();

    let log = log.lock().unwrap();
    let index = |tag| log.iter().position(|&t| t == tag).unwrap();
    assert!(index("B") > index("a"), "barrier completes after W_a: {:?}", *log);
    assert!(index("B") > index("b"), "barrier completes after W_b: {:?}", *log);
    assert!(index("c") > index("B"), "W_c completes after the barrier: {:?}", *log);
}

#[test]
fn test_relocate_under_load() {
    let (_sim, backing) = sim_image(3, 256, true);
    let engine = Arc::new(open_engine(vec![LayerSpec::image_store(backing)]));
    let stop = Arc::new(AtomicBool::new(false));

    std::thread::scope(|scope| {
        let writer_engine = engine.clone();
        let writer = scope.spawn(move || {
            for i in 1..=30u8 {
                writer_engine
                    .write(100 * 8, Bytes::from(vec![i; 4096]))
                    .unwrap();
            }
        });

        let reader_engine = engine.clone();
        let reader_stop = stop.clone();
        let reader = scope.spawn(move || {
            while !reader_stop.load(Ordering::SeqCst) {
                let data = reader_engine.read(100 * 8, 8).unwrap();
                let first = data[0];
                assert!(
                    data.iter().all(|&b| b == first),
                    "a read must observe exactly one physical location"
                );
            }
        });

        for _ in 0..5 {
            engine.relocate(100).unwrap();
        }

        writer.join().unwrap();
        stop.store(true, Ordering::SeqCst);
        reader.join().unwrap();
    });

    let data = engine.read(100 * 8, 8).unwrap();
    assert!(data.iter().all(|&b| b == 30));
    engine.close().unwrap();
}

#[test]
fn test_overlapping_writes_serialize_per_cluster() {
    let (_sim, backing) = sim_image(3, 8, true);
    let engine = Arc::new(open_engine(vec![LayerSpec::image_store(backing)]));

    for _ in 0..10 {
        std::thread::scope(|scope| {
            let e1 = engine.clone();
            let e2 = engine.clone();
            scope.spawn(move || e1.write(3 * 8, Bytes::from(vec![0x55; 4096])).unwrap());
            scope.spawn(move || e2.write(3 * 8, Bytes::from(vec![0x66; 4096])).unwrap());
        });
        let data = engine.read(3 * 8, 8).unwrap();
        let first = data[0];
        assert!(first == 0x55 || first == 0x66);
        assert!(data.iter().all(|&b| b == first), "no interleaved cluster");
    }
    engine.close().unwrap();
}

#[test]
fn test_zero_length_request_is_immediate() {
    let (sim, backing) = sim_image(3, 8, true);
    let engine = open_engine(vec![LayerSpec::image_store(backing)]);

    let before = sim.cached_extents();
    assert!(engine.read(3, 0).unwrap().is_empty());
    engine.write(3, Bytes::new()).unwrap();
    assert_eq!(sim.cached_extents(), before, "no backing I/O was issued");
    engine.close().unwrap();
}

#[test]
fn test_out_of_range_is_synchronous() {
    let (_sim, backing) = sim_image(3, 8, true);
    let engine = open_engine(vec![LayerSpec::image_store(backing)]);

    // 8 clusters of 8 sectors: sector 64 is one past the end.
    assert!(matches!(
        engine.read(64, 1),
        Err(Error::OutOfRange { .. })
    ));
    assert!(matches!(
        engine.write(63, Bytes::from(vec![0u8; 1024])),
        Err(Error::OutOfRange { .. })
    ));
    engine.close().unwrap();
}

#[test]
fn test_multi_cluster_write_roundtrip() {
    let (_sim, backing) = sim_image(3, 16, true);
    let engine = open_engine(vec![LayerSpec::image_store(backing)]);

    // 3.5 clusters starting mid-cluster: every piece goes through its own
    // slot, completion is all-or-nothing.
    let len = 28 * 512;
    let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    engine.write(4, Bytes::from(payload.clone())).unwrap();

    let data = engine.read(4, 28).unwrap();
    assert_eq!(&data[..], &payload[..]);

    // Unwritten neighbours still read as zeros.
    let head = engine.read(0, 4).unwrap();
    assert!(head.iter().all(|&b| b == 0));
    engine.close().unwrap();
}

#[test]
fn test_queued_request_cancellation() {
    let (_sim, backing) = sim_image(3, 8, true);
    let engine = open_engine(vec![LayerSpec::image_store(backing)]);

    let token = CancelToken::new();
    token.cancel();
    let (tx, rx) = std::sync::mpsc::channel();
    engine
        .submit(
            IoRequest::write(
                0,
                Bytes::from(vec![0xAB; 4096]),
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            )
            .with_cancel(token),
        )
        .unwrap();
    assert_eq!(rx.recv().unwrap(), Err(Error::Cancelled));

    // The cancelled write never landed.
    let data = engine.read(0, 8).unwrap();
    assert!(data.iter().all(|&b| b == 0));
    engine.close().unwrap();
}

#[test]
fn test_grow_extends_and_reads_zero() {
    let (_sim, backing) = sim_image(3, 8, true);
    let engine = open_engine(vec![LayerSpec::image_store(backing.clone())]);

    engine.write(0, Bytes::from(vec![0x77; 4096])).unwrap();
    assert!(matches!(
        engine.read(8 * 8, 8),
        Err(Error::OutOfRange { .. })
    ));

    engine.grow(2048).unwrap();
    assert_eq!(engine.virtual_sectors(), 2048 * 8);

    // Old data survives the grow; new clusters read as zero.
    let data = engine.read(0, 8).unwrap();
    assert!(data.iter().all(|&b| b == 0x77));
    let data = engine.read(2047 * 8, 8).unwrap();
    assert!(data.iter().all(|&b| b == 0));

    // And writes beyond the old end work.
    engine
        .write(2000 * 8, Bytes::from(vec![0x88; 4096]))
        .unwrap();
    engine.flush().unwrap();
    engine.close().unwrap();

    let engine = open_engine(vec![LayerSpec::image_store(backing)]);
    let data = engine.read(2000 * 8, 8).unwrap();
    assert!(data.iter().all(|&b| b == 0x88));
    let data = engine.read(0, 8).unwrap();
    assert!(data.iter().all(|&b| b == 0x77));
    engine.close().unwrap();
}

#[test]
fn test_merge_cancellation_aborts_cleanly() {
    let (_base_sim, base) = sim_image(3, 16, true);
    let d1 = SimBacking::new();

    let engine = open_engine(vec![LayerSpec::image_store(base)]);
    engine.write(2 * 8, Bytes::from(vec![0x10; 4096])).unwrap();
    engine
        .snapshot(SnapshotTarget::Store(Arc::new(d1)))
        .unwrap();
    engine.write(2 * 8, Bytes::from(vec![0x20; 4096])).unwrap();

    let token = CancelToken::new();
    token.cancel();
    assert_eq!(
        engine.merge(DeltaId(0), DeltaId(1), &token),
        Err(Error::Cancelled)
    );

    // The stack is unchanged and fully functional.
    assert_eq!(engine.layers().len(), 2);
    let data = engine.read(2 * 8, 8).unwrap();
    assert!(data.iter().all(|&b| b == 0x20));
    engine.close().unwrap();
}
