mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chunkdb_core::{
    Cancellation, ChunkResolver, Compression, DedupConfig, DigestIndex, IndexOptions,
    MeteredBackend, Resolved,
};
use common::{chunk, init_tracing, ImageBackend, Layer};
use tempfile::tempdir;

const THREADS: usize = 16;

#[test]
fn concurrent_misses_collapse_into_one_fetch() -> Result<()> {
    init_tracing();
    let temp = tempdir()?;
    let layer = Layer::build("sha256:hot", &[chunk(7, 65536)], Compression::Gzip)?;
    let backend = MeteredBackend::new(
        ImageBackend::new()
            .with_layer(&layer)
            .with_delay(Duration::from_millis(150)),
    );
    let metrics = backend.metrics();
    let resolver = Arc::new(ChunkResolver::open(
        DedupConfig::with_database(temp.path().join("cas.db")),
        backend,
    )?);
    let request = Arc::new(layer.requests[0].clone());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let resolver = Arc::clone(&resolver);
            let request = Arc::clone(&request);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                resolver.resolve(&request, &Cancellation::new())
            })
        })
        .collect();
    let outcomes = handles
        .into_iter()
        .map(|handle| handle.join().expect("resolver thread"))
        .collect::<Result<Vec<_>, _>>()?;

    assert_eq!(metrics.snapshot().read_count, 1);
    let expected = chunk(7, 65536);
    for outcome in &outcomes {
        // A thread that only reached the index after the commit sees a hit.
        if let Some(data) = outcome.data() {
            assert_eq!(data, &expected[..]);
        }
    }
    let committed = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Resolved::Fetched { committed: true, .. }))
        .count();
    // Only the thread that ran the fetch reports the commit as its own.
    assert_eq!(committed, 1);
    assert_eq!(resolver.metrics().commits, 1);
    Ok(())
}

#[test]
fn unrelated_digests_do_not_wait_on_each_other() -> Result<()> {
    let temp = tempdir()?;
    let chunks: Vec<_> = (0..8).map(|seed| chunk(seed, 1024)).collect();
    let layer = Layer::build("sha256:wide", &chunks, Compression::None)?;
    let backend = MeteredBackend::new(
        ImageBackend::new()
            .with_layer(&layer)
            .with_delay(Duration::from_millis(200)),
    );
    let metrics = backend.metrics();
    let resolver = Arc::new(ChunkResolver::open(
        DedupConfig::with_database(temp.path().join("cas.db")),
        backend,
    )?);

    let started = std::time::Instant::now();
    let handles: Vec<_> = layer
        .requests
        .iter()
        .cloned()
        .map(|request| {
            let resolver = Arc::clone(&resolver);
            thread::spawn(move || resolver.resolve(&request, &Cancellation::new()))
        })
        .collect();
    for handle in handles {
        handle.join().expect("resolver thread")?;
    }
    assert_eq!(metrics.snapshot().read_count, 8);
    // Serialized fetches would take 1.6s.
    assert!(started.elapsed() < Duration::from_millis(1200));
    Ok(())
}

#[test]
fn stalled_leader_is_taken_over_after_the_lock_timeout() -> Result<()> {
    init_tracing();
    let temp = tempdir()?;
    let layer = Layer::build("sha256:slow", &[chunk(3, 512)], Compression::None)?;
    let backend = Arc::new(
        ImageBackend::new()
            .with_layer(&layer)
            .with_delay(Duration::from_millis(600)),
    );
    let config = DedupConfig {
        lock_timeout_ms: 50,
        ..DedupConfig::with_database(temp.path().join("cas.db"))
    };
    let resolver = Arc::new(ChunkResolver::open(config, Arc::clone(&backend))?);
    let request = layer.requests[0].clone();

    let leader = {
        let resolver = Arc::clone(&resolver);
        let request = request.clone();
        thread::spawn(move || resolver.resolve(&request, &Cancellation::new()))
    };
    thread::sleep(Duration::from_millis(100));
    let follower = resolver.resolve(&request, &Cancellation::new())?;
    let leader = leader.join().expect("leader thread")?;

    assert_eq!(follower.data(), leader.data());
    assert_eq!(backend.calls(), 2);
    assert!(resolver.metrics().lock_timeouts >= 1);
    let index = resolver.index().expect("dedup enabled");
    assert_eq!(index.chunk_count()?, 1);
    Ok(())
}

#[test]
fn takeover_uses_a_record_committed_while_waiting() -> Result<()> {
    init_tracing();
    let temp = tempdir()?;
    let db = temp.path().join("cas.db");
    let layer = Layer::build("sha256:late", &[chunk(4, 512)], Compression::None)?;
    let backend = Arc::new(
        ImageBackend::new()
            .with_layer(&layer)
            .with_delay(Duration::from_millis(1000)),
    );
    let config = DedupConfig {
        lock_timeout_ms: 300,
        ..DedupConfig::with_database(&db)
    };
    let resolver = Arc::new(ChunkResolver::open(config, Arc::clone(&backend))?);
    let request = layer.requests[0].clone();

    let leader = {
        let resolver = Arc::clone(&resolver);
        let request = request.clone();
        thread::spawn(move || resolver.resolve(&request, &Cancellation::new()))
    };
    thread::sleep(Duration::from_millis(100));
    let follower = {
        let resolver = Arc::clone(&resolver);
        let request = request.clone();
        thread::spawn(move || resolver.resolve(&request, &Cancellation::new()))
    };
    // Another mount commits the chunk while the follower is still waiting.
    thread::sleep(Duration::from_millis(100));
    let other = DigestIndex::open(&db, &IndexOptions::default())?;
    assert!(other.put_if_absent(&request.to_record(0))?);

    let follower = follower.join().expect("follower thread")?;
    assert!(follower.is_deduplicated());
    assert_eq!(backend.calls(), 1);
    leader.join().expect("leader thread")?;
    assert_eq!(backend.calls(), 1);
    assert!(resolver.metrics().lock_timeouts >= 1);
    Ok(())
}
