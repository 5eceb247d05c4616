#![cfg(target_os = "linux")]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Integration tests for the cached reader's snapshot cache and texture
//! ring.

mod common;

use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use common::{
    CountingCopier, FeederResources, GPU_LUID, TestRegion, frame_config, layers, submit,
};
use framefeed_shm::{CachedReader, ConsumerKind, SnapshotState, Writer};

fn cached_reader(region: &TestRegion) -> CachedReader<CountingCopier> {
    let mut reader = CachedReader::open(
        &region.config,
        CountingCopier::default(),
        ConsumerKind::OpenXrD3D11,
    )
    .expect("reader");
    reader.initialize_cache(GPU_LUID, 3);
    reader
}

#[test]
fn test_unchanged_frame_is_served_from_cache() {
    let region = TestRegion::new("cache-hit");
    let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
    let resources = FeederResources::new();
    submit(&writer, &resources, &layers(2));

    let mut reader = cached_reader(&region);
    let first = reader.maybe_get();
    assert_eq!(first.state(), SnapshotState::ValidWithTexture);
    let second = reader.maybe_get();
    assert_eq!(second.state(), SnapshotState::ValidWithTexture);

    assert_eq!(reader.copier().copies(), 1);
    assert_eq!(reader.copier().creates(), 1);
    assert!(Arc::ptr_eq(
        first.texture().expect("texture"),
        second.texture().expect("texture")
    ));
}

#[test]
fn test_new_frame_rotates_destination_texture() {
    let region = TestRegion::new("ring");
    let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
    let resources = FeederResources::new();
    let mut reader = cached_reader(&region);

    let mut textures = Vec::new();
    for _ in 0..4 {
        submit(&writer, &resources, &layers(1));
        let snapshot = reader.maybe_get();
        assert_eq!(snapshot.state(), SnapshotState::ValidWithTexture);
        textures.push(Arc::clone(snapshot.texture().expect("texture")));
    }

    assert_eq!(reader.copier().copies(), 4);
    // Three ring slots, created once each, then reused.
    assert_eq!(reader.copier().creates(), 3);
    let indices: Vec<u8> = textures.iter().map(|t| t.swapchain_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 0]);
    assert!(!Arc::ptr_eq(&textures[0], &textures[1]));
    assert!(Arc::ptr_eq(&textures[0], &textures[3]));
}

#[test]
fn test_nothing_before_initialize_cache() {
    let region = TestRegion::new("uninitialized");
    let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
    let resources = FeederResources::new();
    submit(&writer, &resources, &layers(1));

    let mut reader = CachedReader::open(
        &region.config,
        CountingCopier::default(),
        ConsumerKind::OpenXrD3D11,
    )
    .expect("reader");
    assert_eq!(reader.maybe_get().state(), SnapshotState::Empty);
    assert_eq!(reader.copier().copies(), 0);
}

#[test]
fn test_detached_writer_clears_cache() {
    let region = TestRegion::new("detach");
    let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
    let resources = FeederResources::new();
    submit(&writer, &resources, &layers(1));

    let mut reader = cached_reader(&region);
    assert!(reader.maybe_get().is_valid());

    writer.lock().expect("lock").detach();
    let snapshot = reader.maybe_get();
    assert_eq!(snapshot.state(), SnapshotState::Empty);
    assert!(snapshot.texture().is_none());
}

#[test]
fn test_busy_lock_returns_previous_snapshot() {
    let region = TestRegion::new("busy");
    let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
    let resources = FeederResources::new();
    submit(&writer, &resources, &layers(1));

    let mut reader = cached_reader(&region);
    let first = reader.maybe_get();
    assert_eq!(first.sequence_number_for_debugging(), 1);

    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (feeder, feeder_resources) = (&writer, &resources);
    thread::scope(|s| {
        s.spawn(move || {
            let mut guard = feeder.lock().expect("lock");
            let frame = guard.begin_frame();
            frame.submit(
                &frame_config(),
                &layers(1),
                feeder_resources.texture.as_fd(),
                feeder_resources.fence.as_fd(),
            );
            locked_tx.send(()).expect("send");
            release_rx.recv().expect("recv");
        });

        locked_rx.recv().expect("recv");
        // Frame 2 is visible without the lock, but the lock is still held.
        assert_eq!(reader.reader().frame_count_for_metrics(), 2);
        let during = reader.maybe_get();
        assert_eq!(during.sequence_number_for_debugging(), 1);
        assert_eq!(reader.copier().copies(), 1);
        release_tx.send(()).expect("send");
    });

    let after = reader.maybe_get();
    assert_eq!(after.sequence_number_for_debugging(), 2);
    assert_eq!(reader.copier().copies(), 2);
}

#[test]
fn test_metadata_only_fetch_does_not_copy() {
    let region = TestRegion::new("cached-metadata");
    let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
    let resources = FeederResources::new();
    submit(&writer, &resources, &layers(2));

    let mut reader = cached_reader(&region);
    let snapshot = reader.maybe_get_metadata();
    assert_eq!(snapshot.state(), SnapshotState::ValidWithoutTexture);
    assert_eq!(snapshot.layer_count(), 2);
    assert_eq!(reader.copier().copies(), 0);
}

#[test]
fn test_fence_timeout_is_cached_like_a_normal_copy() {
    let region = TestRegion::new("cached-fence-timeout");
    let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
    let resources = FeederResources::new();
    submit(&writer, &resources, &layers(1));

    let mut reader = cached_reader(&region);
    reader
        .copier()
        .fence_timeout
        .store(true, std::sync::atomic::Ordering::SeqCst);
    assert_eq!(reader.maybe_get().state(), SnapshotState::ValidWithTexture);
    assert_eq!(reader.maybe_get().state(), SnapshotState::ValidWithTexture);
    assert_eq!(reader.copier().copies(), 1);
}
