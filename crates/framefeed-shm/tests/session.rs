#![cfg(target_os = "linux")]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Integration tests for feeder sessions: attaching late, detaching and
//! restarting with new handles.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{
    CountingCopier, FeederResources, GPU_LUID, TEXTURE_SIZE, TestRegion, TestTexture, layers,
    submit,
};
use framefeed_shm::{
    ConsumerKind, CopyTarget, Reader, Snapshot, SnapshotState, TextureCopier, Writer,
};

fn read(
    reader: &mut Reader,
    copier: &CountingCopier,
    destination: &Arc<TestTexture>,
) -> Snapshot<TestTexture> {
    reader.maybe_get_uncached(
        CopyTarget {
            gpu_luid: GPU_LUID,
            copier,
            destination,
        },
        ConsumerKind::OpenVr,
    )
}

#[test]
fn test_reader_started_before_writer_finds_feeder() {
    let region = TestRegion::new("late-writer");
    let mut reader = Reader::open(&region.config).expect("reader");
    assert!(!reader.is_attached());

    let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
    let resources = FeederResources::new();
    submit(&writer, &resources, &layers(1));

    assert!(reader.is_attached());
    assert_eq!(reader.session_id(), writer.session_id());
    let snapshot = reader.maybe_get_metadata_uncached::<()>(ConsumerKind::OpenVr);
    assert!(snapshot.is_valid());
}

#[test]
fn test_render_cache_key_changes_per_frame() {
    let region = TestRegion::new("cache-key");
    let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
    let reader = Reader::open(&region.config).expect("reader");
    let resources = FeederResources::new();

    let before = reader.render_cache_key(ConsumerKind::OpenVr);
    submit(&writer, &resources, &layers(1));
    let first = reader.render_cache_key(ConsumerKind::OpenVr);
    submit(&writer, &resources, &layers(1));
    let second = reader.render_cache_key(ConsumerKind::OpenVr);

    assert_ne!(before, first);
    assert_ne!(first, second);
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(second.frame_number, first.frame_number + 1);
    assert_eq!(reader.frame_count_for_metrics(), 2);
}

#[test]
fn test_writer_drop_detaches_and_restart_uses_new_handles() {
    let region = TestRegion::new("restart");
    let mut reader = Reader::open(&region.config).expect("reader");
    let copier = CountingCopier::default();
    let destination = Arc::new(
        copier
            .create_client_texture(0, TEXTURE_SIZE)
            .expect("texture"),
    );

    let first_session = {
        let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
        let resources = FeederResources::new();
        submit(&writer, &resources, &layers(1));
        let snapshot = read(&mut reader, &copier, &destination);
        assert_eq!(snapshot.state(), SnapshotState::ValidWithTexture);
        assert_eq!(
            destination.source_inode.load(Ordering::SeqCst),
            resources.texture_inode()
        );
        writer.session_id()
    };

    // Dropping the writer detached it.
    assert!(!reader.is_attached());
    assert_ne!(reader.session_id(), first_session);
    let snapshot = read(&mut reader, &copier, &destination);
    assert_eq!(snapshot.state(), SnapshotState::Empty);

    // The first feeder's fds are closed, so the new ones are likely to reuse
    // the same numbers; the reader must not trust its old duplicates.
    let writer = Writer::new(&region.config, GPU_LUID).expect("writer");
    let resources = FeederResources::new();
    submit(&writer, &resources, &layers(1));
    let snapshot = read(&mut reader, &copier, &destination);
    assert_eq!(snapshot.state(), SnapshotState::ValidWithTexture);
    assert_eq!(
        destination.source_inode.load(Ordering::SeqCst),
        resources.texture_inode()
    );
    assert_eq!(copier.copies(), 2);
}

#[test]
fn test_second_writer_takes_over_with_new_session() {
    let region = TestRegion::new("takeover");
    let first = Writer::new(&region.config, GPU_LUID).expect("first writer");
    let resources = FeederResources::new();
    submit(&first, &resources, &layers(1));
    let first_session = first.session_id();

    let second = Writer::new(&region.config, GPU_LUID).expect("second writer");
    assert_ne!(second.session_id(), first_session);
    assert_eq!(second.frame_count_for_metrics(), 0);
    assert!(!second.lock().expect("lock").metadata().has_feeder());
}
