//! Feeder side: publishing frames into the shared region.
//!
//! ```text
//! Writer::lock() ──► WriterGuard ──begin_frame()──► FrameInProgress ──submit()──┐
//!                        │  ▲                                                   │
//!                        │  └───────────────────────────────────────────────────┘
//!                        ├──submit_empty_frame()
//!                        └──detach()
//! ```
//!
//! Only one writer should exist per region at a time; a second one takes
//! over the region with a new session.

use std::thread;

use tracing::{debug, info, warn};

use crate::config::ShmConfig;
use crate::handles::{BorrowedShareHandle, ForeignHandle};
use crate::layout::{Config, FrameMetadata, LayerConfig};
use crate::naming::ShmNames;
use crate::region::{LockMode, RegionGuard, SharedRegion};
use crate::state_machine::WriterState;
use crate::{MAX_VIEW_COUNT, Result, SWAPCHAIN_LENGTH, ShmError};

/// Where to render the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextFrameInfo {
    /// Swapchain slot the frame's texture belongs to
    pub texture_index: u8,
    /// Value the feeder must signal on its fence once the texture is ready
    pub fence_value: u64,
}

/// The feeder's handle on the shared region.
pub struct Writer {
    region: SharedRegion<WriterState>,
    gpu_luid: u64,
    process_id: u32,
}

impl Writer {
    /// Create or open the region and start a new session.
    ///
    /// `gpu_luid` identifies the adapter the feeder's textures live on;
    /// readers on another adapter get
    /// [`SnapshotState::IncorrectGpu`](crate::SnapshotState::IncorrectGpu).
    pub fn new(config: &ShmConfig, gpu_luid: u64) -> Result<Self> {
        let region = SharedRegion::open(config)?;
        let writer = Self {
            region,
            gpu_luid,
            process_id: std::process::id(),
        };

        let session_id = {
            let guard = writer.lock()?;
            let previous = guard.region.read_header();
            if previous.has_feeder() && previous.feeder_process_id() != writer.process_id {
                warn!(
                    "Feeder pid {} is still attached to {}; taking over",
                    previous.feeder_process_id(),
                    writer.names()
                );
            }
            let header = FrameMetadata::new_session(gpu_luid);
            guard.region.write_header(&header);
            header.session_id()
        };

        info!(
            "Writer attached to {} (session {session_id:#018x})",
            writer.names()
        );
        Ok(writer)
    }

    /// Block until the lock is held.
    pub fn lock(&self) -> Result<WriterGuard<'_>> {
        self.lock_with(LockMode::Blocking)?
            .ok_or_else(|| ShmError::Lock(format!("blocking lock of {} was busy", self.names())))
    }

    /// Take the lock if it is free.
    pub fn try_lock(&self) -> Result<Option<WriterGuard<'_>>> {
        self.lock_with(LockMode::Try)
    }

    fn lock_with(&self, mode: LockMode) -> Result<Option<WriterGuard<'_>>> {
        let Some(region) = self.region.lock(mode)? else {
            return Ok(None);
        };
        if region.was_abandoned() {
            let header = FrameMetadata::new_session(self.gpu_luid);
            region.write_header(&header);
            warn!(
                "Lock on {} was abandoned; header reset (session {:#018x})",
                self.names(),
                header.session_id()
            );
        }
        Ok(Some(WriterGuard {
            writer: self,
            region,
        }))
    }

    /// Names of the region's OS objects.
    pub const fn names(&self) -> &ShmNames {
        self.region.names()
    }

    /// LUID of the adapter this writer publishes for.
    pub const fn gpu_luid(&self) -> u64 {
        self.gpu_luid
    }

    /// Current session id, read without the lock.
    pub fn session_id(&self) -> u64 {
        self.region.peek_render_cache_key().session_id
    }

    /// Frame counter, read without the lock. For metrics only.
    pub fn frame_count_for_metrics(&self) -> u64 {
        self.region.peek_render_cache_key().frame_number
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        match self.lock() {
            Ok(mut guard) => guard.detach(),
            Err(e) => warn!("Failed to detach from {}: {e}", self.names()),
        }
    }
}

/// The writer's lock; the only way to change the header.
pub struct WriterGuard<'w> {
    writer: &'w Writer,
    region: RegionGuard<'w, WriterState>,
}

impl<'w> WriterGuard<'w> {
    /// Start a frame: pick the next swapchain slot and bump its fence value.
    ///
    /// The returned token must be submitted before the guard is released.
    pub fn begin_frame(&mut self) -> FrameInProgress<'_, 'w> {
        self.region
            .machine()
            .transition(WriterState::Locked, WriterState::FrameInProgress);

        let next_frame = self.region.read_header().frame_number().wrapping_add(1);
        let slot = (next_frame % SWAPCHAIN_LENGTH as u64) as usize;
        let fence_value = self.region.next_fence_value(slot);
        debug!("Frame {next_frame}: slot {slot}, fence value {fence_value}");

        FrameInProgress {
            guard: self,
            info: NextFrameInfo {
                texture_index: slot as u8,
                fence_value,
            },
            submitted: false,
        }
    }

    /// Publish "feeder alive, nothing to show".
    pub fn submit_empty_frame(&mut self) {
        self.region
            .machine()
            .transition(WriterState::Locked, WriterState::SubmittingEmptyFrame);
        let (gpu_luid, process_id) = (self.writer.gpu_luid, self.writer.process_id);
        self.region
            .update_header(|header| header.store_empty_frame(gpu_luid, process_id));
        self.region
            .machine()
            .transition(WriterState::SubmittingEmptyFrame, WriterState::Locked);
    }

    /// Clear the header and start a new session without a feeder, so
    /// readers stop using anything they cached.
    pub fn detach(&mut self) {
        self.region
            .machine()
            .transition(WriterState::Locked, WriterState::Detaching);
        let header = FrameMetadata::new_session(self.writer.gpu_luid);
        self.region.write_header(&header);
        self.region
            .machine()
            .transition(WriterState::Detaching, WriterState::Locked);
        info!("Writer detached from {}", self.writer.names());
    }

    /// A copy of the header as it is now.
    pub fn metadata(&self) -> FrameMetadata {
        self.region.read_header()
    }
}

/// A frame between [`WriterGuard::begin_frame`] and
/// [`FrameInProgress::submit`].
///
/// # Panics
///
/// Dropping it without submitting panics.
#[must_use = "a begun frame must be submitted"]
pub struct FrameInProgress<'g, 'w> {
    guard: &'g mut WriterGuard<'w>,
    info: NextFrameInfo,
    submitted: bool,
}

impl FrameInProgress<'_, '_> {
    /// Slot and fence value for this frame.
    pub const fn info(&self) -> NextFrameInfo {
        self.info
    }

    /// Publish the frame.
    ///
    /// `texture` and `fence` must stay open until a later frame replaces
    /// them; readers duplicate them by value.
    ///
    /// # Panics
    ///
    /// If there are more than [`MAX_VIEW_COUNT`] layers, if there are
    /// layers but `config.texture_size` is empty, or if a layer's rectangle
    /// is empty or does not fit in the texture.
    pub fn submit(
        mut self,
        config: &Config,
        layers: &[LayerConfig],
        texture: BorrowedShareHandle<'_>,
        fence: BorrowedShareHandle<'_>,
    ) {
        assert!(
            layers.len() <= MAX_VIEW_COUNT,
            "Asked to publish {} layers, but max is {MAX_VIEW_COUNT}",
            layers.len()
        );
        let texture_size = config.texture_size;
        assert!(
            layers.is_empty() || !texture_size.is_empty(),
            "Asked to publish {} layers on an empty texture",
            layers.len()
        );
        for layer in layers {
            let rect = layer.location_on_texture;
            assert!(
                !rect.size.is_empty(),
                "Layer {} has an empty rectangle",
                layer.layer_id
            );
            assert!(
                rect.fits_within(texture_size),
                "Layer {} rectangle {rect:?} is outside the {}x{} texture",
                layer.layer_id,
                texture_size.width,
                texture_size.height
            );
        }

        let region = &self.guard.region;
        region
            .machine()
            .transition(WriterState::FrameInProgress, WriterState::SubmittingFrame);
        let writer = self.guard.writer;
        region.update_header(|header| {
            header.store_frame(
                writer.gpu_luid,
                writer.process_id,
                config,
                layers,
                ForeignHandle::from_borrowed(texture),
                ForeignHandle::from_borrowed(fence),
            );
        });
        region
            .machine()
            .transition(WriterState::SubmittingFrame, WriterState::Locked);
        self.submitted = true;
    }
}

impl Drop for FrameInProgress<'_, '_> {
    fn drop(&mut self) {
        if !self.submitted && !thread::panicking() {
            panic!(
                "Frame for slot {} was begun but never submitted",
                self.info.texture_index
            );
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::layout::{PixelRect, PixelSize};
    use std::os::fd::AsFd;

    fn config(test: &str) -> ShmConfig {
        ShmConfig::new(format!("com.framefeed.unit.{}.writer.{test}", std::process::id()))
    }

    fn cleanup(config: &ShmConfig) {
        crate::unlink_shared_objects(&ShmNames::for_config(config)).expect("unlink");
    }

    #[test]
    fn test_new_writer_has_no_feeder_until_submit() {
        let config = config("fresh");
        let writer = Writer::new(&config, 5).expect("writer");
        let mut guard = writer.lock().expect("lock");
        assert!(!guard.metadata().has_feeder());
        guard.submit_empty_frame();
        let header = guard.metadata();
        assert!(header.has_feeder());
        assert_eq!(header.frame_number(), 1);
        assert_eq!(header.gpu_luid(), 5);
        drop(guard);
        drop(writer);
        cleanup(&config);
    }

    #[test]
    fn test_begin_frame_advances_slot_and_fence() {
        let config = config("fence");
        let writer = Writer::new(&config, 1).expect("writer");
        let texture = tempfile::tempfile().expect("texture");
        let fence = tempfile::tempfile().expect("fence");
        let frame_config = Config::new(PixelSize::new(64, 64));
        let layers = [LayerConfig::new(1, PixelRect::new(0, 0, 64, 64))];

        let mut infos = Vec::new();
        for _ in 0..3 {
            let mut guard = writer.lock().expect("lock");
            let frame = guard.begin_frame();
            infos.push(frame.info());
            frame.submit(&frame_config, &layers, texture.as_fd(), fence.as_fd());
        }
        assert_eq!(
            infos,
            vec![
                NextFrameInfo { texture_index: 1, fence_value: 1 },
                NextFrameInfo { texture_index: 0, fence_value: 1 },
                NextFrameInfo { texture_index: 1, fence_value: 2 },
            ]
        );

        let header = writer.lock().expect("lock").metadata();
        assert_eq!(header.frame_number(), 3);
        assert_eq!(header.fence_value(header.swapchain_index()), Some(2));
        drop(writer);
        cleanup(&config);
    }

    #[test]
    fn test_detach_starts_new_session() {
        let config = config("detach");
        let writer = Writer::new(&config, 1).expect("writer");
        let before = writer.session_id();
        {
            let mut guard = writer.lock().expect("lock");
            guard.submit_empty_frame();
            guard.detach();
            assert!(!guard.metadata().has_feeder());
        }
        assert_ne!(writer.session_id(), before);
        assert_eq!(writer.frame_count_for_metrics(), 0);
        drop(writer);
        cleanup(&config);
    }

    #[test]
    #[should_panic(expected = "never submitted")]
    fn test_dropping_unsubmitted_frame_panics() {
        let config = config("unsubmitted");
        let writer = Writer::new(&config, 1).expect("writer");
        let mut guard = writer.lock().expect("lock");
        let _frame = guard.begin_frame();
    }
}
