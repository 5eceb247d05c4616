//! Consumer side: reading frames out of the shared region.
//!
//! A read copies the header by value under the lock and releases the lock
//! before touching the GPU. Everything after that works on the private
//! copy: checking the adapter, duplicating the feeder's handles for the
//! frame's swapchain slot and handing them to the [`TextureCopier`].
//!
//! Duplicated handles are cached per slot and reused while the feeder keeps
//! publishing the same raw values; a session change drops all of them.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::active_consumers::{ActiveConsumers, ConsumerKind};
use crate::config::ShmConfig;
use crate::handles::IpcHandles;
use crate::layout::{FrameMetadata, RenderCacheKey};
use crate::naming::ShmNames;
use crate::platform::FeederProcess;
use crate::region::{LockMode, RegionGuard, SharedRegion};
use crate::snapshot::{Snapshot, SnapshotState};
use crate::state_machine::ReaderState;
use crate::texture::{CopyError, TextureCopier};
use crate::{Result, SWAPCHAIN_LENGTH, ShmError};

/// Where [`Reader::maybe_get_uncached`] should put the pixels.
pub struct CopyTarget<'a, C: TextureCopier> {
    /// LUID of the consumer's GPU adapter
    pub gpu_luid: u64,
    /// Copier for the consumer's graphics API
    pub copier: &'a C,
    /// Texture to copy into
    pub destination: &'a Arc<C::Texture>,
}

/// Result of copying the header out under the lock.
pub(crate) enum Capture {
    /// A try-lock found the lock held.
    Busy,
    /// No usable frame: no feeder, a corrupt header, or an abandoned lock.
    Empty,
    /// A validated header with a feeder attached.
    Frame(Arc<FrameMetadata>),
}

/// A consumer's handle on the shared region.
pub struct Reader {
    region: SharedRegion<ReaderState>,
    session_id: u64,
    feeder: Option<(u32, FeederProcess)>,
    ipc: [Option<IpcHandles>; SWAPCHAIN_LENGTH],
}

impl Reader {
    /// Create or open the region. A reader started before any writer still
    /// finds the feeder once it attaches.
    pub fn open(config: &ShmConfig) -> Result<Self> {
        let region = SharedRegion::open(config)?;
        info!("Reader opened {}", region.names());
        Ok(Self {
            region,
            session_id: 0,
            feeder: None,
            ipc: Default::default(),
        })
    }

    /// Names of the region's OS objects.
    pub const fn names(&self) -> &ShmNames {
        self.region.names()
    }

    /// Whether a feeder is attached, read without the lock.
    pub fn is_attached(&self) -> bool {
        self.region.peek_has_feeder()
    }

    /// Session id and frame number, read without the lock, for deciding
    /// whether a fetch is worth it. Records `kind` as active.
    pub fn render_cache_key(&self, kind: ConsumerKind) -> RenderCacheKey {
        ActiveConsumers::set(kind);
        self.region.peek_render_cache_key()
    }

    /// Session id currently in the header.
    pub fn session_id(&self) -> u64 {
        self.region.peek_render_cache_key().session_id
    }

    /// Frame counter, read without the lock. For metrics only.
    pub fn frame_count_for_metrics(&self) -> u64 {
        self.region.peek_render_cache_key().frame_number
    }

    /// Block until the lock is held.
    pub fn lock(&self) -> Result<ReaderGuard<'_>> {
        self.lock_region(LockMode::Blocking)?
            .map(|region| ReaderGuard { region })
            .ok_or_else(|| ShmError::Lock(format!("blocking lock of {} was busy", self.names())))
    }

    /// Take the lock if it is free.
    pub fn try_lock(&self) -> Result<Option<ReaderGuard<'_>>> {
        Ok(self
            .lock_region(LockMode::Try)?
            .map(|region| ReaderGuard { region }))
    }

    /// Lock the region. If the previous holder died with the lock, the
    /// header it may have half-written is replaced by an empty session, so
    /// every reader sees "no feeder" until the writer publishes again.
    fn lock_region(&self, mode: LockMode) -> Result<Option<RegionGuard<'_, ReaderState>>> {
        let Some(guard) = self.region.lock(mode)? else {
            return Ok(None);
        };
        if guard.was_abandoned() {
            let abandoned = guard.read_header();
            let header = FrameMetadata::new_session(abandoned.gpu_luid());
            guard.write_header(&header);
            warn!(
                "Lock on {} was abandoned; dropped frame {} of session {:#018x}",
                self.names(),
                abandoned.frame_number(),
                abandoned.session_id()
            );
        }
        Ok(Some(guard))
    }

    /// Lock, copy the header, validate it and track the feeder session.
    pub(crate) fn capture(&mut self, mode: LockMode) -> Result<Capture> {
        let header = {
            let Some(guard) = self.lock_region(mode)? else {
                return Ok(Capture::Busy);
            };
            guard
                .machine()
                .transition(ReaderState::Locked, ReaderState::CopyingHeader);
            let header = guard.read_header();
            guard
                .machine()
                .transition(ReaderState::CopyingHeader, ReaderState::Locked);
            header
        };

        if header.session_id() != self.session_id {
            info!(
                "Feeder session changed on {}: {:#018x} -> {:#018x}",
                self.names(),
                self.session_id,
                header.session_id()
            );
            self.session_id = header.session_id();
            self.release_feeder();
        }

        if !header.has_feeder() {
            return Ok(Capture::Empty);
        }
        if let Err(e) = header.validate() {
            warn!("Ignoring corrupt header in {}: {e}", self.names());
            return Ok(Capture::Empty);
        }
        Ok(Capture::Frame(Arc::new(header)))
    }

    /// Turn a captured header into a snapshot, copying the texture if
    /// there is one. `destination` supplies the texture to copy into.
    pub(crate) fn resolve<C, F>(
        &mut self,
        header: Arc<FrameMetadata>,
        gpu_luid: u64,
        copier: &C,
        destination: F,
    ) -> Snapshot<C::Texture>
    where
        C: TextureCopier,
        F: FnOnce(&FrameMetadata) -> std::result::Result<Arc<C::Texture>, CopyError>,
    {
        if header.gpu_luid() != gpu_luid {
            debug!(
                "Feeder is on adapter {:#x}, consumer on {gpu_luid:#x}",
                header.gpu_luid()
            );
            return Snapshot::with_state(SnapshotState::IncorrectGpu);
        }
        if header.layer_count() == 0 {
            return Snapshot::without_texture(header);
        }

        let slot = header.swapchain_index();
        let fence_value = header.fence_value(slot).unwrap_or_default();
        if let Err(e) = self.ensure_ipc_handles(&header, slot) {
            warn!("Failed to duplicate feeder handles: {e}");
            self.feeder = None;
            return Snapshot::with_state(SnapshotState::IpcHandleError);
        }

        let destination = match destination(&header) {
            Ok(texture) => texture,
            Err(e) => {
                warn!("No destination texture for slot {slot}: {e}");
                return Snapshot::with_state(SnapshotState::IpcHandleError);
            }
        };

        let copied = match &self.ipc[slot] {
            Some(handles) => copier.copy(
                handles.texture.as_borrowed(),
                handles.fence.as_borrowed(),
                fence_value,
                &destination,
            ),
            None => Err(CopyError::Import(format!("no handles for slot {slot}"))),
        };
        match copied {
            Ok(()) => {}
            Err(CopyError::FenceWait(e)) => {
                warn!(
                    "Fence wait for slot {slot} (value {fence_value}) failed; using the texture as is: {e}"
                );
            }
            Err(e) => {
                warn!("Texture copy from slot {slot} failed: {e}");
                self.ipc[slot] = None;
                return Snapshot::with_state(SnapshotState::IpcHandleError);
            }
        }

        Snapshot::with_texture(header, destination)
    }

    /// Make sure `self.ipc[slot]` holds duplicates of the header's handles.
    fn ensure_ipc_handles(&mut self, header: &FrameMetadata, slot: usize) -> Result<()> {
        let texture = header.texture_handle();
        let fence = header.fence_handle();
        if self.ipc[slot]
            .as_ref()
            .is_some_and(|handles| handles.matches(texture, fence))
        {
            return Ok(());
        }

        let pid = header.feeder_process_id();
        if self
            .feeder
            .as_ref()
            .is_none_or(|(feeder_pid, _)| *feeder_pid != pid)
        {
            debug!("Opening feeder process {pid}");
            self.feeder = Some((pid, FeederProcess::open(pid)?));
        }
        let Some((_, process)) = &self.feeder else {
            return Err(ShmError::HandleDuplication(format!("feeder {pid} not open")));
        };

        let handles = IpcHandles {
            foreign_texture: texture,
            foreign_fence: fence,
            texture: process.duplicate(texture)?,
            fence: process.duplicate(fence)?,
        };
        debug!(
            "Duplicated texture {:#x} and fence {:#x} for slot {slot}",
            texture.as_raw(),
            fence.as_raw()
        );
        self.ipc[slot] = Some(handles);
        Ok(())
    }

    fn release_feeder(&mut self) {
        self.feeder = None;
        self.ipc = Default::default();
    }

    /// Read the current frame and copy its texture into
    /// `target.destination`, waiting for the lock if necessary.
    pub fn maybe_get_uncached<C: TextureCopier>(
        &mut self,
        target: CopyTarget<'_, C>,
        kind: ConsumerKind,
    ) -> Snapshot<C::Texture> {
        ActiveConsumers::set(kind);
        let header = match self.capture(LockMode::Blocking) {
            Ok(Capture::Frame(header)) => header,
            Ok(Capture::Busy | Capture::Empty) => return Snapshot::empty(),
            Err(e) => {
                warn!("Failed to read {}: {e}", self.names());
                return Snapshot::empty();
            }
        };
        let destination = Arc::clone(target.destination);
        self.resolve(header, target.gpu_luid, target.copier, move |_| {
            Ok(destination)
        })
    }

    /// Read the current frame's metadata only; no handles are duplicated
    /// and no texture is copied.
    pub fn maybe_get_metadata_uncached<T>(&mut self, kind: ConsumerKind) -> Snapshot<T> {
        ActiveConsumers::set(kind);
        self.metadata_snapshot(LockMode::Blocking)
    }

    pub(crate) fn metadata_snapshot<T>(&mut self, mode: LockMode) -> Snapshot<T> {
        match self.capture(mode) {
            Ok(Capture::Frame(header)) => Snapshot::without_texture(header),
            Ok(Capture::Busy | Capture::Empty) => Snapshot::empty(),
            Err(e) => {
                warn!("Failed to read {}: {e}", self.names());
                Snapshot::empty()
            }
        }
    }
}

/// A reader's lock on the region.
pub struct ReaderGuard<'r> {
    region: RegionGuard<'r, ReaderState>,
}

impl ReaderGuard<'_> {
    /// A copy of the header.
    pub fn metadata(&self) -> FrameMetadata {
        self.region
            .machine()
            .transition(ReaderState::Locked, ReaderState::CopyingHeader);
        let header = self.region.read_header();
        self.region
            .machine()
            .transition(ReaderState::CopyingHeader, ReaderState::Locked);
        header
    }

    /// Whether the previous holder died holding the lock.
    pub const fn was_abandoned(&self) -> bool {
        self.region.was_abandoned()
    }
}
