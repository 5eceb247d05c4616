//! A reader for fixed-cadence render loops.
//!
//! [`CachedReader::maybe_get`] compares the lock-free render cache key with
//! the key of the last snapshot it returned and hands that snapshot back
//! when nothing changed, without locking, duplicating or copying. Only a
//! new key takes the (non-blocking) lock.
//!
//! Destination textures come from a small ring, one per swapchain slot of
//! the consumer, created lazily through the [`TextureCopier`] and recreated
//! when the frame's texture size changes. The ring advances after every
//! successful copy so the texture behind the previous snapshot is not
//! written while the caller may still be drawing it.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::active_consumers::{ActiveConsumers, ConsumerKind};
use crate::config::ShmConfig;
use crate::layout::PixelSize;
use crate::reader::{Capture, Reader};
use crate::region::LockMode;
use crate::snapshot::{Snapshot, SnapshotState};
use crate::texture::{CopyError, TextureCopier};
use crate::Result;

struct ClientTexture<T> {
    size: PixelSize,
    texture: Arc<T>,
}

/// A [`Reader`] plus a snapshot cache and a destination texture ring.
pub struct CachedReader<C: TextureCopier> {
    reader: Reader,
    copier: C,
    kind: ConsumerKind,
    gpu_luid: u64,
    ring: Vec<Option<ClientTexture<C::Texture>>>,
    next_index: usize,
    cache: Snapshot<C::Texture>,
}

impl<C: TextureCopier> CachedReader<C> {
    /// Wrap an open reader.
    ///
    /// [`Self::initialize_cache`] must be called before [`Self::maybe_get`]
    /// returns anything.
    pub fn new(reader: Reader, copier: C, kind: ConsumerKind) -> Self {
        Self {
            reader,
            copier,
            kind,
            gpu_luid: 0,
            ring: Vec::new(),
            next_index: 0,
            cache: Snapshot::empty(),
        }
    }

    /// Open the region and wrap it.
    pub fn open(config: &ShmConfig, copier: C, kind: ConsumerKind) -> Result<Self> {
        Ok(Self::new(Reader::open(config)?, copier, kind))
    }

    /// Set the consumer's adapter and ring size, dropping every cached
    /// texture and snapshot. Call again when the consumer's device or
    /// swapchain changes.
    pub fn initialize_cache(&mut self, gpu_luid: u64, swapchain_length: u8) {
        debug!(
            "Initializing cache for adapter {gpu_luid:#x} with {swapchain_length} textures"
        );
        self.gpu_luid = gpu_luid;
        self.ring = (0..swapchain_length).map(|_| None).collect();
        self.next_index = 0;
        self.cache = Snapshot::empty();
    }

    /// The wrapped reader.
    pub const fn reader(&self) -> &Reader {
        &self.reader
    }

    /// The copier.
    pub const fn copier(&self) -> &C {
        &self.copier
    }

    /// Latest frame, from the cache when the key is unchanged.
    ///
    /// Never blocks on the lock: if it is held, the previous snapshot is
    /// returned.
    pub fn maybe_get(&mut self) -> Snapshot<C::Texture> {
        if !self.reader.is_attached() {
            self.cache = Snapshot::empty();
            return Snapshot::empty();
        }
        if self.ring.is_empty() {
            error!("CachedReader::maybe_get called before initialize_cache");
            return Snapshot::empty();
        }

        let key = self.reader.render_cache_key(self.kind);
        if self.cache.is_valid() && self.cache.render_cache_key() == key {
            debug!("Cache hit for frame {}", key.frame_number);
            return self.cache.clone();
        }

        let header = match self.reader.capture(LockMode::Try) {
            Ok(Capture::Frame(header)) => header,
            Ok(Capture::Busy | Capture::Empty) => return self.cache.clone(),
            Err(e) => {
                warn!("Failed to read {}: {e}", self.reader.names());
                return self.cache.clone();
            }
        };
        debug!("Cache miss for frame {}", header.frame_number());

        let index = self.next_index;
        let copier = &self.copier;
        let ring = &mut self.ring;
        let snapshot = self.reader.resolve(header, self.gpu_luid, copier, |header| {
            client_texture(copier, ring, index, header.config().texture_size)
        });

        match snapshot.state() {
            SnapshotState::ValidWithTexture | SnapshotState::ValidWithoutTexture => {
                let previous = self.cache.sequence_number_for_debugging();
                let current = snapshot.sequence_number_for_debugging();
                if self.cache.is_valid()
                    && self.cache.render_cache_key().session_id
                        == snapshot.render_cache_key().session_id
                    && current < previous
                {
                    warn!("Frame number went backwards: {previous} -> {current}");
                }
                if snapshot.has_texture() {
                    self.next_index = (index + 1) % self.ring.len();
                }
                ActiveConsumers::set(self.kind);
                self.cache = snapshot.clone();
                snapshot
            }
            SnapshotState::Empty => self.cache.clone(),
            SnapshotState::IncorrectGpu | SnapshotState::IpcHandleError => snapshot,
        }
    }

    /// Latest frame's metadata without touching the GPU or the texture
    /// cache. Never blocks on the lock.
    pub fn maybe_get_metadata(&mut self) -> Snapshot<C::Texture> {
        ActiveConsumers::set(self.kind);
        self.reader.metadata_snapshot(LockMode::Try)
    }
}

/// The ring texture at `index`, (re)created if missing or the wrong size.
fn client_texture<C: TextureCopier>(
    copier: &C,
    ring: &mut [Option<ClientTexture<C::Texture>>],
    index: usize,
    size: PixelSize,
) -> std::result::Result<Arc<C::Texture>, CopyError> {
    let slot = ring
        .get_mut(index)
        .ok_or_else(|| CopyError::Allocation(format!("no ring slot {index}")))?;
    if let Some(existing) = slot.as_ref()
        && existing.size == size
    {
        return Ok(Arc::clone(&existing.texture));
    }

    let swapchain_index = u8::try_from(index)
        .map_err(|_| CopyError::Allocation(format!("ring slot {index} out of range")))?;
    debug!(
        "Creating client texture {index} ({}x{})",
        size.width, size.height
    );
    let texture = Arc::new(copier.create_client_texture(swapchain_index, size)?);
    *slot = Some(ClientTexture {
        size,
        texture: Arc::clone(&texture),
    });
    Ok(texture)
}
