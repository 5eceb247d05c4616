//! Immutable results of a read.

use std::sync::Arc;

use crate::layout::{Config, FrameMetadata, LayerConfig, RenderCacheKey};

/// What a [`Snapshot`] contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotState {
    /// No feeder, no lock, or nothing usable yet.
    Empty,
    /// The feeder renders on a different GPU adapter than the consumer.
    IncorrectGpu,
    /// The feeder's handles could not be duplicated or imported.
    IpcHandleError,
    /// A live feeder published a frame without layers.
    ValidWithoutTexture,
    /// A frame whose pixels were copied into the consumer's texture.
    ValidWithTexture,
}

impl SnapshotState {
    /// Whether the state carries frame metadata worth rendering.
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::ValidWithoutTexture | Self::ValidWithTexture)
    }
}

/// One read of the shared region: a private header copy plus, if a texture
/// was copied, the consumer texture holding its pixels.
///
/// Cheap to clone; the header and texture are shared.
#[derive(Debug)]
pub struct Snapshot<T> {
    header: Option<Arc<FrameMetadata>>,
    texture: Option<Arc<T>>,
    state: SnapshotState,
}

// Derived Clone would require `T: Clone`.
impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            texture: self.texture.clone(),
            state: self.state,
        }
    }
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Snapshot<T> {
    /// A snapshot with no contents.
    pub const fn empty() -> Self {
        Self {
            header: None,
            texture: None,
            state: SnapshotState::Empty,
        }
    }

    /// A snapshot that carries only a state.
    pub(crate) const fn with_state(state: SnapshotState) -> Self {
        Self {
            header: None,
            texture: None,
            state,
        }
    }

    /// A valid snapshot without pixels.
    pub(crate) fn without_texture(header: Arc<FrameMetadata>) -> Self {
        Self {
            header: Some(header),
            texture: None,
            state: SnapshotState::ValidWithoutTexture,
        }
    }

    /// A valid snapshot with pixels in `texture`.
    pub(crate) fn with_texture(header: Arc<FrameMetadata>, texture: Arc<T>) -> Self {
        Self {
            header: Some(header),
            texture: Some(texture),
            state: SnapshotState::ValidWithTexture,
        }
    }

    /// What this snapshot contains.
    pub const fn state(&self) -> SnapshotState {
        self.state
    }

    /// Whether it carries a frame.
    pub const fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    /// Whether it carries a copied texture.
    pub const fn has_texture(&self) -> bool {
        matches!(self.state, SnapshotState::ValidWithTexture)
    }

    /// The header copy, if any.
    pub fn metadata(&self) -> Option<&FrameMetadata> {
        self.header.as_deref()
    }

    /// Key of the frame, or the empty key.
    pub fn render_cache_key(&self) -> RenderCacheKey {
        self.metadata()
            .map(FrameMetadata::render_cache_key)
            .unwrap_or_default()
    }

    /// Frame number for logs; not a cache key on its own.
    pub fn sequence_number_for_debugging(&self) -> u64 {
        self.metadata().map_or(0, FrameMetadata::frame_number)
    }

    /// Frame configuration of a valid snapshot.
    pub fn config(&self) -> Option<&Config> {
        self.valid_metadata().map(FrameMetadata::config)
    }

    /// Number of layers; zero unless valid.
    pub fn layer_count(&self) -> usize {
        self.layers().len()
    }

    /// Layer `index` of a valid snapshot.
    pub fn layer_config(&self, index: usize) -> Option<&LayerConfig> {
        self.layers().get(index)
    }

    /// All layers of a valid snapshot.
    pub fn layers(&self) -> &[LayerConfig] {
        self.valid_metadata().map_or(&[], FrameMetadata::layers)
    }

    /// The consumer texture holding the frame's pixels.
    pub fn texture(&self) -> Option<&Arc<T>> {
        self.texture.as_ref()
    }

    fn valid_metadata(&self) -> Option<&FrameMetadata> {
        if self.is_valid() { self.metadata() } else { None }
    }
}
