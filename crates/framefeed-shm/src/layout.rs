//! Wire format of the shared region.
//!
//! [`FrameMetadata`] sits at offset 0 of the mapping and is read and written
//! by unrelated processes, so every type here is `#[repr(C)]`, pointer-free
//! and valid for any bit pattern (no `bool`, no enums; flags are raw `u32`).
//! Explicit `_reserved` fields fill what would otherwise be implicit
//! padding.
//!
//! Layout of [`FrameMetadata`] (little-endian, 1408 bytes):
//!
//! | Offset | Size | Field                      |
//! |--------|------|----------------------------|
//! | 0x000  | 8    | magic (`"FFShmHdr"`)       |
//! | 0x008  | 8    | GPU adapter LUID           |
//! | 0x010  | 8    | frame number               |
//! | 0x018  | 8    | session id                 |
//! | 0x020  | 4    | header flags (+4 reserved) |
//! | 0x028  | 40   | [`Config`]                 |
//! | 0x050  | 1    | layer count (+7 reserved)  |
//! | 0x058  | 1280 | 16 × [`LayerConfig`]       |
//! | 0x558  | 4    | feeder pid (+4 reserved)   |
//! | 0x560  | 8    | texture handle             |
//! | 0x568  | 8    | fence handle               |
//! | 0x570  | 16   | fence-ready values, 16-aligned |

use std::mem::{align_of, offset_of, size_of};

use bitflags::bitflags;
use rand::{RngExt, rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handles::ForeignHandle;
use crate::{MAX_VIEW_COUNT, SWAPCHAIN_LENGTH};

/// Sentinel separating a real header from freshly zeroed memory.
pub const MAGIC: [u8; 8] = *b"FFShmHdr";

bitflags! {
    /// Bits of [`FrameMetadata`]'s flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u32 {
        /// A writer is alive and has published since attaching.
        const FEEDER_ATTACHED = 1 << 0;
    }
}

bitflags! {
    /// Bits of [`LayerConfig::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LayerFlags: u32 {
        /// The layer is placed in VR space using [`LayerConfig::vr`].
        const VR_ENABLED = 1 << 0;
        /// Zoom the layer while the user looks at it.
        const GAZE_ZOOM = 1 << 1;
    }
}

/// Size in pixels.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelSize {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl PixelSize {
    /// Create a size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero.
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Position in pixels.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelPoint {
    /// Horizontal offset
    pub x: u32,
    /// Vertical offset
    pub y: u32,
}

/// Rectangle in pixels.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    /// Top-left corner
    pub origin: PixelPoint,
    /// Extent
    pub size: PixelSize,
}

impl PixelRect {
    /// Create a rectangle.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            origin: PixelPoint { x, y },
            size: PixelSize { width, height },
        }
    }

    /// Whether the rectangle lies entirely within `bounds` (anchored at 0,0).
    pub fn fits_within(&self, bounds: PixelSize) -> bool {
        let right = self.origin.x.checked_add(self.size.width);
        let bottom = self.origin.y.checked_add(self.size.height);
        matches!((right, bottom), (Some(r), Some(b)) if r <= bounds.width && b <= bounds.height)
    }
}

/// Position and orientation in VR space. Metres and radians.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VrPose {
    /// Right
    pub x: f32,
    /// Up
    pub y: f32,
    /// Backwards
    pub z: f32,
    /// Pitch
    pub rx: f32,
    /// Yaw
    pub ry: f32,
    /// Roll
    pub rz: f32,
}

/// Layer opacity in VR.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VrOpacity {
    /// Opacity while not looked at
    pub normal: f32,
    /// Opacity while looked at
    pub gaze: f32,
}

impl Default for VrOpacity {
    fn default() -> Self {
        Self {
            normal: 1.0,
            gaze: 1.0,
        }
    }
}

/// Per-layer VR placement.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VrLayer {
    /// Pose of the layer's centre
    pub pose: VrPose,
    /// Width and height in metres
    pub physical_size: [f32; 2],
    /// Magnification applied with [`LayerFlags::GAZE_ZOOM`]
    pub zoom_scale: f32,
    /// Scale of the gaze hit-test target relative to the layer
    pub gaze_target_scale: f32,
    /// Opacity
    pub opacity: VrOpacity,
}

impl Default for VrLayer {
    fn default() -> Self {
        Self {
            pose: VrPose::default(),
            physical_size: [0.0; 2],
            zoom_scale: 2.0,
            gaze_target_scale: 1.0,
            opacity: VrOpacity::default(),
        }
    }
}

/// Frame-wide configuration published with each frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Layer that currently receives input, for consumers that highlight it
    pub global_input_layer_id: u64,
    /// Pixel size of the shared texture
    pub texture_size: PixelSize,
    /// RGBA multiplier applied when compositing
    pub tint: [f32; 4],
    /// Reserved for frame-wide flags; currently zero
    pub flags: u32,
    #[serde(skip)]
    _reserved: u32,
}

impl Config {
    /// Create a configuration for a texture of the given size.
    pub fn new(texture_size: PixelSize) -> Self {
        Self {
            texture_size,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global_input_layer_id: 0,
            texture_size: PixelSize::default(),
            tint: [1.0; 4],
            flags: 0,
            _reserved: 0,
        }
    }
}

/// Placement and metadata of one layer within a frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Stable identifier of the layer
    pub layer_id: u64,
    /// Raw [`LayerFlags`]
    pub flags: u32,
    /// Opacity for flat (non-VR) consumers
    pub opacity: f32,
    /// Where the layer's pixels are within the shared texture
    pub location_on_texture: PixelRect,
    /// VR placement, used with [`LayerFlags::VR_ENABLED`]
    pub vr: VrLayer,
}

impl LayerConfig {
    /// Create a flat layer at `location_on_texture`.
    pub fn new(layer_id: u64, location_on_texture: PixelRect) -> Self {
        Self {
            layer_id,
            location_on_texture,
            ..Self::default()
        }
    }

    /// Decoded flags; unknown bits are dropped.
    pub const fn layer_flags(&self) -> LayerFlags {
        LayerFlags::from_bits_truncate(self.flags)
    }

    /// Replace the flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: LayerFlags) -> Self {
        self.flags = flags.bits();
        self
    }
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            layer_id: 0,
            flags: 0,
            opacity: 1.0,
            location_on_texture: PixelRect::default(),
            vr: VrLayer::default(),
        }
    }
}

/// Per-slot fence values, aligned so they can be updated atomically.
#[repr(C, align(16))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FenceValues(pub [u64; SWAPCHAIN_LENGTH]);

/// Cheap "has anything changed" token: session id plus frame number.
///
/// The session id is random per writer attachment, so the key changes even
/// when a restarted feeder counts frames from zero again.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderCacheKey {
    /// Session the frame belongs to
    pub session_id: u64,
    /// Frame number within the session
    pub frame_number: u64,
}

impl RenderCacheKey {
    /// Whether this is the key of an empty region.
    pub const fn is_empty(&self) -> bool {
        self.session_id == 0 && self.frame_number == 0
    }
}

/// Reasons a header copied out of shared memory cannot be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// The magic does not match; the region was never written or was reset.
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 8]),
    /// More layers than the inline array holds.
    #[error("layer count {0} exceeds maximum {MAX_VIEW_COUNT}")]
    TooManyLayers(u8),
    /// A frame with layers has no texture.
    #[error("frame has {0} layers but an empty texture")]
    EmptyTexture(u8),
    /// A layer lies outside the texture.
    #[error("layer {index} rect {rect:?} exceeds texture {texture:?}")]
    LayerOutOfBounds {
        /// Index of the layer
        index: usize,
        /// The layer's rectangle
        rect: PixelRect,
        /// Size of the texture
        texture: PixelSize,
    },
}

/// Header of the shared region; the frame exchange's wire format.
///
/// Values of this type are always private copies; the region itself is
/// only touched through the lock.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct FrameMetadata {
    magic: [u8; 8],
    gpu_luid: u64,
    frame_number: u64,
    session_id: u64,
    flags: u32,
    _reserved0: u32,
    config: Config,
    layer_count: u8,
    _reserved1: [u8; 7],
    layers: [LayerConfig; MAX_VIEW_COUNT],
    feeder_process_id: u32,
    _reserved2: u32,
    texture: u64,
    fence: u64,
    frame_ready_fence_values: FenceValues,
}

const _: () = {
    assert!(align_of::<FrameMetadata>() == 16);
    assert!(size_of::<FrameMetadata>() % 16 == 0);
    assert!(offset_of!(FrameMetadata, frame_number) % 8 == 0);
    assert!(offset_of!(FrameMetadata, session_id) % 8 == 0);
    assert!(offset_of!(FrameMetadata, flags) % 4 == 0);
    assert!(offset_of!(FrameMetadata, gpu_luid) % 8 == 0);
    assert!(offset_of!(FrameMetadata, _reserved0) == offset_of!(FrameMetadata, flags) + 4);
    assert!(offset_of!(FrameMetadata, texture) % 8 == 0);
    assert!(offset_of!(FrameMetadata, fence) % 8 == 0);
    assert!(offset_of!(FrameMetadata, frame_ready_fence_values) % 16 == 0);
    assert!(MAX_VIEW_COUNT <= u8::MAX as usize);
};

/// Byte offsets used for lock-free field access on the live mapping.
pub(crate) mod offsets {
    use super::FrameMetadata;
    use std::mem::offset_of;

    pub const GPU_LUID: usize = offset_of!(FrameMetadata, gpu_luid);
    pub const FRAME_NUMBER: usize = offset_of!(FrameMetadata, frame_number);
    pub const SESSION_ID: usize = offset_of!(FrameMetadata, session_id);
    pub const FLAGS: usize = offset_of!(FrameMetadata, flags);
    pub const MAGIC: usize = offset_of!(FrameMetadata, magic);
    pub const FENCE_VALUES: usize = offset_of!(FrameMetadata, frame_ready_fence_values);
    /// Everything from here on is only touched under the lock.
    pub const BODY: usize = offset_of!(FrameMetadata, _reserved0);
}

/// Create a session id: the process id in the high half, random low half.
pub fn create_session_id() -> u64 {
    (u64::from(std::process::id()) << 32) | u64::from(rng().random::<u32>())
}

impl FrameMetadata {
    /// Byte size of the header; part of the region name.
    pub const SIZE: usize = size_of::<Self>();

    /// A header with valid magic, a new session id and no feeder attached.
    pub fn new_session(gpu_luid: u64) -> Self {
        Self {
            magic: MAGIC,
            gpu_luid,
            frame_number: 0,
            session_id: create_session_id(),
            flags: 0,
            _reserved0: 0,
            config: Config::default(),
            layer_count: 0,
            _reserved1: [0; 7],
            layers: [LayerConfig::default(); MAX_VIEW_COUNT],
            feeder_process_id: 0,
            _reserved2: 0,
            texture: 0,
            fence: 0,
            frame_ready_fence_values: FenceValues::default(),
        }
    }

    /// Check everything a reader relies on.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.magic != MAGIC {
            return Err(HeaderError::BadMagic(self.magic));
        }
        if usize::from(self.layer_count) > MAX_VIEW_COUNT {
            return Err(HeaderError::TooManyLayers(self.layer_count));
        }
        if self.layer_count == 0 {
            return Ok(());
        }
        let texture = self.config.texture_size;
        if texture.is_empty() {
            return Err(HeaderError::EmptyTexture(self.layer_count));
        }
        for (index, layer) in self.layers().iter().enumerate() {
            if !layer.location_on_texture.fits_within(texture) {
                return Err(HeaderError::LayerOutOfBounds {
                    index,
                    rect: layer.location_on_texture,
                    texture,
                });
            }
        }
        Ok(())
    }

    /// Whether the magic matches and the feeder-attached bit is set.
    pub fn has_feeder(&self) -> bool {
        self.magic == MAGIC && self.header_flags().contains(HeaderFlags::FEEDER_ATTACHED)
    }

    /// Session id plus frame number.
    pub const fn render_cache_key(&self) -> RenderCacheKey {
        RenderCacheKey {
            session_id: self.session_id,
            frame_number: self.frame_number,
        }
    }

    /// Swapchain slot of the current frame.
    pub const fn swapchain_index(&self) -> usize {
        (self.frame_number % SWAPCHAIN_LENGTH as u64) as usize
    }

    /// Fence value the texture in `slot` will reach when ready.
    pub fn fence_value(&self, slot: usize) -> Option<u64> {
        self.frame_ready_fence_values.0.get(slot).copied()
    }

    /// Raw magic bytes.
    pub const fn magic(&self) -> [u8; 8] {
        self.magic
    }

    /// LUID of the adapter the feeder's texture lives on.
    pub const fn gpu_luid(&self) -> u64 {
        self.gpu_luid
    }

    /// Frame counter; increments on every submit, including empty frames.
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Current session id.
    pub const fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Decoded header flags; unknown bits are dropped.
    pub const fn header_flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags)
    }

    /// Frame-wide configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Number of layers, as stored. May exceed [`MAX_VIEW_COUNT`] in a
    /// corrupt header; [`Self::layers`] never does.
    pub const fn layer_count(&self) -> u8 {
        self.layer_count
    }

    /// The published layers, clamped to the inline array.
    pub fn layers(&self) -> &[LayerConfig] {
        let count = usize::from(self.layer_count).min(MAX_VIEW_COUNT);
        &self.layers[..count]
    }

    /// Process id of the feeder.
    pub const fn feeder_process_id(&self) -> u32 {
        self.feeder_process_id
    }

    /// Texture handle, valid only inside the feeder process.
    pub const fn texture_handle(&self) -> ForeignHandle {
        ForeignHandle::from_raw(self.texture)
    }

    /// Fence handle, valid only inside the feeder process.
    pub const fn fence_handle(&self) -> ForeignHandle {
        ForeignHandle::from_raw(self.fence)
    }

    /// Store a published frame. The caller holds the lock and has checked
    /// the layer bound.
    pub(crate) fn store_frame(
        &mut self,
        gpu_luid: u64,
        feeder_process_id: u32,
        config: &Config,
        layers: &[LayerConfig],
        texture: ForeignHandle,
        fence: ForeignHandle,
    ) {
        debug_assert!(layers.len() <= MAX_VIEW_COUNT);
        self.gpu_luid = gpu_luid;
        self.config = *config;
        self.frame_number = self.frame_number.wrapping_add(1);
        self.flags |= HeaderFlags::FEEDER_ATTACHED.bits();
        self.feeder_process_id = feeder_process_id;
        self.texture = texture.as_raw();
        self.fence = fence.as_raw();
        self.layer_count = layers.len() as u8;
        self.layers = [LayerConfig::default(); MAX_VIEW_COUNT];
        self.layers[..layers.len()].copy_from_slice(layers);
    }

    /// Store an empty frame: feeder alive, nothing to show.
    pub(crate) fn store_empty_frame(&mut self, gpu_luid: u64, feeder_process_id: u32) {
        self.gpu_luid = gpu_luid;
        self.frame_number = self.frame_number.wrapping_add(1);
        self.flags |= HeaderFlags::FEEDER_ATTACHED.bits();
        self.feeder_process_id = feeder_process_id;
        self.texture = 0;
        self.fence = 0;
        self.layer_count = 0;
        self.layers = [LayerConfig::default(); MAX_VIEW_COUNT];
    }
}
