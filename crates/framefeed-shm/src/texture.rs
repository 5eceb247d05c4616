//! The GPU seam.
//!
//! Readers never talk to a graphics API. A [`TextureCopier`] imports the
//! feeder's shared texture and fence, waits for the fence and copies the
//! pixels into a texture the consumer owns, so the feeder can reuse its
//! slot as soon as the copy is queued.

use thiserror::Error;

use crate::handles::BorrowedShareHandle;
use crate::layout::PixelSize;

/// Failures reported by a [`TextureCopier`].
///
/// Except for [`CopyError::FenceWait`], any of these makes the read report
/// [`SnapshotState::IpcHandleError`](crate::SnapshotState::IpcHandleError).
#[derive(Debug, Error)]
pub enum CopyError {
    /// The shared texture or fence could not be imported.
    #[error("Import failed: {0}")]
    Import(String),

    /// Waiting on the fence failed or timed out; the copy was still
    /// issued.
    #[error("Fence wait failed: {0}")]
    FenceWait(String),

    /// The destination texture could not be created.
    #[error("Texture allocation failed: {0}")]
    Allocation(String),
}

/// Copies a feeder texture into a consumer-owned texture.
pub trait TextureCopier {
    /// Consumer-side texture type.
    type Texture;

    /// Create a destination texture for ring slot `swapchain_index`.
    fn create_client_texture(
        &self,
        swapchain_index: u8,
        size: PixelSize,
    ) -> Result<Self::Texture, CopyError>;

    /// Wait until `fence` reaches `fence_value`, then copy `texture` into
    /// `destination`.
    ///
    /// The wait should be short. If it times out, copy anyway and return
    /// `Ok`: the pixels may be one frame stale, which is better than no
    /// frame. A [`CopyError::FenceWait`] returned after the copy was
    /// issued is treated the same way; any other error discards the frame
    /// and the duplicated handles.
    fn copy(
        &self,
        texture: BorrowedShareHandle<'_>,
        fence: BorrowedShareHandle<'_>,
        fence_value: u64,
        destination: &Self::Texture,
    ) -> Result<(), CopyError>;
}
