//! Cross-process shared-memory frame exchange for overlay feeders.
//!
//! A feeder process (usually code running inside a game) publishes rendered
//! overlay frames into a small named shared-memory region; any number of
//! consumer processes read the latest frame from it and import the feeder's
//! GPU texture and fence through OS handle duplication. Nothing is copied
//! through disk or sockets, and only the latest frame matters: readers may
//! skip frames.
//!
//! # Architecture
//!
//! - [`FrameMetadata`]: the flat `#[repr(C)]` header at offset 0 of the
//!   region. It is the wire format, so every process must agree on its
//!   layout; the struct size is part of the region name.
//! - [`Writer`]: the single feeder. Publishes frames while holding the
//!   cross-process lock.
//! - [`Reader`]: a consumer. Copies the header under the lock, tracks the
//!   feeder session and duplicates the feeder's handles into this process.
//! - [`CachedReader`]: a reader for fixed-cadence render loops that skips
//!   the lock entirely when nothing changed and owns a ring of destination
//!   textures.
//! - [`Snapshot`]: the immutable result of a read.
//!
//! GPU APIs never appear here; they plug in through [`TextureCopier`].
//!
//! # Example
//!
//! ```rust,ignore
//! use framefeed_shm::{ConsumerKind, ShmConfig, Writer};
//!
//! let config = ShmConfig::default();
//! let writer = Writer::new(&config, gpu_luid)?;
//! {
//!     let mut guard = writer.lock()?;
//!     let frame = guard.begin_frame();
//!     // ... render into the texture for `frame.info().texture_index`,
//!     // signal the fence to `frame.info().fence_value` ...
//!     frame.submit(&frame_config, &layers, texture.as_fd(), fence.as_fd());
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
compile_error!("framefeed-shm supports Linux and Windows only");

use thiserror::Error;

// Process-wide consumer diagnostics
pub mod active_consumers;

// Cached reader for render loops
pub mod cached_reader;

// Configuration
pub mod config;

// Cross-process handle types
pub mod handles;

// Wire format
pub mod layout;

// Region naming
pub mod naming;

// OS primitives
mod platform;

// Lock discipline over the mapped region
mod region;

// Consumer side
pub mod reader;

// Immutable read results
pub mod snapshot;

// Transition-table state machines
pub mod state_machine;

// GPU copy seam
pub mod texture;

// Feeder side
pub mod writer;

pub use active_consumers::{ActiveConsumers, ConsumerKind, ConsumerPattern};
pub use cached_reader::CachedReader;
pub use config::{ShmConfig, SoftwareVersion};
pub use handles::{BorrowedShareHandle, ForeignHandle, LocalHandle};
pub use layout::{
    Config, FrameMetadata, HeaderError, HeaderFlags, LayerConfig, LayerFlags, PixelPoint,
    PixelRect, PixelSize, RenderCacheKey, VrLayer, VrOpacity, VrPose,
};
pub use naming::ShmNames;
#[cfg(target_os = "linux")]
pub use platform::unlink_shared_objects;
pub use reader::{CopyTarget, Reader, ReaderGuard};
pub use snapshot::{Snapshot, SnapshotState};
pub use texture::{CopyError, TextureCopier};
pub use writer::{FrameInProgress, NextFrameInfo, Writer, WriterGuard};

/// Result type for shared-memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors that can occur while setting up or locking the shared region.
///
/// Conditions caused by the other process's lifecycle (feeder exited, GPU
/// mismatch, feeder restarting) are not errors; they are reported through
/// [`SnapshotState`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The shared mapping or its mutex could not be created or opened.
    #[error("Shared memory unavailable: {0}")]
    Unavailable(String),

    /// The OS rejected the computed object name.
    #[error("Invalid shared memory name: {0}")]
    InvalidName(String),

    /// The OS mutex reported an unexpected failure.
    #[error("Lock error: {0}")]
    Lock(String),

    /// Another process did not finish initializing a shared object in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A feeder handle could not be duplicated into this process.
    #[error("Handle duplication failed: {0}")]
    HandleDuplication(String),
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum number of layers in one published frame.
pub const MAX_VIEW_COUNT: usize = 16;

/// Number of feeder texture slots; slot = `frame_number % SWAPCHAIN_LENGTH`.
pub const SWAPCHAIN_LENGTH: usize = 2;

/// Default reverse-domain product identifier used in region names.
pub const DEFAULT_PRODUCT_ID: &str = "com.framefeed.overlay";
