//! Handles crossing the process boundary.
//!
//! The feeder publishes its texture and fence as raw handle values that are
//! only meaningful inside the feeder process ([`ForeignHandle`]). A reader
//! duplicates them into its own process ([`LocalHandle`]) before a GPU API
//! may import them.

#[cfg(unix)]
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
#[cfg(windows)]
use std::os::windows::io::{AsHandle, AsRawHandle, BorrowedHandle, OwnedHandle};

/// Borrowed OS handle to a shareable GPU object in this process.
#[cfg(unix)]
pub type BorrowedShareHandle<'a> = BorrowedFd<'a>;

/// Borrowed OS handle to a shareable GPU object in this process.
#[cfg(windows)]
pub type BorrowedShareHandle<'a> = BorrowedHandle<'a>;

/// A handle value as seen by another process.
///
/// Never usable directly; duplicate it first.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForeignHandle(u64);

impl ForeignHandle {
    /// Wrap a raw value read from the header.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Record a handle of this process for publishing.
    #[cfg(unix)]
    pub fn from_borrowed(handle: BorrowedShareHandle<'_>) -> Self {
        // Valid descriptors are non-negative.
        Self(u64::from(handle.as_raw_fd().unsigned_abs()))
    }

    /// Record a handle of this process for publishing.
    #[cfg(windows)]
    pub fn from_borrowed(handle: BorrowedShareHandle<'_>) -> Self {
        Self(handle.as_raw_handle() as usize as u64)
    }

    /// Raw value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Whether no handle was published.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A handle owned by this process; closed on drop.
#[derive(Debug)]
pub struct LocalHandle {
    #[cfg(unix)]
    inner: OwnedFd,
    #[cfg(windows)]
    inner: OwnedHandle,
}

impl LocalHandle {
    /// Borrow the handle for a GPU import.
    pub fn as_borrowed(&self) -> BorrowedShareHandle<'_> {
        #[cfg(unix)]
        {
            self.inner.as_fd()
        }
        #[cfg(windows)]
        {
            self.inner.as_handle()
        }
    }
}

#[cfg(unix)]
impl From<OwnedFd> for LocalHandle {
    fn from(inner: OwnedFd) -> Self {
        Self { inner }
    }
}

#[cfg(windows)]
impl From<OwnedHandle> for LocalHandle {
    fn from(inner: OwnedHandle) -> Self {
        Self { inner }
    }
}

/// Texture and fence of one swapchain slot, duplicated into this process.
///
/// The foreign values are kept so a later frame publishing the same values
/// reuses the duplicates instead of duplicating again.
#[derive(Debug)]
pub struct IpcHandles {
    /// Texture handle as published by the feeder
    pub foreign_texture: ForeignHandle,
    /// Fence handle as published by the feeder
    pub foreign_fence: ForeignHandle,
    /// Texture handle in this process
    pub texture: LocalHandle,
    /// Fence handle in this process
    pub fence: LocalHandle,
}

impl IpcHandles {
    /// Whether these duplicates were made from the given published values.
    pub fn matches(&self, texture: ForeignHandle, fence: ForeignHandle) -> bool {
        self.foreign_texture == texture && self.foreign_fence == fence
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_foreign_handle_from_borrowed_fd() {
        let file = tempfile::tempfile().expect("tempfile");
        let foreign = ForeignHandle::from_borrowed(file.as_fd());
        assert_eq!(foreign.as_raw(), u64::try_from(file.as_raw_fd()).expect("fd"));
        assert!(!foreign.is_null());
    }

    #[cfg(unix)]
    #[test]
    fn test_ipc_handles_matches_foreign_values() {
        let texture = OwnedFd::from(tempfile::tempfile().expect("tempfile"));
        let fence = OwnedFd::from(tempfile::tempfile().expect("tempfile"));
        let handles = IpcHandles {
            foreign_texture: ForeignHandle::from_raw(10),
            foreign_fence: ForeignHandle::from_raw(11),
            texture: texture.into(),
            fence: fence.into(),
        };
        assert!(handles.matches(ForeignHandle::from_raw(10), ForeignHandle::from_raw(11)));
        assert!(!handles.matches(ForeignHandle::from_raw(10), ForeignHandle::from_raw(12)));
    }
}
