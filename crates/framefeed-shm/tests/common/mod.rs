//! Shared helpers for integration tests.
//!
//! Texture and fence "handles" are temporary files, so handle duplication
//! runs for real and a copy can be traced back to its source by inode.

#![allow(dead_code, clippy::expect_used)]

use std::fs::File;
use std::os::fd::AsFd;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use framefeed_shm::{
    BorrowedShareHandle, Config, CopyError, LayerConfig, NextFrameInfo, PixelRect, PixelSize,
    ShmConfig, ShmNames, TextureCopier, Writer, unlink_shared_objects,
};

/// Adapter LUID used by feeders and consumers in tests.
pub const GPU_LUID: u64 = 0x0000_0001_0000_c0de;

/// Size of the feeder texture in tests.
pub const TEXTURE_SIZE: PixelSize = PixelSize::new(1024, 768);

/// A region with a product id unique to this test; unlinked on drop.
pub struct TestRegion {
    pub config: ShmConfig,
}

impl TestRegion {
    pub fn new(test: &str) -> Self {
        Self {
            config: ShmConfig::new(format!("com.framefeed.test.{}.{test}", std::process::id())),
        }
    }
}

impl Drop for TestRegion {
    fn drop(&mut self) {
        let _ = unlink_shared_objects(&ShmNames::for_config(&self.config));
    }
}

/// Texture and fence of a feeder.
pub struct FeederResources {
    pub texture: File,
    pub fence: File,
}

impl FeederResources {
    pub fn new() -> Self {
        Self {
            texture: tempfile::tempfile().expect("texture"),
            fence: tempfile::tempfile().expect("fence"),
        }
    }

    pub fn texture_inode(&self) -> u64 {
        self.texture.metadata().expect("metadata").ino()
    }
}

pub fn frame_config() -> Config {
    Config::new(TEXTURE_SIZE)
}

/// `count` side-by-side layers that fit in [`TEXTURE_SIZE`].
pub fn layers(count: u32) -> Vec<LayerConfig> {
    let width = TEXTURE_SIZE.width / count.max(1);
    (0..count)
        .map(|i| {
            LayerConfig::new(
                u64::from(i) + 100,
                PixelRect::new(i * width, 0, width, TEXTURE_SIZE.height),
            )
        })
        .collect()
}

/// Lock, publish one frame and unlock.
pub fn submit(writer: &Writer, resources: &FeederResources, layers: &[LayerConfig]) -> NextFrameInfo {
    let mut guard = writer.lock().expect("lock");
    let frame = guard.begin_frame();
    let info = frame.info();
    frame.submit(
        &frame_config(),
        layers,
        resources.texture.as_fd(),
        resources.fence.as_fd(),
    );
    info
}

/// Consumer texture used with [`CountingCopier`].
#[derive(Debug)]
pub struct TestTexture {
    pub swapchain_index: u8,
    pub size: PixelSize,
    pub source_inode: AtomicU64,
}

/// Copier that records what it was asked to do.
#[derive(Debug, Default)]
pub struct CountingCopier {
    pub copies: AtomicUsize,
    pub creates: AtomicUsize,
    pub last_fence_value: AtomicU64,
    pub fail: AtomicBool,
    /// Copy, then report that the fence wait timed out.
    pub fence_timeout: AtomicBool,
}

impl CountingCopier {
    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

impl TextureCopier for CountingCopier {
    type Texture = TestTexture;

    fn create_client_texture(
        &self,
        swapchain_index: u8,
        size: PixelSize,
    ) -> Result<TestTexture, CopyError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(TestTexture {
            swapchain_index,
            size,
            source_inode: AtomicU64::new(0),
        })
    }

    fn copy(
        &self,
        texture: BorrowedShareHandle<'_>,
        fence: BorrowedShareHandle<'_>,
        fence_value: u64,
        destination: &TestTexture,
    ) -> Result<(), CopyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CopyError::Import("injected failure".to_string()));
        }
        let inode = |handle: BorrowedShareHandle<'_>| -> Result<u64, CopyError> {
            let file = File::from(
                handle
                    .try_clone_to_owned()
                    .map_err(|e| CopyError::Import(e.to_string()))?,
            );
            Ok(file
                .metadata()
                .map_err(|e| CopyError::Import(e.to_string()))?
                .ino())
        };
        inode(fence)?;
        destination
            .source_inode
            .store(inode(texture)?, Ordering::SeqCst);
        self.last_fence_value.store(fence_value, Ordering::SeqCst);
        self.copies.fetch_add(1, Ordering::SeqCst);
        if self.fence_timeout.load(Ordering::SeqCst) {
            return Err(CopyError::FenceWait(format!(
                "fence value {fence_value} not reached in time"
            )));
        }
        Ok(())
    }
}
