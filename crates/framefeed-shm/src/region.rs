//! The mapped header plus the lock discipline around it.
//!
//! Two layers of locking protect the header:
//!
//! - a per-object `parking_lot::ReentrantMutex` serializes threads of this
//!   process and lets the owning thread nest locks;
//! - the named OS mutex serializes processes. It is taken once, by the
//!   outermost lock, and released when the outermost guard drops.
//!
//! The state machine only moves `Unlocked -> TryLock -> Locked` and back at
//! the outermost level; nested locks just count depth.

use std::cell::{RefCell, RefMut};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::error;

use crate::config::ShmConfig;
use crate::layout::{FrameMetadata, HeaderFlags, MAGIC, RenderCacheKey, offsets};
use crate::naming::ShmNames;
use crate::platform::{LockOutcome, NamedMutex, SharedMapping};
use crate::state_machine::{LockState, StateMachine};
use crate::{Result, SWAPCHAIN_LENGTH};

/// How to wait for the OS mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    /// Wait until the mutex is free.
    Blocking,
    /// Give up immediately if it is held.
    Try,
}

struct LockBook<S: LockState> {
    machine: StateMachine<S>,
    depth: u32,
}

/// The mapped region of one reader or writer.
pub(crate) struct SharedRegion<S: LockState> {
    names: ShmNames,
    mapping: SharedMapping,
    mutex: NamedMutex,
    book: ReentrantMutex<RefCell<LockBook<S>>>,
}

impl<S: LockState> SharedRegion<S> {
    /// Create or open the mapping and its mutex.
    pub(crate) fn open(config: &ShmConfig) -> Result<Self> {
        let names = ShmNames::for_config(config);
        let mapping = SharedMapping::open(&names, FrameMetadata::SIZE)?;
        let mutex = NamedMutex::open(&names, config.mutex_init_timeout)?;
        Ok(Self {
            names,
            mapping,
            mutex,
            book: ReentrantMutex::new(RefCell::new(LockBook {
                machine: StateMachine::new(S::UNLOCKED),
                depth: 0,
            })),
        })
    }

    pub(crate) const fn names(&self) -> &ShmNames {
        &self.names
    }

    /// Acquire the lock. `None` means [`LockMode::Try`] found it held.
    ///
    /// Re-locking on the thread that already holds it nests.
    pub(crate) fn lock(&self, mode: LockMode) -> Result<Option<RegionGuard<'_, S>>> {
        let book = match mode {
            LockMode::Blocking => self.book.lock(),
            LockMode::Try => match self.book.try_lock() {
                Some(book) => book,
                None => return Ok(None),
            },
        };

        {
            let mut state = book.borrow_mut();
            if state.depth > 0 {
                state.depth += 1;
                drop(state);
                return Ok(Some(RegionGuard {
                    region: self,
                    book,
                    abandoned: false,
                }));
            }
            state.machine.transition(S::UNLOCKED, S::TRY_LOCK);
        }

        let outcome = match mode {
            LockMode::Blocking => self.mutex.lock(),
            LockMode::Try => self.mutex.try_lock(),
        };

        let abandoned = {
            let mut state = book.borrow_mut();
            match outcome {
                Ok(LockOutcome::Busy) => {
                    state.machine.transition(S::TRY_LOCK, S::UNLOCKED);
                    return Ok(None);
                }
                Err(e) => {
                    state.machine.transition(S::TRY_LOCK, S::UNLOCKED);
                    return Err(e);
                }
                Ok(outcome) => {
                    state.machine.transition(S::TRY_LOCK, S::LOCKED);
                    state.depth = 1;
                    outcome == LockOutcome::Abandoned
                }
            }
        };

        Ok(Some(RegionGuard {
            region: self,
            book,
            abandoned,
        }))
    }

    fn header_ptr(&self) -> *mut FrameMetadata {
        self.mapping.as_ptr().cast()
    }

    #[allow(unsafe_code)]
    fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: `offset` is one of the 8-aligned u64 field offsets checked
        // at compile time in `layout`; the mapping is page-aligned and at
        // least `FrameMetadata::SIZE` bytes.
        unsafe { AtomicU64::from_ptr(self.mapping.as_ptr().add(offset).cast()) }
    }

    #[allow(unsafe_code)]
    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: as for `atomic_u64`, with a 4-aligned u32 field.
        unsafe { AtomicU32::from_ptr(self.mapping.as_ptr().add(offset).cast()) }
    }

    /// Session id and frame number, read without the lock.
    pub(crate) fn peek_render_cache_key(&self) -> RenderCacheKey {
        RenderCacheKey {
            session_id: self.atomic_u64(offsets::SESSION_ID).load(Ordering::Acquire),
            frame_number: self.atomic_u64(offsets::FRAME_NUMBER).load(Ordering::Acquire),
        }
    }

    /// Magic and feeder-attached bit, read without the lock.
    pub(crate) fn peek_has_feeder(&self) -> bool {
        let magic = self.atomic_u64(offsets::MAGIC).load(Ordering::Acquire);
        let flags = self.atomic_u32(offsets::FLAGS).load(Ordering::Acquire);
        magic == u64::from_ne_bytes(MAGIC) && flags & HeaderFlags::FEEDER_ATTACHED.bits() != 0
    }
}

/// Proof that this thread holds the region lock.
///
/// Not `Send`: the OS mutex must be released by the thread that took it.
pub(crate) struct RegionGuard<'a, S: LockState> {
    region: &'a SharedRegion<S>,
    book: ReentrantMutexGuard<'a, RefCell<LockBook<S>>>,
    abandoned: bool,
}

impl<S: LockState> RegionGuard<'_, S> {
    /// Whether the previous holder died holding the lock.
    pub(crate) const fn was_abandoned(&self) -> bool {
        self.abandoned
    }

    /// The lock state machine.
    pub(crate) fn machine(&self) -> RefMut<'_, StateMachine<S>> {
        RefMut::map(self.book.borrow_mut(), |book| &mut book.machine)
    }

    /// Copy the header out of the mapping.
    #[allow(unsafe_code)]
    pub(crate) fn read_header(&self) -> FrameMetadata {
        // SAFETY: the lock is held, the pointer is aligned and in bounds, and
        // `FrameMetadata` is valid for any bit pattern.
        unsafe { ptr::read_volatile(self.region.header_ptr()) }
    }

    /// Overwrite the whole header.
    ///
    /// The fields that are peeked without the lock are stored atomically,
    /// after the body; the frame number goes last so a peek that sees it
    /// also sees the rest of the frame.
    #[allow(unsafe_code)]
    pub(crate) fn write_header(&self, header: &FrameMetadata) {
        let source = ptr::from_ref(header).cast::<u8>();
        // SAFETY: the lock is held and nothing reads the body without it;
        // both ranges lie within a `FrameMetadata` and do not overlap.
        unsafe {
            ptr::copy_nonoverlapping(
                source.add(offsets::BODY),
                self.region.mapping.as_ptr().add(offsets::BODY),
                FrameMetadata::SIZE - offsets::BODY,
            );
        }
        let region = self.region;
        region
            .atomic_u64(offsets::MAGIC)
            .store(u64::from_ne_bytes(header.magic()), Ordering::Release);
        region
            .atomic_u64(offsets::GPU_LUID)
            .store(header.gpu_luid(), Ordering::Release);
        region
            .atomic_u32(offsets::FLAGS)
            .store(header.header_flags().bits(), Ordering::Release);
        region
            .atomic_u64(offsets::SESSION_ID)
            .store(header.session_id(), Ordering::Release);
        region
            .atomic_u64(offsets::FRAME_NUMBER)
            .store(header.frame_number(), Ordering::Release);
    }

    /// Read-modify-write the header.
    pub(crate) fn update_header<R>(&self, f: impl FnOnce(&mut FrameMetadata) -> R) -> R {
        let mut header = self.read_header();
        let result = f(&mut header);
        self.write_header(&header);
        result
    }

    /// Increment the fence value of `slot` and return the new value.
    pub(crate) fn next_fence_value(&self, slot: usize) -> u64 {
        debug_assert!(slot < SWAPCHAIN_LENGTH);
        let offset = offsets::FENCE_VALUES + slot * size_of::<u64>();
        self.region
            .atomic_u64(offset)
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }
}

impl<S: LockState> Drop for RegionGuard<'_, S> {
    fn drop(&mut self) {
        let mut book = self.book.borrow_mut();
        book.depth -= 1;
        if book.depth > 0 {
            return;
        }
        if thread::panicking() {
            book.machine.force(S::UNLOCKED);
        } else {
            book.machine.transition(S::LOCKED, S::UNLOCKED);
        }
        drop(book);
        if let Err(e) = self.region.mutex.unlock() {
            error!("Failed to release {}: {e}", self.region.names.mutex());
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::state_machine::ReaderState;

    fn config(test: &str) -> ShmConfig {
        ShmConfig::new(format!("com.framefeed.unit.{}.region.{test}", std::process::id()))
    }

    #[cfg(target_os = "linux")]
    fn cleanup(config: &ShmConfig) {
        crate::unlink_shared_objects(&ShmNames::for_config(config)).expect("unlink");
    }

    #[cfg(not(target_os = "linux"))]
    fn cleanup(_config: &ShmConfig) {}

    #[test]
    fn test_nested_lock_takes_os_mutex_once() {
        let config = config("nested");
        let region = SharedRegion::<ReaderState>::open(&config).expect("open");
        {
            let outer = region.lock(LockMode::Blocking).expect("lock").expect("acquired");
            {
                let _inner = region.lock(LockMode::Try).expect("lock").expect("nested");
                assert_eq!(outer.machine().get(), ReaderState::Locked);
            }
            assert_eq!(outer.machine().get(), ReaderState::Locked);
        }
        let again = region.lock(LockMode::Try).expect("lock");
        assert!(again.is_some());
        drop(again);
        cleanup(&config);
    }

    #[test]
    fn test_try_lock_busy_from_other_object() {
        let config = config("busy");
        let region = SharedRegion::<ReaderState>::open(&config).expect("open");
        let guard = region.lock(LockMode::Blocking).expect("lock").expect("acquired");

        let other_config = config.clone();
        let busy = std::thread::spawn(move || {
            let other = SharedRegion::<ReaderState>::open(&other_config).expect("open");
            let attempt = other.lock(LockMode::Try).expect("try");
            let busy = attempt.is_none();
            drop(attempt);
            assert_eq!(other.book.lock().borrow().machine.get(), ReaderState::Unlocked);
            busy
        })
        .join()
        .expect("join");
        assert!(busy);
        drop(guard);
        cleanup(&config);
    }

    #[test]
    fn test_header_round_trips_through_mapping() {
        let config = config("header");
        let region = SharedRegion::<ReaderState>::open(&config).expect("open");
        let header = FrameMetadata::new_session(77);
        {
            let guard = region.lock(LockMode::Blocking).expect("lock").expect("acquired");
            guard.write_header(&header);
            assert_eq!(guard.next_fence_value(1), 1);
            assert_eq!(guard.next_fence_value(1), 2);
            assert_eq!(guard.read_header().fence_value(1), Some(2));
        }
        assert_eq!(region.peek_render_cache_key(), header.render_cache_key());
        assert!(!region.peek_has_feeder());
        cleanup(&config);
    }

    #[test]
    fn test_peeks_race_with_header_writes() {
        let config = config("peek-race");
        let region = SharedRegion::<ReaderState>::open(&config).expect("open");
        let mut header = FrameMetadata::new_session(3);
        header.store_empty_frame(3, 42);
        let session_id = header.session_id();
        region
            .lock(LockMode::Blocking)
            .expect("lock")
            .expect("acquired")
            .write_header(&header);

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut last = 0;
                for _ in 0..10_000 {
                    let key = region.peek_render_cache_key();
                    assert_eq!(key.session_id, session_id);
                    assert!(key.frame_number >= last);
                    assert!(region.peek_has_feeder());
                    last = key.frame_number;
                }
            });
            for _ in 0..1_000 {
                let guard = region.lock(LockMode::Blocking).expect("lock").expect("acquired");
                guard.update_header(|header| header.store_empty_frame(3, 42));
            }
        });

        assert_eq!(region.peek_render_cache_key().frame_number, 1_001);
        cleanup(&config);
    }
}
