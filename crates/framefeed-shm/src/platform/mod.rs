//! OS primitives: the named mapping, the named mutex and handle
//! duplication.
//!
//! | Concept          | Linux                                  | Windows                         |
//! |------------------|----------------------------------------|---------------------------------|
//! | Mapping          | `shm_open` + `mmap`                    | `CreateFileMappingW`            |
//! | Mutex            | robust process-shared `pthread_mutex_t` in its own shm object | `CreateMutexW` |
//! | Abandoned mutex  | `EOWNERDEAD`                           | `WAIT_ABANDONED`                |
//! | Foreign process  | pidfd                                  | `OpenProcess(PROCESS_DUP_HANDLE)` |
//! | Handle duplicate | `pidfd_getfd`                          | `DuplicateHandle`               |
//!
//! Both back ends expose the same items: `SharedMapping`, `NamedMutex`,
//! `FeederProcess`.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux::{FeederProcess, NamedMutex, SharedMapping};
#[cfg(target_os = "linux")]
pub use linux::unlink_shared_objects;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub(crate) use windows::{FeederProcess, NamedMutex, SharedMapping};

/// Result of acquiring the OS mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockOutcome {
    /// The mutex is now held.
    Acquired,
    /// The mutex is now held, but its previous owner died holding it.
    Abandoned,
    /// Held by someone else; only returned by non-blocking attempts.
    Busy,
}
