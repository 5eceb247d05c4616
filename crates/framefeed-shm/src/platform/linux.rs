//! Linux back end.
//!
//! The mapping is a POSIX shared memory object. Linux has no named mutex,
//! so the mutex lives in a second shared memory object holding a robust,
//! process-shared `pthread_mutex_t`. Robustness gives the same guarantee a
//! Windows mutex has: if the owner dies, the next locker is told so
//! (`EOWNERDEAD`) instead of blocking forever.
//!
//! Only the process whose `O_CREAT | O_EXCL` open wins initializes the
//! mutex; everyone else waits for its `ready` word.

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem::{MaybeUninit, size_of};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use libc::{O_CREAT, O_EXCL, O_RDWR, S_IRUSR, S_IWUSR, c_int, c_long, mode_t};
use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, warn};

use crate::handles::{ForeignHandle, LocalHandle};
use crate::naming::ShmNames;
use crate::{Result, ShmError};

use super::LockOutcome;

/// Longest name accepted by `shm_open`, including the leading slash.
const NAME_MAX: usize = 255;

/// Poll interval while another process initializes the mutex.
const INIT_POLL: Duration = Duration::from_millis(1);

/// Value of [`MutexBlock::ready`] once the mutex is usable.
const READY: u32 = 1;

/// Map a canonical name onto the flat POSIX shm namespace.
fn os_name(canonical: &str) -> Result<CString> {
    let name = format!("/{}", canonical.replace(['/', '\\'], "_"));
    if name.len() > NAME_MAX {
        return Err(ShmError::InvalidName(format!(
            "{name} is {} bytes, limit is {NAME_MAX}",
            name.len()
        )));
    }
    CString::new(name).map_err(|e| ShmError::InvalidName(format!("{canonical}: {e}")))
}

/// `shm_open` returning an owned file.
#[allow(unsafe_code)]
fn shm_open(name: &CString, flags: c_int) -> io::Result<File> {
    // SAFETY: `name` is NUL-terminated and outlives the call.
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, (S_IRUSR | S_IWUSR) as mode_t) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by `shm_open` and is owned by nobody
    // else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn map(file: &File, size: usize, name: &str) -> Result<MmapRaw> {
    MmapOptions::new()
        .len(size)
        .map_raw(file)
        .map_err(|e| ShmError::Unavailable(format!("mmap failed for {name}: {e}")))
}

/// The shared region, mapped read-write.
pub(crate) struct SharedMapping {
    map: MmapRaw,
    _file: File,
}

impl SharedMapping {
    /// Create the region, or open it if it exists. Newly created memory is
    /// zero-filled.
    pub(crate) fn open(names: &ShmNames, size: usize) -> Result<Self> {
        let name = os_name(names.mapping())?;
        let file = shm_open(&name, O_CREAT | O_RDWR).map_err(|e| {
            ShmError::Unavailable(format!("shm_open failed for {}: {e}", names.mapping()))
        })?;

        // Extending zero-fills; two processes racing here agree on the size.
        let current = file.metadata()?.len();
        if current < size as u64 {
            file.set_len(size as u64)?;
        }

        let map = map(&file, size, names.mapping())?;
        debug!("Mapped {} ({size} bytes)", names.mapping());
        Ok(Self { map, _file: file })
    }

    /// Start of the mapping.
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }
}

/// Contents of the mutex's shared memory object.
#[repr(C)]
struct MutexBlock {
    ready: AtomicU32,
    _reserved: u32,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
}

/// A robust process-shared mutex found by name.
pub(crate) struct NamedMutex {
    map: MmapRaw,
    _file: File,
    name: String,
}

// SAFETY: the mutex is process-shared and designed to be used from any
// thread; the mapping itself never moves.
#[allow(unsafe_code)]
unsafe impl Send for NamedMutex {}

// SAFETY: all access to the block goes through pthread calls or atomics.
#[allow(unsafe_code)]
unsafe impl Sync for NamedMutex {}

impl NamedMutex {
    /// Create the mutex, or open it and wait up to `init_timeout` for its
    /// creator to finish initializing it.
    ///
    /// If the creator never finishes (it died between creating and
    /// initializing the object), the object is unlinked and the whole open
    /// is retried once.
    pub(crate) fn open(names: &ShmNames, init_timeout: Duration) -> Result<Self> {
        let name = os_name(names.mutex())?;
        match Self::open_once(names, &name, init_timeout) {
            Err(ShmError::Timeout(reason)) => {
                warn!("{reason}; recreating {}", names.mutex());
                unlink(&name)?;
                Self::open_once(names, &name, init_timeout)
            }
            result => result,
        }
    }

    fn open_once(names: &ShmNames, name: &CString, init_timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + init_timeout;

        loop {
            match shm_open(name, O_CREAT | O_EXCL | O_RDWR) {
                Ok(file) => return Self::create(file, names.mutex()),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {}
                Err(e) => {
                    return Err(ShmError::Unavailable(format!(
                        "shm_open failed for {}: {e}",
                        names.mutex()
                    )));
                }
            }

            match shm_open(name, O_RDWR) {
                Ok(file) => return Self::attach(file, names.mutex(), deadline),
                // Unlinked between our two opens; race for creation again.
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                    if Instant::now() >= deadline {
                        return Err(ShmError::Timeout(format!(
                            "{} kept disappearing while opening",
                            names.mutex()
                        )));
                    }
                }
                Err(e) => {
                    return Err(ShmError::Unavailable(format!(
                        "shm_open failed for {}: {e}",
                        names.mutex()
                    )));
                }
            }
        }
    }

    #[allow(unsafe_code)]
    fn create(file: File, name: &str) -> Result<Self> {
        file.set_len(size_of::<MutexBlock>() as u64)?;
        let map = map(&file, size_of::<MutexBlock>(), name)?;
        let this = Self {
            map,
            _file: file,
            name: name.to_string(),
        };

        // SAFETY: we created the object exclusively and nobody can observe
        // the mutex before `ready` is published below.
        unsafe { init_robust_mutex(this.raw())? };

        this.block().ready.store(READY, Ordering::Release);
        debug!("Created mutex {name}");
        Ok(this)
    }

    fn attach(file: File, name: &str, deadline: Instant) -> Result<Self> {
        let size = size_of::<MutexBlock>() as u64;
        while file.metadata()?.len() < size {
            wait_for_creator(name, deadline)?;
        }

        let map = map(&file, size_of::<MutexBlock>(), name)?;
        let this = Self {
            map,
            _file: file,
            name: name.to_string(),
        };
        while this.block().ready.load(Ordering::Acquire) != READY {
            wait_for_creator(name, deadline)?;
        }
        debug!("Opened mutex {name}");
        Ok(this)
    }

    #[allow(unsafe_code)]
    fn block(&self) -> &MutexBlock {
        // SAFETY: the mapping is at least `size_of::<MutexBlock>()` bytes,
        // page-aligned, and lives as long as `self`. `MutexBlock` is valid
        // for any bit pattern up to the pthread fields, which are only
        // touched through pthread calls after `ready` is set.
        unsafe { &*self.map.as_ptr().cast::<MutexBlock>() }
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.block().mutex.get()
    }

    /// Block until the mutex is held.
    #[allow(unsafe_code)]
    pub(crate) fn lock(&self) -> Result<LockOutcome> {
        // SAFETY: the mutex was initialized before `ready` was published.
        let rc = unsafe { libc::pthread_mutex_lock(self.raw()) };
        self.outcome(rc, "pthread_mutex_lock")
    }

    /// Take the mutex if it is free.
    #[allow(unsafe_code)]
    pub(crate) fn try_lock(&self) -> Result<LockOutcome> {
        // SAFETY: as for `lock`.
        let rc = unsafe { libc::pthread_mutex_trylock(self.raw()) };
        self.outcome(rc, "pthread_mutex_trylock")
    }

    /// Release the mutex; it must be held by this thread.
    #[allow(unsafe_code)]
    pub(crate) fn unlock(&self) -> Result<()> {
        // SAFETY: as for `lock`; the error-checking type rejects unlocks by
        // a thread that does not own it.
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        if rc != 0 {
            return Err(self.lock_error("pthread_mutex_unlock", rc));
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn outcome(&self, rc: c_int, op: &str) -> Result<LockOutcome> {
        match rc {
            0 => Ok(LockOutcome::Acquired),
            libc::EBUSY => Ok(LockOutcome::Busy),
            libc::EOWNERDEAD => {
                warn!("Previous owner of {} died holding it", self.name);
                // SAFETY: we now hold the mutex in the owner-dead state.
                let rc = unsafe { libc::pthread_mutex_consistent(self.raw()) };
                if rc != 0 {
                    return Err(self.lock_error("pthread_mutex_consistent", rc));
                }
                Ok(LockOutcome::Abandoned)
            }
            other => Err(self.lock_error(op, other)),
        }
    }

    fn lock_error(&self, op: &str, rc: c_int) -> ShmError {
        ShmError::Lock(format!(
            "{op} on {}: {}",
            self.name,
            io::Error::from_raw_os_error(rc)
        ))
    }
}

/// Initialize a robust, process-shared, error-checking mutex in place.
///
/// # Safety
///
/// `mutex` must point to writable memory that no thread is using as a mutex.
#[allow(unsafe_code)]
unsafe fn init_robust_mutex(mutex: *mut libc::pthread_mutex_t) -> Result<()> {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    // SAFETY: `attr` is initialized before any other use and destroyed
    // exactly once; `mutex` is valid per the caller.
    unsafe {
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()), "pthread_mutexattr_init")?;
        let attr_ptr = attr.as_mut_ptr();
        let result = check(
            libc::pthread_mutexattr_setpshared(attr_ptr, libc::PTHREAD_PROCESS_SHARED),
            "pthread_mutexattr_setpshared",
        )
        .and_then(|()| {
            check(
                libc::pthread_mutexattr_setrobust(attr_ptr, libc::PTHREAD_MUTEX_ROBUST),
                "pthread_mutexattr_setrobust",
            )
        })
        .and_then(|()| {
            check(
                libc::pthread_mutexattr_settype(attr_ptr, libc::PTHREAD_MUTEX_ERRORCHECK),
                "pthread_mutexattr_settype",
            )
        })
        .and_then(|()| check(libc::pthread_mutex_init(mutex, attr_ptr), "pthread_mutex_init"));
        libc::pthread_mutexattr_destroy(attr_ptr);
        result
    }
}

fn check(rc: c_int, op: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ShmError::Unavailable(format!(
            "{op}: {}",
            io::Error::from_raw_os_error(rc)
        )))
    }
}

fn wait_for_creator(name: &str, deadline: Instant) -> Result<()> {
    if Instant::now() >= deadline {
        return Err(ShmError::Timeout(format!(
            "{name} was not initialized by its creator"
        )));
    }
    thread::sleep(INIT_POLL);
    Ok(())
}

/// The process that published a set of handles.
pub(crate) enum FeederProcess {
    /// The feeder is this process; descriptors are duplicated locally.
    Current,
    /// pidfd of another process.
    Remote(OwnedFd),
}

impl std::fmt::Debug for FeederProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Current => f.write_str("Current"),
            Self::Remote(fd) => write!(f, "Remote(pidfd {})", fd.as_raw_fd()),
        }
    }
}

impl FeederProcess {
    /// Open a process for handle duplication.
    #[allow(unsafe_code)]
    pub(crate) fn open(pid: u32) -> Result<Self> {
        if pid == std::process::id() {
            return Ok(Self::Current);
        }
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| ShmError::HandleDuplication(format!("pid {pid} out of range")))?;

        // SAFETY: pidfd_open takes a pid and flags and returns a new fd.
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        let fd = owned_fd(fd).map_err(|e| {
            ShmError::HandleDuplication(format!("pidfd_open({pid}) failed: {e}"))
        })?;
        Ok(Self::Remote(fd))
    }

    /// Duplicate a descriptor published by this process into ours.
    ///
    /// Remote duplication needs ptrace access to the feeder.
    #[allow(unsafe_code)]
    pub(crate) fn duplicate(&self, handle: ForeignHandle) -> Result<LocalHandle> {
        let raw = RawFd::try_from(handle.as_raw()).map_err(|_| {
            ShmError::HandleDuplication(format!("{} is not a descriptor", handle.as_raw()))
        })?;

        let fd = match self {
            // SAFETY: F_DUPFD_CLOEXEC does not touch memory; a bad `raw`
            // fails with EBADF.
            Self::Current => c_long::from(unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 0) }),
            // SAFETY: pidfd_getfd takes two descriptors and flags and returns
            // a new close-on-exec fd.
            Self::Remote(pidfd) => unsafe {
                libc::syscall(libc::SYS_pidfd_getfd, pidfd.as_raw_fd(), raw, 0)
            },
        };
        let fd = owned_fd(fd)
            .map_err(|e| ShmError::HandleDuplication(format!("duplicating fd {raw}: {e}")))?;
        Ok(LocalHandle::from(fd))
    }
}

#[allow(unsafe_code)]
fn owned_fd(rc: c_long) -> io::Result<OwnedFd> {
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = RawFd::try_from(rc).map_err(|_| io::Error::from_raw_os_error(libc::EBADF))?;
    // SAFETY: the kernel just handed us this descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// `shm_unlink`, treating a missing object as success.
#[allow(unsafe_code)]
fn unlink(name: &CString) -> io::Result<()> {
    // SAFETY: `name` is NUL-terminated and outlives the call.
    if unsafe { libc::shm_unlink(name.as_ptr()) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err);
        }
    }
    Ok(())
}

/// Remove both shared objects from the namespace.
///
/// Processes that already have them open keep working; the next open
/// creates fresh objects. Missing objects are not an error.
pub fn unlink_shared_objects(names: &ShmNames) -> Result<()> {
    for canonical in [names.mapping(), names.mutex()] {
        unlink(&os_name(canonical)?)?;
        debug!("Unlinked {canonical}");
    }
    Ok(())
}
