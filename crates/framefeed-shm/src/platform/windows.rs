//! Windows back end: a pagefile-backed file mapping, a named kernel mutex
//! and `DuplicateHandle`.

use std::ffi::OsStr;
use std::iter;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{FromRawHandle, OwnedHandle};
use std::ptr;
use std::time::Duration;

use tracing::{debug, warn};
use winapi::shared::minwindef::{DWORD, FALSE};
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::{CloseHandle, DuplicateHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{CreateFileMappingW, FILE_MAP_WRITE, MapViewOfFile, UnmapViewOfFile};
use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcess};
use winapi::um::synchapi::{CreateMutexW, ReleaseMutex, WaitForSingleObject};
use winapi::um::winbase::{INFINITE, WAIT_ABANDONED, WAIT_OBJECT_0};
use winapi::um::winnt::{DUPLICATE_SAME_ACCESS, HANDLE, PAGE_READWRITE, PROCESS_DUP_HANDLE};

use crate::handles::{ForeignHandle, LocalHandle};
use crate::naming::ShmNames;
use crate::{Result, ShmError};

use super::LockOutcome;

fn wide(name: &str) -> Vec<u16> {
    OsStr::new(name).encode_wide().chain(iter::once(0)).collect()
}

#[allow(unsafe_code)]
fn last_error(op: &str, name: &str) -> String {
    // SAFETY: reads thread-local state only.
    let code = unsafe { GetLastError() };
    format!(
        "{op} failed for {name}: {}",
        std::io::Error::from_raw_os_error(code as i32)
    )
}

/// The shared region, mapped read-write.
pub(crate) struct SharedMapping {
    handle: HANDLE,
    view: *mut u8,
}

// SAFETY: a section handle and its view may be used from any thread;
// access to the contents is synchronized by the named mutex.
#[allow(unsafe_code)]
unsafe impl Send for SharedMapping {}

// SAFETY: as above.
#[allow(unsafe_code)]
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    /// Create the region, or open it if it exists. Newly created memory is
    /// zero-filled.
    #[allow(unsafe_code)]
    pub(crate) fn open(names: &ShmNames, size: usize) -> Result<Self> {
        let name = wide(names.mapping());
        let size_low = DWORD::try_from(size)
            .map_err(|_| ShmError::Unavailable(format!("{size} bytes is too large to map")))?;

        // SAFETY: `name` is NUL-terminated; a null security descriptor
        // selects the default.
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null_mut(),
                PAGE_READWRITE,
                0,
                size_low,
                name.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(ShmError::Unavailable(last_error(
                "CreateFileMappingW",
                names.mapping(),
            )));
        }

        // SAFETY: `handle` is a valid section of at least `size` bytes.
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_WRITE, 0, 0, size) };
        if view.is_null() {
            let message = last_error("MapViewOfFile", names.mapping());
            // SAFETY: `handle` is ours and not used afterwards.
            unsafe { CloseHandle(handle) };
            return Err(ShmError::Unavailable(message));
        }

        debug!("Mapped {} ({size} bytes)", names.mapping());
        Ok(Self {
            handle,
            view: view.cast(),
        })
    }

    /// Start of the mapping.
    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.view
    }
}

impl Drop for SharedMapping {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: both were created in `open` and are released once.
        unsafe {
            UnmapViewOfFile(self.view.cast());
            CloseHandle(self.handle);
        }
    }
}

/// A named kernel mutex.
pub(crate) struct NamedMutex {
    handle: HANDLE,
    name: String,
}

// SAFETY: mutex handles may be waited on and released from any thread;
// ownership is tracked per thread by the kernel.
#[allow(unsafe_code)]
unsafe impl Send for NamedMutex {}

// SAFETY: as above.
#[allow(unsafe_code)]
unsafe impl Sync for NamedMutex {}

impl NamedMutex {
    /// Create the mutex, or open it if it exists. Kernel mutexes are usable
    /// as soon as they exist, so `init_timeout` is not needed here.
    #[allow(unsafe_code)]
    pub(crate) fn open(names: &ShmNames, _init_timeout: Duration) -> Result<Self> {
        let name = wide(names.mutex());
        // SAFETY: `name` is NUL-terminated; not initially owned.
        let handle = unsafe { CreateMutexW(ptr::null_mut(), FALSE, name.as_ptr()) };
        if handle.is_null() {
            return Err(ShmError::Unavailable(last_error("CreateMutexW", names.mutex())));
        }
        debug!("Opened mutex {}", names.mutex());
        Ok(Self {
            handle,
            name: names.mutex().to_string(),
        })
    }

    /// Block until the mutex is held.
    pub(crate) fn lock(&self) -> Result<LockOutcome> {
        self.wait(INFINITE)
    }

    /// Take the mutex if it is free.
    pub(crate) fn try_lock(&self) -> Result<LockOutcome> {
        self.wait(0)
    }

    #[allow(unsafe_code)]
    fn wait(&self, timeout: DWORD) -> Result<LockOutcome> {
        // SAFETY: `self.handle` is a valid mutex handle.
        match unsafe { WaitForSingleObject(self.handle, timeout) } {
            WAIT_OBJECT_0 => Ok(LockOutcome::Acquired),
            WAIT_ABANDONED => {
                warn!("Previous owner of {} died holding it", self.name);
                Ok(LockOutcome::Abandoned)
            }
            WAIT_TIMEOUT => Ok(LockOutcome::Busy),
            _ => Err(ShmError::Lock(last_error("WaitForSingleObject", &self.name))),
        }
    }

    /// Release the mutex; it must be held by this thread.
    #[allow(unsafe_code)]
    pub(crate) fn unlock(&self) -> Result<()> {
        // SAFETY: `self.handle` is a valid mutex handle.
        if unsafe { ReleaseMutex(self.handle) } == 0 {
            return Err(ShmError::Lock(last_error("ReleaseMutex", &self.name)));
        }
        Ok(())
    }
}

impl Drop for NamedMutex {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: created in `open` and closed once.
        unsafe { CloseHandle(self.handle) };
    }
}

/// The process that published a set of handles, opened for duplication.
#[derive(Debug)]
pub(crate) struct FeederProcess(OwnedHandle);

impl FeederProcess {
    /// Open a process for handle duplication.
    #[allow(unsafe_code)]
    pub(crate) fn open(pid: u32) -> Result<Self> {
        // SAFETY: returns a new handle or null.
        let handle = unsafe { OpenProcess(PROCESS_DUP_HANDLE, FALSE, pid) };
        if handle.is_null() {
            return Err(ShmError::HandleDuplication(last_error(
                "OpenProcess",
                &format!("pid {pid}"),
            )));
        }
        // SAFETY: the handle is new and owned by nobody else.
        Ok(Self(unsafe { OwnedHandle::from_raw_handle(handle.cast()) }))
    }

    /// Duplicate a handle published by this process into ours.
    #[allow(unsafe_code)]
    pub(crate) fn duplicate(&self, handle: ForeignHandle) -> Result<LocalHandle> {
        use std::os::windows::io::AsRawHandle;

        let source = usize::try_from(handle.as_raw()).map_err(|_| {
            ShmError::HandleDuplication(format!("{:#x} is not a handle", handle.as_raw()))
        })? as HANDLE;
        let mut duplicate: HANDLE = ptr::null_mut();
        // SAFETY: the source process handle has PROCESS_DUP_HANDLE; an
        // invalid `source` fails without side effects.
        let ok = unsafe {
            DuplicateHandle(
                self.0.as_raw_handle().cast(),
                source,
                GetCurrentProcess(),
                &mut duplicate,
                0,
                FALSE,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if ok == 0 {
            return Err(ShmError::HandleDuplication(last_error(
                "DuplicateHandle",
                &format!("{:#x}", handle.as_raw()),
            )));
        }
        // SAFETY: `duplicate` is a new handle owned by nobody else.
        Ok(LocalHandle::from(unsafe {
            OwnedHandle::from_raw_handle(duplicate.cast())
        }))
    }
}
