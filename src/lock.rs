//! Writer exclusion.
//!
//! Two mechanisms, layered:
//!
//! - A process-wide registry of paths open for write. Always on, because
//!   POSIX record locks do not conflict within one process.
//! - Optional advisory OS byte-range locks. The writer holds an exclusive
//!   non-blocking lock on a probe range far past any real data for the life
//!   of the handle; master-slot reads and writes take a shared or exclusive
//!   lock over the slot range only for the duration of the access. Readers
//!   therefore never contend with the writer at open time.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::error::Result;
use crate::Error;

/// Probe range held exclusively by the writer. Far beyond any offset the
/// data region can reach.
pub const WRITER_LOCK_START: u64 = 0x7FFF_FFFF_FFFF_FFFE;
pub const WRITER_LOCK_LEN: u64 = 1;

static OPEN_WRITERS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn open_writers() -> &'static Mutex<HashSet<PathBuf>> {
    OPEN_WRITERS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Membership in the process-wide set of write-mode paths. Dropping it
/// releases the path for the next writer.
#[derive(Debug)]
pub struct WriterRegistration {
    path: PathBuf,
}

pub fn register_writer(path: &Path) -> Result<WriterRegistration> {
    let mut writers = open_writers().lock().unwrap_or_else(PoisonError::into_inner);
    if !writers.insert(path.to_path_buf()) {
        return Err(Error::AlreadyOpen(format!(
            "capture file {} is already open for write in this process",
            path.display()
        )));
    }
    Ok(WriterRegistration {
        path: path.to_path_buf(),
    })
}

impl Drop for WriterRegistration {
    fn drop(&mut self) {
        let mut writers = open_writers().lock().unwrap_or_else(PoisonError::into_inner);
        writers.remove(&self.path);
    }
}

/// Takes the writer's exclusive probe lock. Fails immediately if another
/// process holds it.
pub fn lock_writer(file: &File) -> io::Result<()> {
    sys::lock(file, true, WRITER_LOCK_START, WRITER_LOCK_LEN, false)
}

/// Locks the master-slot range, blocking until available.
pub fn lock_masters(file: &File, start: u64, len: u64, exclusive: bool) -> io::Result<()> {
    sys::lock(file, exclusive, start, len, true)
}

pub fn unlock_masters(file: &File, start: u64, len: u64) -> io::Result<()> {
    sys::unlock(file, start, len)
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    fn range_lock(file: &File, lock_type: i32, start: u64, len: u64, wait: bool) -> io::Result<()> {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = lock_type as _;
        fl.l_whence = libc::SEEK_SET as _;
        fl.l_start = start as libc::off_t;
        fl.l_len = len as libc::off_t;
        let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
        let result = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn lock(file: &File, exclusive: bool, start: u64, len: u64, wait: bool) -> io::Result<()> {
        let lock_type = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
        range_lock(file, lock_type as i32, start, len, wait)
    }

    pub fn unlock(file: &File, start: u64, len: u64) -> io::Result<()> {
        range_lock(file, libc::F_UNLCK as i32, start, len, true)
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use winapi::um::fileapi::{LockFileEx, UnlockFileEx};
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};

    pub fn lock(file: &File, exclusive: bool, start: u64, len: u64, wait: bool) -> io::Result<()> {
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        unsafe {
            let offsets = overlapped.u.s_mut();
            offsets.Offset = start as u32;
            offsets.OffsetHigh = (start >> 32) as u32;
        }
        let mut flags = 0;
        if exclusive {
            flags |= LOCKFILE_EXCLUSIVE_LOCK;
        }
        if !wait {
            flags |= LOCKFILE_FAIL_IMMEDIATELY;
        }
        let result = unsafe {
            LockFileEx(
                file.as_raw_handle() as *mut _,
                flags,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            )
        };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn unlock(file: &File, start: u64, len: u64) -> io::Result<()> {
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        unsafe {
            let offsets = overlapped.u.s_mut();
            offsets.Offset = start as u32;
            offsets.OffsetHigh = (start >> 32) as u32;
        }
        let result = unsafe {
            UnlockFileEx(
                file.as_raw_handle() as *mut _,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            )
        };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

// Advisory locking is best effort on platforms without a known API.
#[cfg(not(any(unix, windows)))]
mod sys {
    use std::fs::File;
    use std::io;

    pub fn lock(_: &File, _: bool, _: u64, _: u64, _: bool) -> io::Result<()> {
        Ok(())
    }

    pub fn unlock(_: &File, _: u64, _: u64) -> io::Result<()> {
        Ok(())
    }
}
