//! Advisory byte-range locks over `fcntl`.
//!
//! On Linux the open-file-description variants (`F_OFD_SETLK`) are
//! used so that two handles opened by the same process still conflict,
//! which the channel protocol relies on. Elsewhere the classic
//! per-process record locks are used; there the protocol only works
//! across distinct processes.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use crate::error::Result;

/// Shared (read) or exclusive (write) range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    fn as_type(self) -> libc::c_short {
        match self {
            LockKind::Shared => libc::F_RDLCK as libc::c_short,
            LockKind::Exclusive => libc::F_WRLCK as libc::c_short,
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SETLK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(any(target_os = "linux", target_os = "android"))]
const SETLKW: libc::c_int = libc::F_OFD_SETLKW;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SETLK: libc::c_int = libc::F_SETLK;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SETLKW: libc::c_int = libc::F_SETLKW;

fn flock_for(kind: libc::c_short, start: u64, len: u64) -> libc::flock {
    // OFD locks require l_pid to be zero; zeroing the whole struct
    // also covers platform-specific trailing fields.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

fn fcntl_retry(fd: libc::c_int, cmd: libc::c_int, fl: &libc::flock) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::fcntl(fd, cmd, fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// A held byte-range lock on a file region. Released on drop.
///
/// The guard keeps the file alive and unlocks only its own range, so
/// several guards on disjoint ranges of one file can coexist.
#[derive(Debug)]
pub struct RangeLock {
    file: Arc<File>,
    start: u64,
    len: u64,
}

impl RangeLock {
    /// Block until the lock is acquired.
    pub fn acquire(file: &Arc<File>, kind: LockKind, start: u64, len: u64) -> Result<Self> {
        let fl = flock_for(kind.as_type(), start, len);
        fcntl_retry(file.as_raw_fd(), SETLKW, &fl)?;
        Ok(RangeLock {
            file: Arc::clone(file),
            start,
            len,
        })
    }

    /// Acquire without blocking. Returns `Ok(None)` when the range is
    /// held by someone else.
    pub fn try_acquire(
        file: &Arc<File>,
        kind: LockKind,
        start: u64,
        len: u64,
    ) -> Result<Option<Self>> {
        let fl = flock_for(kind.as_type(), start, len);
        match fcntl_retry(file.as_raw_fd(), SETLK, &fl) {
            Ok(()) => Ok(Some(RangeLock {
                file: Arc::clone(file),
                start,
                len,
            })),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.raw_os_error() == Some(libc::EACCES) =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Start offset of the locked range.
    pub fn start(&self) -> u64 {
        self.start
    }
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        let fl = flock_for(libc::F_UNLCK as libc::c_short, self.start, self.len);
        if let Err(err) = fcntl_retry(self.file.as_raw_fd(), SETLK, &fl) {
            tracing::warn!(start = self.start, len = self.len, %err, "range unlock failed");
        }
    }
}
