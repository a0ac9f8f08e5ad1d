//! An established bidirectional session.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use mapsock_channel::{LockKind, PeriodicWriter, RangeLock, RegionReader, RegionWriter};

use crate::error::{Result, SessionError};

/// A liveness lock file held for the lifetime of a session side.
///
/// Peers watch the first byte of this file: as long as the exclusive
/// lock is held the owner is alive.
pub(crate) struct HeldLock {
    path: PathBuf,
    _file: Arc<File>,
    _lock: RangeLock,
}

impl HeldLock {
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let file = Arc::new(
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(path)?,
        );
        let lock = RangeLock::acquire(&file, LockKind::Exclusive, 0, 1)?;
        Ok(HeldLock {
            path: path.to_path_buf(),
            _file: file,
            _lock: lock,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Open a peer's liveness lock file for observation.
pub(crate) fn open_guard(path: &Path) -> Result<Arc<File>> {
    Ok(Arc::new(OpenOptions::new().read(true).open(path)?))
}

/// Removes the listed files on drop unless disarmed.
///
/// Handshake steps push each file they create, so a failed rendezvous
/// attempt leaves nothing behind no matter where it failed.
pub(crate) struct Unwind {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl Unwind {
    pub(crate) fn new() -> Self {
        Unwind {
            paths: Vec::new(),
            armed: true,
        }
    }

    pub(crate) fn push(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Unwind {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

struct Shared {
    closed: AtomicBool,
    /// Our own liveness lock. Dropping it is what tells the peer we
    /// are gone, so both the close path and the close watcher go
    /// through here.
    own_lock: Mutex<Option<HeldLock>>,
}

/// One side of an established session.
///
/// Reads and writes go over two independent mapped regions, so either
/// direction can be saturated without stalling the other. Closing (or
/// dropping) releases this side's liveness lock; the peer's close
/// watcher picks that up and closes in turn.
pub struct Session {
    name: String,
    dir: PathBuf,
    writer: Option<RegionWriter>,
    reader: Option<RegionReader>,
    shared: Arc<Shared>,
    cleanup: Vec<PathBuf>,
    closed: bool,
}

impl Session {
    /// Assemble an established session and start its close watcher.
    ///
    /// `peer_guard` is the peer's liveness lock file; `cleanup` lists
    /// files this side removes when it closes.
    pub(crate) fn establish(
        name: String,
        dir: PathBuf,
        writer: RegionWriter,
        reader: RegionReader,
        own_lock: HeldLock,
        peer_guard: Arc<File>,
        cleanup: Vec<PathBuf>,
    ) -> Self {
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            own_lock: Mutex::new(Some(own_lock)),
        });
        spawn_close_watcher(name.clone(), Arc::clone(&shared), peer_guard);
        tracing::info!(session = %name, "session established");
        Session {
            name,
            dir,
            writer: Some(writer),
            reader: Some(reader),
            shared,
            cleanup,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory the session's files live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether this side closed or the peer was seen departing.
    pub fn is_closed(&self) -> bool {
        self.closed || self.shared.closed.load(Ordering::Relaxed)
    }

    /// Send `buf` to the peer.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        match self.writer.as_mut() {
            Some(writer) => Ok(writer.write(buf)?),
            None => Err(SessionError::Closed),
        }
    }

    /// Receive up to `buf.len()` bytes, blocking until data or end of
    /// stream. `Ok(0)` means the peer closed and everything it sent
    /// has been drained.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        match self.reader.as_mut() {
            Some(reader) => Ok(reader.read(buf)?),
            None => Err(SessionError::Closed),
        }
    }

    /// Bytes readable without blocking.
    pub fn available(&self) -> usize {
        self.reader.as_ref().map_or(0, RegionReader::available)
    }

    /// The receiving half, if still attached.
    pub fn reader(&mut self) -> Option<&mut RegionReader> {
        self.reader.as_mut()
    }

    /// The sending half, if still attached.
    pub fn writer(&mut self) -> Option<&mut RegionWriter> {
        self.writer.as_mut()
    }

    /// Detach the sending half, e.g. to hand it to a dedicated
    /// producer thread. Subsequent [`Session::write`] calls fail.
    pub fn take_writer(&mut self) -> Option<RegionWriter> {
        self.writer.take()
    }

    /// Detach the sending half behind a periodically drained buffer.
    pub fn buffered_writer(&mut self) -> Option<PeriodicWriter<RegionWriter>> {
        self.take_writer().map(PeriodicWriter::new)
    }

    /// Close this side. Releases the liveness lock so the peer's close
    /// watcher fires, then removes this side's rendezvous files.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.closed.store(true, Ordering::Relaxed);
        self.writer.take();
        self.reader.take();
        if let Some(lock) = self
            .shared
            .own_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            tracing::debug!(lock = %lock.path().display(), "liveness lock released");
        }
        for path in self.cleanup.drain(..) {
            // Either side may win the race to remove shared files.
            let _ = std::fs::remove_file(path);
        }
        tracing::info!(session = %self.name, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl io::Read for Session {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Session::read(self, buf).map_err(io::Error::other)
    }
}

impl io::Write for Session {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Session::write(self, buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Watch the peer's liveness lock; once it is grantable the peer is
/// gone and this side's own lock is released in response. The thread
/// is detached: if the peer outlives us it unblocks when the peer
/// eventually closes.
fn spawn_close_watcher(name: String, shared: Arc<Shared>, peer: Arc<File>) {
    let spawned = std::thread::Builder::new()
        .name("mapsock-close-watch".into())
        .spawn(move || match RangeLock::acquire(&peer, LockKind::Shared, 0, 1) {
            Ok(lock) => {
                drop(lock);
                if !shared.closed.swap(true, Ordering::Relaxed) {
                    tracing::info!(session = %name, "peer departed; closing session");
                    if let Some(lock) = shared
                        .own_lock
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take()
                    {
                        tracing::debug!(lock = %lock.path().display(), "liveness lock released");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(session = %name, %err, "close watcher failed");
            }
        });
    if spawned.is_err() {
        tracing::warn!("close watcher failed to start; peer departure will go unnoticed");
    }
}
