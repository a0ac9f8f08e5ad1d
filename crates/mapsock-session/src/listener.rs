//! Port binding and connection acceptance.

use std::collections::{HashSet, VecDeque};
use std::ffi::OsString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use mapsock_channel::{RegionReader, RegionWriter};
use mapsock_watch::{DirWatch, WatchError, WatcherRegistry};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::naming;
use crate::session::{open_guard, HeldLock, Session, Unwind};

/// A bound port inside a rendezvous directory.
///
/// Binding creates the port's sentinel file and takes an exclusive
/// whole-file lock on it; a second bind of the same port fails with
/// [`SessionError::PortInUse`]. The lock is released on the first
/// [`Listener::accept`], signalling that connection markers will now
/// be answered.
pub struct Listener {
    dir: PathBuf,
    port: u16,
    config: SessionConfig,
    registry: WatcherRegistry,
    watch: Arc<DirWatch>,
    sentinel: File,
    sentinel_path: PathBuf,
    sentinel_released: bool,
    /// Marker names found but not yet handed to `accept` callers.
    pending: VecDeque<String>,
    /// Markers already answered (or given up on).
    seen: HashSet<String>,
    closed: bool,
}

impl Listener {
    /// Bind `port` inside `dir`, creating the directory if needed.
    pub fn bind(
        dir: impl AsRef<Path>,
        port: u16,
        registry: &WatcherRegistry,
        config: SessionConfig,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let sentinel_path = dir.join(naming::sentinel(port));
        let sentinel = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&sentinel_path)?;
        FileExt::try_lock_exclusive(&sentinel).map_err(|err| {
            if err.kind() == io::ErrorKind::WouldBlock {
                SessionError::PortInUse { port }
            } else {
                SessionError::Io(err)
            }
        })?;

        // Markers from a previous owner of this port can no longer be
        // answered; their connectors have timed out by now.
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if naming::is_marker(name, port) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        // The port prefix keeps this watch blind to other ports'
        // traffic in the same directory.
        let watch = registry.watch(&dir, &naming::port_prefix(port))?;
        watch.clear_created();
        tracing::info!(dir = %dir.display(), port, "listener bound");

        Ok(Listener {
            dir,
            port,
            config,
            registry: registry.clone(),
            watch,
            sentinel,
            sentinel_path,
            sentinel_released: false,
            pending: VecDeque::new(),
            seen: HashSet::new(),
            closed: false,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Block until at least one connector is answered. Markers that
    /// arrived together are answered together, so the result is a
    /// batch.
    pub fn accept(&mut self) -> Result<Vec<Session>> {
        self.accept_inner(None)
    }

    /// Like [`Listener::accept`] but gives up after `timeout`,
    /// returning an empty batch.
    pub fn accept_timeout(&mut self, timeout: Duration) -> Result<Vec<Session>> {
        self.accept_inner(Some(Instant::now() + timeout))
    }

    fn accept_inner(&mut self, deadline: Option<Instant>) -> Result<Vec<Session>> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if !self.sentinel_released {
            FileExt::unlock(&self.sentinel)?;
            self.sentinel_released = true;
            // Connectors may have dropped markers between bind and the
            // first accept; the watch was not yet being drained.
            for entry in std::fs::read_dir(&self.dir)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    if naming::is_marker(name, self.port) {
                        self.pending.push_back(name.to_string());
                    }
                }
            }
        }

        loop {
            let mut fresh: Vec<String> = self.pending.drain(..).collect();
            if fresh.is_empty() {
                match self.watch.wait_created(self.config.accept_poll) {
                    Ok(batch) => {
                        for name in batch {
                            if let Some(name) = name.to_str() {
                                if naming::is_marker(name, self.port) {
                                    fresh.push(name.to_string());
                                }
                            }
                        }
                    }
                    Err(WatchError::Stopped) => {
                        // Expired from the registry between accepts.
                        self.watch = self
                            .registry
                            .watch(&self.dir, &naming::port_prefix(self.port))?;
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            let mut sessions = Vec::new();
            for name in fresh {
                if !self.seen.insert(name.clone()) {
                    continue;
                }
                match self.establish(&name) {
                    Ok(session) => sessions.push(session),
                    // One bad connector must not take the listener
                    // down; the candidate is dropped.
                    Err(err) => {
                        tracing::warn!(session = %name, %err, "handshake failed; candidate dropped");
                    }
                }
            }
            if !sessions.is_empty() {
                return Ok(sessions);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(Vec::new());
                }
            }
        }
    }

    /// Answer one marker: publish the region pair, wait for the
    /// connector's acknowledgement, then attach to its region.
    fn establish(&self, session: &str) -> Result<Session> {
        let in_path = self.dir.join(naming::inbound(session));
        let out_path = self.dir.join(naming::outbound(session));
        let marker_path = self.dir.join(session);
        let own_lock_path = self.dir.join(naming::server_lock(session));
        let ack_path = self.dir.join(naming::client_ack(session));

        // Removes everything this attempt created on any failure below,
        // timeout and error alike.
        let mut unwind = Unwind::new();
        let writer = RegionWriter::create(&in_path)?;
        unwind.push(in_path.clone());
        let own_lock = HeldLock::create(&own_lock_path)?;
        unwind.push(own_lock_path.clone());
        // Placeholder the connector sizes into a region of its own.
        File::create(&out_path)?;
        unwind.push(out_path.clone());
        unwind.push(marker_path.clone());
        unwind.push(ack_path.clone());

        let ack_name = OsString::from(naming::client_ack(session));
        if !self.watch.wait_for(&ack_name, self.config.ack_timeout)? {
            drop(writer);
            drop(own_lock);
            return Err(SessionError::AcceptTimeout {
                session: session.to_string(),
            });
        }

        let peer_guard = open_guard(&self.dir.join(naming::client_lock(session)))?;
        let reader = RegionReader::with_guard(&out_path, Arc::clone(&peer_guard))?;
        unwind.disarm();

        // Handshake litter; the session files stay until close.
        let _ = std::fs::remove_file(&marker_path);
        let _ = std::fs::remove_file(&ack_path);

        Ok(Session::establish(
            session.to_string(),
            self.dir.clone(),
            writer,
            reader,
            own_lock,
            peer_guard,
            vec![in_path, out_path, own_lock_path],
        ))
    }

    /// Unbind the port. Established sessions are unaffected.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.sentinel_released {
            let _ = FileExt::unlock(&self.sentinel);
            self.sentinel_released = true;
        }
        let _ = std::fs::remove_file(&self.sentinel_path);
        tracing::info!(dir = %self.dir.display(), port = self.port, "listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("dir", &self.dir)
            .field("port", &self.port)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
