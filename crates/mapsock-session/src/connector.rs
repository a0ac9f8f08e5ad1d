//! Connecting to a bound port.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use mapsock_channel::{RegionReader, RegionWriter};
use mapsock_watch::WatcherRegistry;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::naming;
use crate::session::{open_guard, HeldLock, Session, Unwind};

/// Connection factory for one rendezvous directory.
pub struct Connector {
    dir: PathBuf,
    registry: WatcherRegistry,
    config: SessionConfig,
}

impl Connector {
    pub fn new(dir: impl AsRef<Path>, registry: &WatcherRegistry) -> Self {
        Self::with_config(dir, registry, SessionConfig::default())
    }

    pub fn with_config(
        dir: impl AsRef<Path>,
        registry: &WatcherRegistry,
        config: SessionConfig,
    ) -> Self {
        Connector {
            dir: dir.as_ref().to_path_buf(),
            registry: registry.clone(),
            config,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Connect to `port`.
    ///
    /// Fails immediately with [`SessionError::ConnectFailed`] when no
    /// sentinel exists, and with [`SessionError::ConnectTimeout`] when
    /// a sentinel is present but nothing answers the marker within the
    /// configured setup timeout (a listener that died without cleaning
    /// up looks like this).
    pub fn connect(&self, port: u16) -> Result<Session> {
        let sentinel_path = self.dir.join(naming::sentinel(port));
        if !sentinel_path.exists() {
            return Err(SessionError::ConnectFailed { port });
        }
        self.await_accepting(port, &sentinel_path)?;

        let session = naming::new_session(port);
        let watch = self.registry.watch(&self.dir, &naming::port_prefix(port))?;
        // Removes everything this attempt created on any failure below,
        // timeout and error alike.
        let mut unwind = Unwind::new();
        let marker_path = self.dir.join(&session);
        File::create(&marker_path)?;
        unwind.push(marker_path);
        tracing::debug!(session = %session, port, "marker dropped");

        let out_name = OsString::from(naming::outbound(&session));
        if !watch.wait_for(&out_name, self.config.setup_timeout)? {
            return Err(SessionError::ConnectTimeout {
                port,
                timeout: self.config.setup_timeout,
            });
        }

        let out_path = self.dir.join(naming::outbound(&session));
        let own_lock_path = self.dir.join(naming::client_lock(&session));
        let writer = RegionWriter::open(&out_path)?;
        let own_lock = HeldLock::create(&own_lock_path)?;
        unwind.push(own_lock_path.clone());
        let ack_path = self.dir.join(naming::client_ack(&session));
        File::create(&ack_path)?;
        unwind.push(ack_path);

        let in_name = OsString::from(naming::inbound(&session));
        if !watch.wait_for(&in_name, self.config.setup_timeout)? {
            drop(writer);
            drop(own_lock);
            return Err(SessionError::ConnectTimeout {
                port,
                timeout: self.config.setup_timeout,
            });
        }

        let peer_guard = open_guard(&self.dir.join(naming::server_lock(&session)))?;
        let reader = RegionReader::with_guard(
            self.dir.join(naming::inbound(&session)),
            Arc::clone(&peer_guard),
        )?;
        // The session owns its files from here; the listener removes
        // the marker and the ack when its side completes.
        unwind.disarm();

        Ok(Session::establish(
            session,
            self.dir.clone(),
            writer,
            reader,
            own_lock,
            peer_guard,
            vec![own_lock_path],
        ))
    }

    /// The listener holds the sentinel lock until its first accept;
    /// take and release a shared lock so the marker is only dropped
    /// once someone is (or was) answering. Bounded by the setup
    /// timeout rather than blocking indefinitely on an idle listener.
    fn await_accepting(&self, port: u16, sentinel_path: &Path) -> Result<()> {
        let sentinel = std::fs::OpenOptions::new().read(true).open(sentinel_path)?;
        let deadline = std::time::Instant::now() + self.config.setup_timeout;
        loop {
            // Qualified: std::fs::File grew an inherent try_lock_shared
            // with a different error type, and the inherent method wins.
            match FileExt::try_lock_shared(&sentinel) {
                Ok(()) => {
                    FileExt::unlock(&sentinel)?;
                    return Ok(());
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if std::time::Instant::now() >= deadline {
                        return Err(SessionError::ConnectTimeout {
                            port,
                            timeout: self.config.setup_timeout,
                        });
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
