//! Socket-like byte streams over memory-mapped files.
//!
//! mapsock lets two processes on one machine talk through a shared
//! directory: a listener binds a "port" there, connectors rendezvous
//! with it through marker files, and established sessions exchange
//! bytes over memory-mapped ring regions signalled by advisory file
//! locks.
//!
//! # Crate Structure
//!
//! - [`channel`] — Framed byte channels over mapped region files
//! - [`watch`] — Directory-change waiting with a bounded watcher cache
//! - [`session`] — Filesystem rendezvous: listener, connector, session

/// Re-export channel types.
pub mod channel {
    pub use mapsock_channel::*;
}

/// Re-export watch types.
pub mod watch {
    pub use mapsock_watch::*;
}

/// Re-export session types.
pub mod session {
    pub use mapsock_session::*;
}

#[cfg(feature = "logging")]
pub mod logging;

pub use mapsock_session::{Connector, Listener, Session, SessionConfig, SessionError};
pub use mapsock_watch::WatcherRegistry;
