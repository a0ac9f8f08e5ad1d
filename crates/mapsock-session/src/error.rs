use std::time::Duration;

use mapsock_channel::ChannelError;
use mapsock_watch::WatchError;

/// Errors raised while establishing or using a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No listener sentinel exists for the port.
    #[error("no listener on port {port}")]
    ConnectFailed { port: u16 },

    /// The listener never answered the connection marker.
    #[error("connect to port {port} timed out after {timeout:?}")]
    ConnectTimeout { port: u16, timeout: Duration },

    /// A connector announced itself but never finished its half of the
    /// handshake.
    #[error("handshake for session {session} timed out")]
    AcceptTimeout { session: String },

    /// Another listener already holds the port sentinel.
    #[error("port {port} is already bound")]
    PortInUse { port: u16 },

    /// Operation attempted on a closed session.
    #[error("session closed")]
    Closed,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
