use std::path::PathBuf;

/// Errors that can occur on a mapped channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Operation attempted after the channel half was closed.
    #[error("channel closed")]
    Closed,

    /// Failed to create, size or map a region file. Fatal, not retried.
    #[error("failed to map region {path}: {source}")]
    Map {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Write buffer used after close.
    #[error("write buffer closed")]
    BufferClosed,

    /// An I/O error occurred while locking or touching the region.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub(crate) fn map(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChannelError::Map {
            path: path.into(),
            source,
        }
    }
}

impl From<ChannelError> for std::io::Error {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Io(io) => io,
            ChannelError::Map { source, .. } => source,
            other => std::io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
