/// Errors raised while watching directories.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The watch was evicted from its registry while a caller was
    /// still waiting on it.
    #[error("watch stopped")]
    Stopped,

    /// The platform watcher rejected the directory.
    #[error("watch setup failed: {0}")]
    Notify(#[from] notify::Error),

    #[error("watch I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WatchError>;
