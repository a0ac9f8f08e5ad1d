//! Directory-change wait/notify primitives.
//!
//! Rendezvous over a shared directory needs one thing done well:
//! block until a file with a known name (or prefix) appears, without
//! spinning on `readdir`. [`DirWatch`] wraps a platform watcher behind
//! a condition variable, and [`WatcherRegistry`] caches one watch per
//! (directory, name prefix) pair with idle expiry and a size cap.

pub mod error;
pub mod registry;
pub mod watcher;

pub use error::{Result, WatchError};
pub use registry::{RegistryConfig, WatcherRegistry};
pub use watcher::DirWatch;
