//! Socket-like sessions rendezvoused through a shared directory.
//!
//! A [`Listener`] binds a port inside a directory by creating a
//! sentinel file; a [`Connector`] announces itself by dropping a
//! uniquely named marker next to it. The two sides then exchange a
//! pair of mapped region files, one per direction, and advertise
//! liveness through held lock files so either side notices when the
//! other goes away.

pub mod config;
pub mod connector;
pub mod error;
pub mod listener;
pub mod naming;
pub mod session;

pub use config::SessionConfig;
pub use connector::Connector;
pub use error::{Result, SessionError};
pub use listener::Listener;
pub use session::Session;
