//! Framed byte channels over memory-mapped files.
//!
//! One fixed-size mapped file per direction acts as a circular byte
//! arena. Frames are length-prefixed and cache-line padded, and all
//! cross-process signaling is done with advisory byte-range locks on
//! the backing file: a blocked reader is woken by the writer handing
//! its header-slot lock forward, not by polling.
//!
//! Unix only — the lock protocol is built on `fcntl` record locks.

pub mod buffer;
pub mod error;
pub mod frame;
pub mod lock;
pub mod reader;
pub mod writer;

pub use buffer::{PeriodicWriter, DEFAULT_BUFFER_CAPACITY, DEFAULT_FLUSH_PERIOD};
pub use error::{ChannelError, Result};
pub use frame::{padded_len, padding_after, CACHE_LINE, HEADER_SIZE, REGION_SIZE};
pub use lock::{LockKind, RangeLock};
pub use reader::RegionReader;
pub use writer::RegionWriter;
