//! Producing half of a mapped channel.
//!
//! The writer always holds an exclusive lock on the header slot it
//! will fill next. To publish a frame it copies the payload, writes
//! the length header, locks the following slot and only then releases
//! the current one. A reader blocked on the current slot therefore
//! wakes exactly when the frame under it is complete.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::MmapMut;

use crate::error::{ChannelError, Result};
use crate::frame::{padded_len, HEADER_SIZE, REGION_SIZE};
use crate::lock::{LockKind, RangeLock};

/// Writing end of a region file.
pub struct RegionWriter {
    path: PathBuf,
    file: Arc<File>,
    map: MmapMut,
    /// Offset of the header slot the next frame will occupy.
    pos: usize,
    /// Exclusive lock on the slot at `pos`.
    anchor: Option<RangeLock>,
    closed: bool,
}

impl RegionWriter {
    /// Create (or adopt) the region file at `path` and take up the
    /// writer position at the start of the region.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(path.as_ref(), true)
    }

    /// Attach to a region file another side already created. Fails if
    /// the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(path.as_ref(), false)
    }

    fn build(path: &Path, create: bool) -> Result<Self> {
        let path = path.to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .map_err(|err| ChannelError::map(&path, err))?;
        file.set_len(REGION_SIZE as u64)
            .map_err(|err| ChannelError::map(&path, err))?;
        let mut map =
            unsafe { MmapMut::map_mut(&file) }.map_err(|err| ChannelError::map(&path, err))?;
        let file = Arc::new(file);

        let anchor = RangeLock::acquire(&file, LockKind::Exclusive, 0, HEADER_SIZE as u64)?;
        map[0..HEADER_SIZE].copy_from_slice(&0u32.to_ne_bytes());
        tracing::debug!(path = %path.display(), "region writer ready");

        Ok(RegionWriter {
            path,
            file,
            map,
            pos: 0,
            anchor: Some(anchor),
            closed: false,
        })
    }

    /// Append `payload` to the channel. Payloads larger than the space
    /// left before the end of the region are split across frames; the
    /// reading side sees one contiguous byte stream either way.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let mut rest = payload;
        while !rest.is_empty() {
            let room = REGION_SIZE - self.pos - HEADER_SIZE;
            let take = rest.len().min(room);
            self.write_frame(&rest[..take])?;
            rest = &rest[take..];
        }
        Ok(())
    }

    fn write_frame(&mut self, chunk: &[u8]) -> Result<()> {
        let slot = self.pos;
        let payload_at = slot + HEADER_SIZE;
        let padded = padded_len(chunk.len());

        let payload_lock = RangeLock::acquire(
            &self.file,
            LockKind::Exclusive,
            payload_at as u64,
            padded as u64,
        )?;
        self.map[payload_at..payload_at + chunk.len()].copy_from_slice(chunk);
        self.map[slot..slot + HEADER_SIZE].copy_from_slice(&(chunk.len() as u32).to_ne_bytes());

        let next = match payload_at + padded {
            REGION_SIZE => 0,
            at => at,
        };
        // Lock the next slot before releasing this one so a waiting
        // reader can never overtake the writer.
        let next_anchor = RangeLock::acquire(
            &self.file,
            LockKind::Exclusive,
            next as u64,
            HEADER_SIZE as u64,
        )?;
        self.anchor = Some(next_anchor);
        self.map[next..next + HEADER_SIZE].copy_from_slice(&0u32.to_ne_bytes());
        drop(payload_lock);

        self.pos = next;
        Ok(())
    }

    /// Release the writer position. A reader that reaches the final
    /// slot afterwards finds a zero header with no lock on it, which
    /// is its end-of-stream signal.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.map.flush()?;
        self.anchor = None;
        tracing::debug!(path = %self.path.display(), "region writer closed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RegionWriter {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                tracing::warn!(path = %self.path.display(), %err, "writer close on drop failed");
            }
        }
    }
}

impl fmt::Debug for RegionWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionWriter")
            .field("path", &self.path)
            .field("pos", &self.pos)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl io::Write for RegionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RegionWriter::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Frames are published at write time; nothing is buffered here.
        Ok(())
    }
}
