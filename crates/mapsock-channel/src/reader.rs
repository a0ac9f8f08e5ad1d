//! Consuming half of a mapped channel.
//!
//! The reader blocks by taking a shared lock on the header slot it
//! expects the next frame at. While the writer still owns that slot
//! the lock request parks in the kernel; when it is granted the header
//! is final and the lock is released at once. A zero header on a
//! grantable slot means the writer has left, so the peer guard (if
//! any) decides between end-of-stream and a not-yet-started writer.
//!
//! The reader holds no lock while consuming a frame: a writer that
//! laps a slow reader overwrites unread data. Callers bound how far
//! the producer may run ahead.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use memmap2::Mmap;

use crate::error::{ChannelError, Result};
use crate::frame::{padded_len, HEADER_SIZE, REGION_SIZE};
use crate::lock::{LockKind, RangeLock};

/// Wait between polls of a zero header whose writer may not have
/// attached yet.
const RETRY_WAIT: Duration = Duration::from_millis(1);

/// Reading end of a region file.
pub struct RegionReader {
    path: PathBuf,
    file: Arc<File>,
    map: Mmap,
    /// Offset of the header slot the next frame is expected at.
    pos: usize,
    /// Unread remainder of the current frame.
    frame_off: usize,
    frame_rem: usize,
    /// Peer liveness file. While the peer is up it holds an exclusive
    /// lock on the first byte; once that lock is grantable the peer is
    /// gone and a zero header means end of stream.
    guard: Option<Arc<File>>,
    closed: bool,
}

impl RegionReader {
    /// Open the region file at `path` for reading.
    ///
    /// Without a guard a zero header is treated as end of stream
    /// immediately; use [`RegionReader::with_guard`] when the peer
    /// advertises liveness through a lock file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(path.as_ref(), None)
    }

    /// Open the region file with a peer liveness guard.
    pub fn with_guard(path: impl AsRef<Path>, guard: Arc<File>) -> Result<Self> {
        Self::build(path.as_ref(), Some(guard))
    }

    fn build(path: &Path, guard: Option<Arc<File>>) -> Result<Self> {
        let path = path.to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| ChannelError::map(&path, err))?;
        // The writer may not have sized the file yet when the reader
        // attaches; mapping past the end would fault.
        if file
            .metadata()
            .map_err(|err| ChannelError::map(&path, err))?
            .len()
            < REGION_SIZE as u64
        {
            file.set_len(REGION_SIZE as u64)
                .map_err(|err| ChannelError::map(&path, err))?;
        }
        let map = unsafe { Mmap::map(&file) }.map_err(|err| ChannelError::map(&path, err))?;
        tracing::debug!(path = %path.display(), "region reader ready");

        Ok(RegionReader {
            path,
            file: Arc::new(file),
            map,
            pos: 0,
            frame_off: 0,
            frame_rem: 0,
            guard,
            closed: false,
        })
    }

    /// Read up to `buf.len()` bytes, blocking until at least one byte
    /// or end of stream. Returns `Ok(0)` only at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.frame_rem == 0 && !self.advance()? {
            return Ok(0);
        }
        let take = buf.len().min(self.frame_rem);
        buf[..take].copy_from_slice(&self.map[self.frame_off..self.frame_off + take]);
        self.frame_off += take;
        self.frame_rem -= take;
        Ok(take)
    }

    /// Bytes readable without blocking.
    pub fn available(&self) -> usize {
        if self.closed {
            return 0;
        }
        if self.frame_rem > 0 {
            return self.frame_rem;
        }
        match RangeLock::try_acquire(
            &self.file,
            LockKind::Shared,
            self.pos as u64,
            HEADER_SIZE as u64,
        ) {
            Ok(Some(_)) => self.header_at(self.pos) as usize,
            _ => 0,
        }
    }

    /// Block until the next frame is published. `false` means end of
    /// stream.
    fn advance(&mut self) -> Result<bool> {
        loop {
            let slot = self.pos;
            let lock = RangeLock::acquire(
                &self.file,
                LockKind::Shared,
                slot as u64,
                HEADER_SIZE as u64,
            )?;
            let len = self.header_at(slot) as usize;
            drop(lock);
            if len == 0 {
                if self.peer_departed()? {
                    tracing::debug!(path = %self.path.display(), "end of stream");
                    return Ok(false);
                }
                std::thread::sleep(RETRY_WAIT);
                continue;
            }
            self.frame_off = slot + HEADER_SIZE;
            self.frame_rem = len;
            self.pos = match slot + HEADER_SIZE + padded_len(len) {
                REGION_SIZE => 0,
                at => at,
            };
            return Ok(true);
        }
    }

    fn header_at(&self, at: usize) -> u32 {
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&self.map[at..at + HEADER_SIZE]);
        u32::from_ne_bytes(raw)
    }

    fn peer_departed(&self) -> Result<bool> {
        match &self.guard {
            None => Ok(true),
            Some(guard) => Ok(RangeLock::try_acquire(guard, LockKind::Shared, 0, 1)?.is_some()),
        }
    }

    /// Release the reader position.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.frame_rem = 0;
            tracing::debug!(path = %self.path.display(), "region reader closed");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for RegionReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionReader")
            .field("path", &self.path)
            .field("pos", &self.pos)
            .field("frame_rem", &self.frame_rem)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl io::Read for RegionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        RegionReader::read(self, buf).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::RegionWriter;
    use std::time::Instant;

    fn temp_region(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock should be past the epoch")
            .subsec_nanos();
        std::env::temp_dir().join(format!(
            "mapsock-reader-{tag}-{}-{nanos}",
            std::process::id()
        ))
    }

    fn read_exact(reader: &mut RegionReader, want: usize) -> Vec<u8> {
        let mut out = vec![0u8; want];
        let mut got = 0;
        while got < want {
            let n = reader
                .read(&mut out[got..])
                .expect("read should not error");
            assert_ne!(n, 0, "unexpected end of stream after {got} bytes");
            got += n;
        }
        out
    }

    #[test]
    fn round_trip_single_frame() {
        let path = temp_region("roundtrip");
        let mut writer = RegionWriter::create(&path).expect("writer should create region");
        let mut reader = RegionReader::open(&path).expect("reader should open region");

        writer.write(b"hello world").expect("write should succeed");
        assert_eq!(read_exact(&mut reader, 11), b"hello world");

        writer.close().expect("close should succeed");
        let mut rest = [0u8; 8];
        assert_eq!(
            reader.read(&mut rest).expect("read at eof should succeed"),
            0
        );

        drop(reader);
        drop(writer);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn short_reads_stay_within_a_frame() {
        let path = temp_region("partial");
        let mut writer = RegionWriter::create(&path).expect("writer should create region");
        let mut reader = RegionReader::open(&path).expect("reader should open region");

        writer.write(b"abcdef").expect("first write should succeed");
        writer.write(b"ghij").expect("second write should succeed");

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).expect("read should succeed"), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).expect("read should succeed"), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.read(&mut buf).expect("read should succeed"), 4);
        assert_eq!(&buf, b"ghij");

        drop(reader);
        drop(writer);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn stream_wraps_around_the_region() {
        let path = temp_region("wrap");
        let mut writer = RegionWriter::create(&path).expect("writer should create region");
        let mut reader = RegionReader::open(&path).expect("reader should open region");

        let frame = 100_000usize;
        let laps = 50; // 5 MB through a 4 MiB region
        for i in 0..laps {
            let payload = vec![(i % 251) as u8; frame];
            writer.write(&payload).expect("write should succeed");
            let got = read_exact(&mut reader, frame);
            assert_eq!(got, payload, "lap {i} corrupted");
        }

        drop(reader);
        drop(writer);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn blocked_reader_wakes_on_publication() {
        let path = temp_region("threads");
        let mut writer = RegionWriter::create(&path).expect("writer should create region");
        let mut reader = RegionReader::open(&path).expect("reader should open region");

        // Total volume stays under the region size so the free-running
        // producer cannot lap the consumer.
        let frames = 40usize;
        let frame = 64 * 1024usize;
        let producer = std::thread::spawn(move || {
            for i in 0..frames {
                let payload = vec![(i % 251) as u8; frame];
                writer.write(&payload).expect("write should succeed");
                std::thread::sleep(Duration::from_millis(1));
            }
            writer.close().expect("close should succeed");
        });

        for i in 0..frames {
            let got = read_exact(&mut reader, frame);
            assert!(
                got.iter().all(|&b| b == (i % 251) as u8),
                "frame {i} corrupted"
            );
        }
        let mut tail = [0u8; 1];
        assert_eq!(
            reader.read(&mut tail).expect("read at eof should succeed"),
            0
        );

        producer.join().expect("producer should not panic");
        drop(reader);
        let _ = std::fs::remove_file(path);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn guard_lock_defers_end_of_stream() {
        let path = temp_region("guard");
        let guard_path = temp_region("guard-file");
        let guard = Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(&guard_path)
                .expect("guard file should open"),
        );
        let held = RangeLock::acquire(&guard, LockKind::Exclusive, 0, 1)
            .expect("peer guard lock should succeed");

        let probe = Arc::new(
            std::fs::OpenOptions::new()
                .read(true)
                .open(&guard_path)
                .expect("guard probe should open"),
        );

        let mut writer = RegionWriter::create(&path).expect("writer should create region");
        let mut reader =
            RegionReader::with_guard(&path, probe).expect("reader should open region");

        writer.write(b"hi").expect("write should succeed");
        assert_eq!(read_exact(&mut reader, 2), b"hi");
        writer.close().expect("close should succeed");

        // Peer still holds its guard, so the zero header is not yet
        // end of stream; release it from another thread and check the
        // reader only returns after that.
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(held);
        });
        let start = Instant::now();
        let mut buf = [0u8; 4];
        assert_eq!(
            reader.read(&mut buf).expect("read at eof should succeed"),
            0
        );
        assert!(
            start.elapsed() >= Duration::from_millis(40),
            "reader reported end of stream while the peer guard was held"
        );

        releaser.join().expect("releaser should not panic");
        drop(reader);
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(guard_path);
    }

    #[test]
    fn available_reflects_published_frames() {
        let path = temp_region("avail");
        let mut writer = RegionWriter::create(&path).expect("writer should create region");
        let mut reader = RegionReader::open(&path).expect("reader should open region");

        assert_eq!(reader.available(), 0, "writer still owns the first slot");

        writer.write(b"12345").expect("write should succeed");
        assert_eq!(reader.available(), 5);

        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).expect("read should succeed"), 2);
        assert_eq!(reader.available(), 3);

        drop(reader);
        drop(writer);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn read_after_close_is_rejected() {
        let path = temp_region("closed");
        let writer = RegionWriter::create(&path).expect("writer should create region");
        let mut reader = RegionReader::open(&path).expect("reader should open region");
        reader.close();
        let mut buf = [0u8; 1];
        let err = reader
            .read(&mut buf)
            .expect_err("read after close should fail");
        assert!(matches!(err, ChannelError::Closed));
        drop(writer);
        let _ = std::fs::remove_file(path);
    }
}
