//! Periodically drained write buffer.
//!
//! `PeriodicWriter` batches small writes in a byte area and lets a
//! background task drain them into the sink on a fixed period. The
//! append path takes no lock: the producer owns the write cursor and
//! the drain task only reads bytes at or below it. The two meet only
//! on overflow, when the producer drains synchronously under the sink
//! lock and resets both cursors.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{ChannelError, Result};

/// Default byte area size.
pub const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// Default drain period for the background task.
pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_millis(500);

struct Sink<W> {
    inner: W,
    /// First error hit by the drain task; surfaced on the next call.
    failed: Option<std::io::ErrorKind>,
}

struct Shared<W> {
    area: std::cell::UnsafeCell<Box<[u8]>>,
    /// Bytes appended by the producer. Only the producer stores here.
    write_cursor: AtomicUsize,
    /// Bytes already drained into the sink. Stored only while the
    /// sink lock is held.
    flush_cursor: AtomicUsize,
    sink: Mutex<Sink<W>>,
    shutdown: Mutex<bool>,
    wake: Condvar,
    closed: AtomicBool,
}

// The byte area is written only by the single producer and read by
// the drain task strictly below the write cursor, which the producer
// publishes with release ordering.
unsafe impl<W: Write + Send> Sync for Shared<W> {}

impl<W: Write> Shared<W> {
    /// Push everything between the cursors into the sink. Caller holds
    /// the sink lock through `sink`.
    fn drain(&self, sink: &mut Sink<W>) -> std::io::Result<()> {
        let done = self.flush_cursor.load(Ordering::Relaxed);
        let filled = self.write_cursor.load(Ordering::Acquire);
        if filled > done {
            let area = unsafe { &*self.area.get() };
            sink.inner.write_all(&area[done..filled])?;
            self.flush_cursor.store(filled, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Buffered writer over any sink, drained on a timer.
///
/// Not `Clone`: there is exactly one producer. The sink itself is
/// shared with the drain task behind a mutex.
pub struct PeriodicWriter<W: Write + Send + 'static> {
    shared: Arc<Shared<W>>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl<W: Write + Send + 'static> PeriodicWriter<W> {
    /// Wrap `sink` with the default capacity and drain period.
    pub fn new(sink: W) -> Self {
        Self::with_capacity(sink, DEFAULT_BUFFER_CAPACITY, DEFAULT_FLUSH_PERIOD)
    }

    /// Wrap `sink` with an explicit byte area size and drain period.
    pub fn with_capacity(sink: W, capacity: usize, period: Duration) -> Self {
        let shared = Arc::new(Shared {
            area: std::cell::UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            write_cursor: AtomicUsize::new(0),
            flush_cursor: AtomicUsize::new(0),
            sink: Mutex::new(Sink {
                inner: sink,
                failed: None,
            }),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let task_shared = Arc::clone(&shared);
        let task = std::thread::Builder::new()
            .name("mapsock-flush".into())
            .spawn(move || run_drain_task(task_shared, period))
            .ok();
        if task.is_none() {
            tracing::warn!("flush task failed to start; writes drain synchronously");
        }

        PeriodicWriter {
            shared,
            task,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed || self.shared.closed.load(Ordering::Relaxed) {
            return Err(ChannelError::BufferClosed);
        }
        Ok(())
    }

    fn take_failure(sink: &mut Sink<W>) -> Result<()> {
        match sink.failed {
            Some(kind) => Err(ChannelError::Io(kind.into())),
            None => Ok(()),
        }
    }

    /// Append `buf`, draining synchronously when it does not fit.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        let capacity = unsafe { &*self.shared.area.get() }.len();
        let at = self.shared.write_cursor.load(Ordering::Relaxed);

        if buf.len() <= capacity - at {
            let area = unsafe { &mut *self.shared.area.get() };
            area[at..at + buf.len()].copy_from_slice(buf);
            self.shared
                .write_cursor
                .store(at + buf.len(), Ordering::Release);
            return Ok(());
        }

        // Overflow path: empty the area under the sink lock, then
        // either restart the area or bypass it for oversized writes.
        let mut sink = self
            .shared
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Self::take_failure(&mut sink)?;
        self.shared.drain(&mut sink)?;
        self.shared.write_cursor.store(0, Ordering::Release);
        self.shared.flush_cursor.store(0, Ordering::Relaxed);

        if buf.len() > capacity {
            sink.inner.write_all(buf)?;
        } else {
            drop(sink);
            let area = unsafe { &mut *self.shared.area.get() };
            area[..buf.len()].copy_from_slice(buf);
            self.shared.write_cursor.store(buf.len(), Ordering::Release);
        }
        Ok(())
    }

    /// Drain the area and flush the sink.
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        let mut sink = self
            .shared
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Self::take_failure(&mut sink)?;
        self.shared.drain(&mut sink)?;
        sink.inner.flush()?;
        Ok(())
    }

    /// Flush, stop the drain task and release the sink.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = self.flush();
        self.closed = true;
        self.shared.closed.store(true, Ordering::Relaxed);
        {
            let mut down = self
                .shared
                .shutdown
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *down = true;
            self.shared.wake.notify_all();
        }
        if let Some(task) = self.task.take() {
            if task.join().is_err() {
                tracing::warn!("flush task panicked");
            }
        }
        flushed
    }
}

fn run_drain_task<W: Write>(shared: Arc<Shared<W>>, period: Duration) {
    let mut down = shared
        .shutdown
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    loop {
        if *down {
            return;
        }
        let (guard, _timeout) = match shared.wake.wait_timeout(down, period) {
            Ok(pair) => pair,
            Err(poisoned) => {
                down = poisoned.into_inner().0;
                continue;
            }
        };
        down = guard;
        if *down {
            return;
        }
        let mut sink = shared.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if sink.failed.is_some() {
            continue;
        }
        if let Err(err) = shared.drain(&mut sink).and_then(|()| sink.inner.flush()) {
            tracing::warn!(%err, "periodic drain failed; closing buffer");
            sink.failed = Some(err.kind());
            shared.closed.store(true, Ordering::Relaxed);
        }
    }
}

impl<W: Write + Send + 'static> Drop for PeriodicWriter<W> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                tracing::warn!(%err, "buffer close on drop failed");
            }
        }
    }
}

impl<W: Write + Send + 'static> Write for PeriodicWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        PeriodicWriter::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        PeriodicWriter::flush(self).map_err(std::io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn snapshot(&self) -> Vec<u8> {
            self.0.lock().expect("sink lock should not poison").clone()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .expect("sink lock should not poison")
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "down"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn small_writes_stay_buffered_until_flush() {
        let sink = SharedSink::default();
        let mut writer =
            PeriodicWriter::with_capacity(sink.clone(), 64, Duration::from_secs(3600));

        writer.write(b"alpha").expect("write should succeed");
        assert!(sink.snapshot().is_empty(), "nothing should reach the sink yet");

        writer.flush().expect("flush should succeed");
        assert_eq!(sink.snapshot(), b"alpha");
        writer.close().expect("close should succeed");
    }

    #[test]
    fn overflow_drains_the_area_first() {
        let sink = SharedSink::default();
        let mut writer =
            PeriodicWriter::with_capacity(sink.clone(), 16, Duration::from_secs(3600));

        writer.write(b"0123456789").expect("first write should fit");
        assert!(sink.snapshot().is_empty());

        // 10 + 10 > 16 forces a drain of the first chunk before the
        // second is buffered.
        writer.write(b"abcdefghij").expect("second write should succeed");
        assert_eq!(sink.snapshot(), b"0123456789");

        writer.flush().expect("flush should succeed");
        assert_eq!(sink.snapshot(), b"0123456789abcdefghij");
        writer.close().expect("close should succeed");
    }

    #[test]
    fn oversized_writes_bypass_the_area() {
        let sink = SharedSink::default();
        let mut writer = PeriodicWriter::with_capacity(sink.clone(), 8, Duration::from_secs(3600));

        writer.write(b"ab").expect("small write should succeed");
        writer
            .write(b"the quick brown fox")
            .expect("oversized write should succeed");
        assert_eq!(sink.snapshot(), b"abthe quick brown fox");
        writer.close().expect("close should succeed");
    }

    #[test]
    fn drain_task_flushes_on_its_period() {
        let sink = SharedSink::default();
        let mut writer =
            PeriodicWriter::with_capacity(sink.clone(), 64, Duration::from_millis(20));

        writer.write(b"timed").expect("write should succeed");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.snapshot().is_empty() {
            assert!(
                std::time::Instant::now() < deadline,
                "drain task never flushed"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink.snapshot(), b"timed");
        writer.close().expect("close should succeed");
    }

    #[test]
    fn drain_failure_closes_the_buffer() {
        let mut writer =
            PeriodicWriter::with_capacity(FailingSink, 64, Duration::from_millis(10));

        writer.write(b"doomed").expect("buffered write should succeed");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            std::thread::sleep(Duration::from_millis(10));
            match writer.write(b"more") {
                Err(_) => break,
                Ok(()) => assert!(
                    std::time::Instant::now() < deadline,
                    "sink failure never surfaced"
                ),
            }
        }
        let err = writer.flush().expect_err("flush should report the failure");
        assert!(matches!(
            err,
            ChannelError::BufferClosed | ChannelError::Io(_)
        ));
    }

    #[test]
    fn write_after_close_is_rejected() {
        let sink = SharedSink::default();
        let mut writer = PeriodicWriter::new(sink);
        writer.close().expect("close should succeed");
        let err = writer.write(b"late").expect_err("write after close should fail");
        assert!(matches!(err, ChannelError::BufferClosed));
    }
}
