//! A single directory watch.

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Result, WatchError};

/// Creation events nobody drained are dropped past this point.
const CREATED_BACKLOG: usize = 4096;

pub(crate) struct WatchState {
    /// Names created in the directory since the last drain.
    created: VecDeque<OsString>,
    /// Names removed from the directory. Kept only as a wakeup hint;
    /// deletion waits recheck the filesystem.
    removed: VecDeque<OsString>,
    /// Callers currently blocked on the condition variable. The
    /// registry sweeper never evicts a watch somebody is waiting on.
    waiters: usize,
    last_used: Instant,
    stopped: bool,
}

/// A live watch on one directory, filtered to one name prefix.
///
/// Only names starting with the prefix are recorded (an empty prefix
/// records everything), so consumers sharing a directory never drain
/// each other's events. Handed out by [`crate::WatcherRegistry`]; all
/// waiting methods return [`WatchError::Stopped`] once the registry
/// evicts the watch.
pub struct DirWatch {
    dir: PathBuf,
    prefix: String,
    state: Mutex<WatchState>,
    cond: Condvar,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl DirWatch {
    pub(crate) fn start(dir: &Path, prefix: &str) -> Result<Arc<Self>> {
        let watch = Arc::new(DirWatch {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            state: Mutex::new(WatchState {
                created: VecDeque::new(),
                removed: VecDeque::new(),
                waiters: 0,
                last_used: Instant::now(),
                stopped: false,
            }),
            cond: Condvar::new(),
            watcher: Mutex::new(None),
        });

        // The handler only holds a weak reference so dropping the
        // watch tears the platform watcher down with it.
        let weak: Weak<DirWatch> = Arc::downgrade(&watch);
        let mut watcher = notify::recommended_watcher(
            move |event: std::result::Result<Event, notify::Error>| {
                let Some(watch) = weak.upgrade() else {
                    return;
                };
                match event {
                    Ok(event) if matches!(event.kind, EventKind::Create(_)) => {
                        watch.record(&event.paths, false);
                    }
                    Ok(event) if matches!(event.kind, EventKind::Remove(_)) => {
                        watch.record(&event.paths, true);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(dir = %watch.dir.display(), %err, "watch event error");
                    }
                }
            },
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        *watch
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        tracing::debug!(dir = %dir.display(), "directory watch started");
        Ok(watch)
    }

    fn record(&self, paths: &[PathBuf], removal: bool) {
        let mut state = self.lock_state();
        for path in paths {
            if let Some(name) = path.file_name() {
                if !name.as_encoded_bytes().starts_with(self.prefix.as_bytes()) {
                    continue;
                }
                let queue = if removal {
                    &mut state.removed
                } else {
                    &mut state.created
                };
                if queue.len() >= CREATED_BACKLOG {
                    queue.pop_front();
                }
                queue.push_back(name.to_os_string());
            }
        }
        self.cond.notify_all();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory this watch observes.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Name prefix this watch records; empty means everything.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Block until `name` exists in the directory. Returns `false` on
    /// timeout.
    pub fn wait_for(&self, name: &OsStr, timeout: Duration) -> Result<bool> {
        let target = self.dir.join(name);
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        state.waiters += 1;
        let outcome = loop {
            if state.stopped {
                break Err(WatchError::Stopped);
            }
            state.last_used = Instant::now();
            if target.exists() {
                break Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                break Ok(false);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        };
        state.waiters -= 1;
        outcome
    }

    /// Block until `name` no longer exists in the directory. Returns
    /// `false` on timeout.
    pub fn wait_removed(&self, name: &OsStr, timeout: Duration) -> Result<bool> {
        let target = self.dir.join(name);
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        state.waiters += 1;
        let outcome = loop {
            if state.stopped {
                break Err(WatchError::Stopped);
            }
            state.last_used = Instant::now();
            state.removed.clear();
            if !target.exists() {
                break Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                break Ok(false);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        };
        state.waiters -= 1;
        outcome
    }

    /// Block until at least one creation event arrives, then drain the
    /// backlog. An empty vector means the timeout elapsed first.
    pub fn wait_created(&self, timeout: Duration) -> Result<Vec<OsString>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        state.waiters += 1;
        let outcome = loop {
            if state.stopped {
                break Err(WatchError::Stopped);
            }
            state.last_used = Instant::now();
            if !state.created.is_empty() {
                break Ok(state.created.drain(..).collect());
            }
            let now = Instant::now();
            if now >= deadline {
                break Ok(Vec::new());
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        };
        state.waiters -= 1;
        outcome
    }

    /// Drop creation events recorded so far.
    pub fn clear_created(&self) {
        self.lock_state().created.clear();
    }

    pub(crate) fn touch(&self) {
        self.lock_state().last_used = Instant::now();
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.lock_state().last_used
    }

    pub(crate) fn is_idle_since(&self, cutoff: Instant) -> bool {
        let state = self.lock_state();
        state.waiters == 0 && state.last_used < cutoff
    }

    pub(crate) fn has_waiters(&self) -> bool {
        self.lock_state().waiters > 0
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.lock_state().stopped
    }

    /// Tear the platform watcher down and fail all waiters.
    pub(crate) fn stop(&self) {
        {
            let mut state = self.lock_state();
            if state.stopped {
                return;
            }
            state.stopped = true;
            self.cond.notify_all();
        }
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::debug!(dir = %self.dir.display(), "directory watch stopped");
    }
}

impl Drop for DirWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock should be past the epoch")
            .subsec_nanos();
        let dir = std::env::temp_dir().join(format!(
            "mapsock-watch-{tag}-{}-{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    #[test]
    fn existing_file_is_found_immediately() {
        let dir = temp_dir("existing");
        std::fs::File::create(dir.join("already-here")).expect("file should be creatable");
        let watch = DirWatch::start(&dir, "").expect("watch should start");
        let found = watch
            .wait_for(OsStr::new("already-here"), Duration::from_millis(100))
            .expect("wait_for should not error");
        assert!(found);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn late_file_wakes_the_waiter() {
        let dir = temp_dir("late");
        let watch = DirWatch::start(&dir, "").expect("watch should start");

        let target = dir.join("appears-later");
        let creator = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            std::fs::File::create(target).expect("file should be creatable");
        });

        let found = watch
            .wait_for(OsStr::new("appears-later"), Duration::from_secs(5))
            .expect("wait_for should not error");
        assert!(found);

        creator.join().expect("creator should not panic");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn wait_for_times_out_without_the_file() {
        let dir = temp_dir("timeout");
        let watch = DirWatch::start(&dir, "").expect("watch should start");
        let start = Instant::now();
        let found = watch
            .wait_for(OsStr::new("never"), Duration::from_millis(80))
            .expect("wait_for should not error");
        assert!(!found);
        assert!(start.elapsed() < Duration::from_secs(5));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn removal_wakes_the_waiter() {
        let dir = temp_dir("removal");
        let target = dir.join("doomed");
        std::fs::File::create(&target).expect("file should be creatable");
        let watch = DirWatch::start(&dir, "").expect("watch should start");

        let remover = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            std::fs::remove_file(target).expect("file should be removable");
        });

        let gone = watch
            .wait_removed(OsStr::new("doomed"), Duration::from_secs(5))
            .expect("wait_removed should not error");
        assert!(gone);

        let gone = watch
            .wait_removed(OsStr::new("never-existed"), Duration::from_millis(50))
            .expect("wait_removed should not error");
        assert!(gone, "an absent file already satisfies a removal wait");

        remover.join().expect("remover should not panic");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn created_names_are_drained_in_batches() {
        let dir = temp_dir("batch");
        let watch = DirWatch::start(&dir, "").expect("watch should start");

        std::fs::File::create(dir.join("one")).expect("file should be creatable");
        std::fs::File::create(dir.join("two")).expect("file should be creatable");

        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.len() < 2 {
            assert!(Instant::now() < deadline, "creation events never arrived");
            let batch = watch
                .wait_created(Duration::from_millis(200))
                .expect("wait_created should not error");
            seen.extend(batch);
        }
        assert!(seen.contains(&OsString::from("one")));
        assert!(seen.contains(&OsString::from("two")));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn names_outside_the_prefix_are_not_recorded() {
        let dir = temp_dir("prefix");
        let watch = DirWatch::start(&dir, "red_").expect("watch should start");

        std::fs::File::create(dir.join("blue_first")).expect("file should be creatable");
        std::fs::File::create(dir.join("red_first")).expect("file should be creatable");

        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.is_empty() {
            assert!(Instant::now() < deadline, "creation events never arrived");
            let batch = watch
                .wait_created(Duration::from_millis(200))
                .expect("wait_created should not error");
            seen.extend(batch);
        }
        assert_eq!(seen, [OsString::from("red_first")]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn stop_fails_pending_and_future_waits() {
        let dir = temp_dir("stop");
        let watch = DirWatch::start(&dir, "").expect("watch should start");

        let waiter = {
            let watch = Arc::clone(&watch);
            std::thread::spawn(move || watch.wait_for(OsStr::new("never"), Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(50));
        watch.stop();

        let outcome = waiter.join().expect("waiter should not panic");
        assert!(matches!(outcome, Err(WatchError::Stopped)));
        assert!(matches!(
            watch.wait_created(Duration::from_millis(10)),
            Err(WatchError::Stopped)
        ));
        let _ = std::fs::remove_dir_all(dir);
    }
}
