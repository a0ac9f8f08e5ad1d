//! Bounded cache of directory watches.
//!
//! Platform watch handles are a finite resource, so watches are shared
//! per (directory, prefix) pair, expired after an idle period and
//! capped in number. A background sweeper enforces the idle expiry;
//! the cap is enforced at insert time by evicting the least recently
//! used entry nobody is waiting on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::watcher::DirWatch;

/// Tuning for a [`WatcherRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound on concurrently live watches.
    pub max_entries: usize,
    /// Idle time after which a watch is expired.
    pub idle_ttl: Duration,
    /// How often the sweeper looks for expired watches.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            max_entries: 1000,
            idle_ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl RegistryConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

type WatchKey = (PathBuf, String);

struct RegistryInner {
    config: RegistryConfig,
    entries: Mutex<HashMap<WatchKey, Arc<DirWatch>>>,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

/// Shared, bounded collection of directory watches.
///
/// Cloning is cheap and clones share the same cache and sweeper.
#[derive(Clone)]
pub struct WatcherRegistry {
    inner: Arc<RegistryInner>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
    // Counts user handles only; the sweeper keeps its own reference to
    // the inner state, so inner's count cannot signal the last drop.
    handle: Arc<()>,
}

impl WatcherRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let inner = Arc::new(RegistryInner {
            config,
            entries: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });

        let sweep_inner = Arc::clone(&inner);
        let sweeper = std::thread::Builder::new()
            .name("mapsock-watch-sweep".into())
            .spawn(move || run_sweeper(sweep_inner))
            .ok();
        if sweeper.is_none() {
            tracing::warn!("watch sweeper failed to start; idle watches will not expire");
        }

        WatcherRegistry {
            inner,
            sweeper: Arc::new(Mutex::new(sweeper)),
            handle: Arc::new(()),
        }
    }

    /// Get the watch for `dir` filtered to names starting with
    /// `prefix`, starting one if needed. An empty prefix watches every
    /// name in the directory.
    pub fn watch(&self, dir: &Path, prefix: &str) -> Result<Arc<DirWatch>> {
        let key = (dir.to_path_buf(), prefix.to_string());
        let mut entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(watch) = entries.get(&key) {
            if !watch.is_stopped() {
                watch.touch();
                return Ok(Arc::clone(watch));
            }
            entries.remove(&key);
        }

        if entries.len() >= self.inner.config.max_entries {
            Self::evict_lru(&mut entries);
        }

        let watch = DirWatch::start(dir, prefix)?;
        entries.insert(key, Arc::clone(&watch));
        tracing::debug!(dir = %dir.display(), prefix, live = entries.len(), "watch cached");
        Ok(watch)
    }

    /// Evict the least recently used entry, sparing entries with parked
    /// waiters; a full cache of busy watches overshoots the cap rather
    /// than failing somebody mid-wait.
    fn evict_lru(entries: &mut HashMap<WatchKey, Arc<DirWatch>>) {
        let victim = entries
            .iter()
            .filter(|(_, watch)| !watch.has_waiters())
            .min_by_key(|(_, watch)| watch.last_used())
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            if let Some(watch) = entries.remove(&key) {
                tracing::debug!(dir = %key.0.display(), "watch evicted at capacity");
                watch.stop();
            }
        }
    }

    /// Stop every watch and the sweeper. Also runs on drop of the last
    /// clone.
    pub fn shutdown(&self) {
        {
            let mut down = self
                .inner
                .shutdown
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *down = true;
            self.inner.wake.notify_all();
        }
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if handle.join().is_err() {
                tracing::warn!("watch sweeper panicked");
            }
        }
        let mut entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, watch) in entries.drain() {
            watch.stop();
        }
    }

    #[cfg(test)]
    fn live_watches(&self) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        WatcherRegistry::new(RegistryConfig::default())
    }
}

impl Drop for WatcherRegistry {
    fn drop(&mut self) {
        if Arc::strong_count(&self.handle) == 1 {
            self.shutdown();
        }
    }
}

fn run_sweeper(inner: Arc<RegistryInner>) {
    let mut down = inner
        .shutdown
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    loop {
        if *down {
            return;
        }
        let (guard, _) = inner
            .wake
            .wait_timeout(down, inner.config.sweep_interval)
            .unwrap_or_else(PoisonError::into_inner);
        down = guard;
        if *down {
            return;
        }

        let cutoff = Instant::now() - inner.config.idle_ttl;
        let mut entries = inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<WatchKey> = entries
            .iter()
            .filter(|(_, watch)| watch.is_idle_since(cutoff))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(watch) = entries.remove(&key) {
                tracing::debug!(dir = %key.0.display(), "idle watch expired");
                watch.stop();
            }
        }
    }
}
