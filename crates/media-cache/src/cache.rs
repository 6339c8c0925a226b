use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::handle::{MediaHandle, ReadyState};
use crate::preparer::MediaPreparer;
use crate::stats::{CacheStats, CacheStatsSnapshot};

pub const DEFAULT_MAX_ENTRIES: usize = 5;

#[derive(Debug, Clone)]
pub struct MediaCacheConfig {
    pub max_entries: usize,
}

impl Default for MediaCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

struct Entry {
    handle: MediaHandle,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    tick: u64,
    audible: Option<String>,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Remove least-recently-used entries until at most `max_size` remain.
    fn evict_to(&mut self, max_size: usize) -> Vec<MediaHandle> {
        if self.entries.len() <= max_size {
            return Vec::new();
        }
        let mut by_age: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|(url, entry)| (entry.last_used, url.clone()))
            .collect();
        by_age.sort_unstable();
        let excess = self.entries.len() - max_size;
        let mut evicted = Vec::with_capacity(excess);
        for (_, url) in by_age.into_iter().take(excess) {
            if let Some(entry) = self.entries.remove(&url) {
                if self.audible.as_deref() == Some(url.as_str()) {
                    self.audible = None;
                }
                evicted.push(entry.handle);
            }
        }
        evicted
    }
}

/// Bounded, LRU-evicting pool of media handles.
///
/// Must be used from within a Tokio runtime: preparation runs on spawned tasks.
pub struct MediaHandleCache {
    preparer: Arc<dyn MediaPreparer>,
    config: MediaCacheConfig,
    state: Mutex<CacheState>,
    next_id: AtomicU64,
    stats: Arc<CacheStats>,
}

impl MediaHandleCache {
    pub fn new(preparer: Arc<dyn MediaPreparer>, config: MediaCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            preparer,
            config,
            state: Mutex::new(CacheState::default()),
            next_id: AtomicU64::new(1),
            stats: Arc::new(CacheStats::default()),
        })
    }

    /// Return the handle for `url`, registering and preparing it on first use.
    pub fn get_or_create(&self, url: &str) -> MediaHandle {
        self.lookup(url, true)
    }

    /// Start preparing `url` ahead of need. Never blocks and never bumps the
    /// recency of an already cached entry.
    pub fn preload(&self, url: &str) {
        let _ = self.lookup(url, false);
    }

    /// Make `url` the only audible handle: the previously audible handle is
    /// stopped first.
    pub fn play(&self, url: &str) -> MediaHandle {
        let handle = self.get_or_create(url);
        let previous = {
            let mut state = self.state.lock();
            let previous = state.audible.replace(url.to_string());
            previous
                .filter(|prev| prev != url)
                .and_then(|prev| state.entries.get(&prev).map(|e| e.handle.clone()))
        };
        if let Some(previous) = previous {
            debug!(target = "media.cache", from = %previous.source_url(), to = url, "switching audible handle");
            previous.stop();
        }
        handle.start();
        handle
    }

    /// Pause and rewind without evicting.
    pub fn stop(&self, url: &str) {
        let handle = {
            let mut state = self.state.lock();
            if state.audible.as_deref() == Some(url) {
                state.audible = None;
            }
            state.entries.get(url).map(|e| e.handle.clone())
        };
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    pub fn audible_url(&self) -> Option<String> {
        self.state.lock().audible.clone()
    }

    /// Evict least-recently-used entries until at most `max_size` remain.
    /// Returns the evicted URLs, oldest first.
    pub fn evict_lru(&self, max_size: usize) -> Vec<String> {
        let evicted = self.state.lock().evict_to(max_size);
        self.stats.record_evictions(evicted.len() as u64);
        self.release_all(&evicted);
        evicted
            .iter()
            .map(|h| h.source_url().to_string())
            .collect()
    }

    /// Drop `url` from the cache, releasing its handle.
    pub fn remove(&self, url: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            if state.audible.as_deref() == Some(url) {
                state.audible = None;
            }
            state.entries.remove(url)
        };
        match removed {
            Some(entry) => {
                self.release_all(std::slice::from_ref(&entry.handle));
                true
            }
            None => false,
        }
    }

    /// Release every handle. Used on shutdown.
    pub fn clear(&self) {
        let drained: Vec<MediaHandle> = {
            let mut state = self.state.lock();
            state.audible = None;
            state.entries.drain().map(|(_, e)| e.handle).collect()
        };
        self.release_all(&drained);
    }

    pub fn contains(&self, url: &str) -> bool {
        self.state.lock().entries.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_entries(&self) -> usize {
        self.config.max_entries
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    fn lookup(&self, url: &str, touch: bool) -> MediaHandle {
        let (handle, evicted) = {
            let mut state = self.state.lock();
            let tick = state.next_tick();
            if let Some(entry) = state.entries.get_mut(url) {
                if touch {
                    entry.last_used = tick;
                    self.stats.record_hit();
                }
                return entry.handle.clone();
            }
            self.stats.record_miss();
            let handle = MediaHandle::pending(self.next_id.fetch_add(1, Ordering::Relaxed), url);
            state.entries.insert(
                url.to_string(),
                Entry {
                    handle: handle.clone(),
                    last_used: tick,
                },
            );
            let evicted = state.evict_to(self.config.max_entries);
            (handle, evicted)
        };
        self.stats.record_evictions(evicted.len() as u64);
        self.release_all(&evicted);
        self.spawn_prepare(handle.clone());
        handle
    }

    fn spawn_prepare(&self, handle: MediaHandle) {
        let preparer = Arc::clone(&self.preparer);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let url = handle.source_url().to_string();
            let outcome = match preparer.prepare(&url).await {
                Ok(metadata) => {
                    debug!(target = "media.cache", url = %url, playable = metadata.playable, "handle prepared");
                    Some(metadata)
                }
                Err(err) => {
                    warn!(target = "media.cache", url = %url, error = %err, "preparation failed; using fallback handle");
                    stats.record_fallback();
                    None
                }
            };
            if !handle.settle(outcome) {
                // Evicted while preparing: nobody else will free these resources.
                preparer.release(&url);
            }
        });
    }

    fn release_all(&self, handles: &[MediaHandle]) {
        for handle in handles {
            let previous = handle.release();
            if matches!(previous, ReadyState::Ready | ReadyState::Fallback) {
                self.preparer.release(handle.source_url());
            }
            debug!(target = "media.cache", url = %handle.source_url(), "handle released");
        }
    }
}

impl Drop for MediaHandleCache {
    fn drop(&mut self) {
        self.clear();
    }
}
