use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use media_cache::{
    MediaCacheConfig, MediaHandleCache, MediaMetadata, MediaPreparer, Orientation, PrepareError,
    ReadyState,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct CountingPreparer {
    prepares: Mutex<HashMap<String, usize>>,
    releases: Mutex<HashMap<String, usize>>,
    failing: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

impl CountingPreparer {
    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    fn prepares(&self, url: &str) -> usize {
        self.prepares.lock().get(url).copied().unwrap_or(0)
    }

    fn releases(&self, url: &str) -> usize {
        self.releases.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MediaPreparer for CountingPreparer {
    async fn prepare(&self, url: &str) -> Result<MediaMetadata, PrepareError> {
        *self.prepares.lock().entry(url.to_string()).or_default() += 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.failing.lock().iter().any(|u| u == url) {
            return Err(PrepareError::Network("connection reset".into()));
        }
        Ok(MediaMetadata {
            playable: true,
            duration: Some(Duration::from_secs(30)),
            orientation: Orientation::Portrait,
        })
    }

    fn release(&self, url: &str) {
        *self.releases.lock().entry(url.to_string()).or_default() += 1;
    }
}

fn url(n: usize) -> String {
    format!("https://cdn.example/videos/{n}.mp4")
}

#[tokio::test]
async fn second_request_returns_same_handle() {
    let preparer = Arc::new(CountingPreparer::default());
    let cache = MediaHandleCache::new(preparer.clone(), MediaCacheConfig::default());

    let first = cache.get_or_create(&url(1));
    let second = cache.get_or_create(&url(1));
    assert_eq!(first, second);
    assert_eq!(first.ready().await, ReadyState::Ready);
    assert_eq!(preparer.prepares(&url(1)), 1);
    assert!(second.is_playable());
    assert_eq!(second.duration(), Some(Duration::from_secs(30)));
    assert_eq!(second.orientation(), Orientation::Portrait);
}

#[tokio::test]
async fn concurrent_callers_share_in_flight_preparation() {
    let gate = Arc::new(Notify::new());
    let preparer = Arc::new(CountingPreparer::gated(gate.clone()));
    let cache = MediaHandleCache::new(preparer.clone(), MediaCacheConfig::default());

    let a = cache.get_or_create(&url(7));
    let b = cache.get_or_create(&url(7));
    assert_eq!(a.ready_state(), ReadyState::Pending);
    let waiter = tokio::spawn({
        let b = b.clone();
        async move { b.ready().await }
    });
    tokio::task::yield_now().await;
    gate.notify_one();
    assert_eq!(waiter.await.unwrap(), ReadyState::Ready);
    assert_eq!(a.ready_state(), ReadyState::Ready);
    assert_eq!(preparer.prepares(&url(7)), 1);
}

#[tokio::test]
async fn eviction_removes_least_recently_used() {
    let preparer = Arc::new(CountingPreparer::default());
    let cache = MediaHandleCache::new(preparer.clone(), MediaCacheConfig { max_entries: 10 });

    for n in 0..6 {
        cache.get_or_create(&url(n)).ready().await;
    }
    // Touch 0 and 1 so 2 and 3 become the oldest.
    cache.get_or_create(&url(0));
    cache.get_or_create(&url(1));

    let evicted = cache.evict_lru(4);
    assert_eq!(evicted, vec![url(2), url(3)]);
    assert_eq!(cache.len(), 4);
    assert_eq!(preparer.releases(&url(2)), 1);
    assert_eq!(preparer.releases(&url(3)), 1);
    assert!(cache.contains(&url(0)));
    assert!(cache.evict_lru(4).is_empty());
}

#[tokio::test]
async fn only_one_url_is_audible() {
    let preparer = Arc::new(CountingPreparer::default());
    let cache = MediaHandleCache::new(preparer, MediaCacheConfig::default());

    let a = cache.play(&url(1));
    a.seek(Duration::from_secs(12));
    assert_eq!(a.position(), Duration::from_secs(12));
    assert_eq!(cache.audible_url(), Some(url(1)));

    let b = cache.play(&url(2));
    assert_eq!(cache.audible_url(), Some(url(2)));
    assert!(!a.is_playing());
    assert_eq!(a.position(), Duration::ZERO);
    assert!(b.is_playing());

    cache.stop(&url(2));
    assert_eq!(cache.audible_url(), None);
    assert!(!b.is_playing());
    assert!(cache.contains(&url(2)));
}

#[tokio::test]
async fn seeking_is_clamped_once_duration_is_known() {
    let gate = Arc::new(Notify::new());
    let preparer = Arc::new(CountingPreparer::gated(gate.clone()));
    let cache = MediaHandleCache::new(preparer, MediaCacheConfig::default());

    let handle = cache.get_or_create(&url(4));
    handle.seek(Duration::from_secs(90));
    assert_eq!(handle.position(), Duration::from_secs(90));

    gate.notify_one();
    assert_eq!(handle.ready().await, ReadyState::Ready);
    handle.seek(Duration::from_secs(12));
    assert_eq!(handle.position(), Duration::from_secs(12));
    handle.seek(Duration::from_secs(90));
    assert_eq!(handle.position(), Duration::from_secs(30));
}

#[tokio::test]
async fn failed_preparation_degrades_to_fallback() {
    let preparer = Arc::new(CountingPreparer::default());
    preparer.failing.lock().push(url(3));
    let cache = MediaHandleCache::new(preparer, MediaCacheConfig::default());

    let handle = cache.get_or_create(&url(3));
    assert_eq!(handle.ready().await, ReadyState::Fallback);
    assert!(handle.is_playable());
    assert_eq!(cache.stats().fallbacks, 1);
}

#[tokio::test]
async fn preloaded_url_is_evicted_under_pressure() {
    let preparer = Arc::new(CountingPreparer::default());
    let cache = MediaHandleCache::new(preparer.clone(), MediaCacheConfig { max_entries: 5 });

    let preloaded = "https://cdn.example/videos/preloaded.mp4";
    cache.preload(preloaded);
    assert!(cache.contains(preloaded));

    for n in 0..6 {
        cache.get_or_create(&url(n)).ready().await;
    }
    assert_eq!(cache.len(), 5);
    assert!(!cache.contains(preloaded));
    assert!(cache.stats().evictions >= 1);
}

#[tokio::test]
async fn preload_does_not_refresh_recency() {
    let preparer = Arc::new(CountingPreparer::default());
    let cache = MediaHandleCache::new(preparer, MediaCacheConfig { max_entries: 10 });

    cache.get_or_create(&url(0));
    cache.get_or_create(&url(1));
    cache.preload(&url(0));
    assert_eq!(cache.evict_lru(1), vec![url(0)]);
}

#[tokio::test]
async fn handle_released_mid_preparation_frees_resources_once() {
    let gate = Arc::new(Notify::new());
    let preparer = Arc::new(CountingPreparer::gated(gate.clone()));
    let cache = MediaHandleCache::new(preparer.clone(), MediaCacheConfig::default());

    let handle = cache.get_or_create(&url(9));
    assert!(cache.remove(&url(9)));
    assert_eq!(handle.ready_state(), ReadyState::Released);
    gate.notify_one();

    for _ in 0..50 {
        if preparer.releases(&url(9)) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(preparer.releases(&url(9)), 1);
    assert_eq!(handle.ready_state(), ReadyState::Released);
}

#[tokio::test]
async fn clear_releases_every_prepared_handle() {
    let preparer = Arc::new(CountingPreparer::default());
    let cache = MediaHandleCache::new(preparer.clone(), MediaCacheConfig::default());
    for n in 0..3 {
        cache.get_or_create(&url(n)).ready().await;
    }
    cache.clear();
    assert!(cache.is_empty());
    let released: usize = (0..3).map(|n| preparer.releases(&url(n))).sum();
    assert_eq!(released, 3);
}
