use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::preparer::{MediaMetadata, Orientation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Registered, preparation still running.
    Pending,
    Ready,
    /// Preparation failed; playback is attempted anyway.
    Fallback,
    /// Evicted or removed from the cache.
    Released,
}

#[derive(Debug, Default)]
struct Playback {
    playing: bool,
    position: Duration,
}

struct HandleInner {
    id: u64,
    url: String,
    state: watch::Sender<ReadyState>,
    metadata: Mutex<Option<MediaMetadata>>,
    playback: Mutex<Playback>,
}

/// Shared reference to one prepared media resource. Clones refer to the same
/// slot; equality is by slot identity.
#[derive(Clone)]
pub struct MediaHandle {
    inner: Arc<HandleInner>,
}

impl MediaHandle {
    pub(crate) fn pending(id: u64, url: &str) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                url: url.to_string(),
                state: watch::Sender::new(ReadyState::Pending),
                metadata: Mutex::new(None),
                playback: Mutex::new(Playback::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn source_url(&self) -> &str {
        &self.inner.url
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.inner.state.borrow()
    }

    /// Wait until preparation settles and return the resulting state.
    pub async fn ready(&self) -> ReadyState {
        let mut rx = self.inner.state.subscribe();
        let settled = rx
            .wait_for(|state| *state != ReadyState::Pending)
            .await
            .map(|state| *state);
        settled.unwrap_or_else(|_| self.ready_state())
    }

    pub fn is_playable(&self) -> bool {
        match self.ready_state() {
            ReadyState::Ready => self
                .inner
                .metadata
                .lock()
                .as_ref()
                .map(|m| m.playable)
                .unwrap_or(false),
            ReadyState::Fallback => true,
            ReadyState::Pending | ReadyState::Released => false,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.inner.metadata.lock().as_ref().and_then(|m| m.duration)
    }

    pub fn orientation(&self) -> Orientation {
        self.inner
            .metadata
            .lock()
            .as_ref()
            .map(|m| m.orientation)
            .unwrap_or(Orientation::Unknown)
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playback.lock().playing
    }

    pub fn position(&self) -> Duration {
        self.inner.playback.lock().position
    }

    /// Move the playhead, clamped to the known duration.
    pub fn seek(&self, position: Duration) {
        let limit = self.duration();
        let mut playback = self.inner.playback.lock();
        playback.position = match limit {
            Some(duration) => position.min(duration),
            None => position,
        };
    }

    /// Settle a pending handle. Returns `false` if the handle was released
    /// before preparation finished.
    pub(crate) fn settle(&self, outcome: Option<MediaMetadata>) -> bool {
        let next = if outcome.is_some() {
            ReadyState::Ready
        } else {
            ReadyState::Fallback
        };
        let metadata = outcome;
        self.inner.state.send_if_modified(|state| {
            if *state != ReadyState::Pending {
                return false;
            }
            *self.inner.metadata.lock() = metadata;
            *state = next;
            true
        })
    }

    /// Mark released; returns the state the handle was in.
    pub(crate) fn release(&self) -> ReadyState {
        self.stop();
        self.inner.state.send_replace(ReadyState::Released)
    }

    pub(crate) fn start(&self) {
        self.inner.playback.lock().playing = true;
    }

    /// Pause and rewind to the start.
    pub(crate) fn stop(&self) {
        let mut playback = self.inner.playback.lock();
        playback.playing = false;
        playback.position = Duration::ZERO;
    }
}

impl PartialEq for MediaHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaHandle {}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("state", &self.ready_state())
            .finish()
    }
}
