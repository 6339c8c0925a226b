use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancels a [`Subscription`] from outside its owner, e.g. when a view that
/// spawned the subscription is torn down. Cancelling twice is harmless.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    token: CancellationToken,
    key: Arc<str>,
}

impl SubscriptionHandle {
    pub(crate) fn new(key: String) -> Self {
        Self {
            token: CancellationToken::new(),
            key: key.into(),
        }
    }

    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(target = "sync", key = %self.key, "subscription cancelled");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Live updates of one entity. Yields the current value first, then every
/// committed change. Ends when cancelled, dropped, or the document is deleted.
pub struct Subscription<E> {
    rx: mpsc::Receiver<E>,
    handle: SubscriptionHandle,
}

impl<E> Subscription<E> {
    pub(crate) fn new(rx: mpsc::Receiver<E>, handle: SubscriptionHandle) -> Self {
        Self { rx, handle }
    }

    pub async fn next(&mut self) -> Option<E> {
        if self.handle.is_cancelled() {
            return None;
        }
        let token = self.handle.token();
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.handle.token.cancel();
    }
}
