use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::live::LiveSessionCoordinator;
use crate::model::{LiveSession, PartnerSession};
use crate::partner::PartnerSessionCoordinator;

/// Snapshot of the lobby lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionListing {
    pub live: Vec<LiveSession>,
    pub waiting: Vec<PartnerSession>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub refreshes: u64,
}

/// Re-queries active broadcasts and waiting partner sessions on a fixed
/// interval. Each refresh runs both staleness sweeps.
pub struct SessionListPoller {
    listing: watch::Receiver<SessionListing>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionListPoller {
    pub fn spawn(
        live: LiveSessionCoordinator,
        partner: PartnerSessionCoordinator,
        interval: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(SessionListing::default());
        let token = CancellationToken::new();
        let cancel = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut refreshes = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let previous = tx.borrow().clone();
                let live_sessions = match live.list_active().await {
                    Ok(sessions) => sessions,
                    Err(err) => {
                        warn!(target = "listing", error = %err, "live session refresh failed");
                        previous.live
                    }
                };
                let waiting = match partner.list_waiting().await {
                    Ok(sessions) => sessions,
                    Err(err) => {
                        warn!(target = "listing", error = %err, "partner session refresh failed");
                        previous.waiting
                    }
                };
                refreshes += 1;
                debug!(target = "listing", live = live_sessions.len(), waiting = waiting.len(), "session lists refreshed");
                tx.send_replace(SessionListing {
                    live: live_sessions,
                    waiting,
                    refreshed_at: Some(Utc::now()),
                    refreshes,
                });
            }
        });
        Self {
            listing: rx,
            token,
            task: Some(task),
        }
    }

    pub fn latest(&self) -> SessionListing {
        self.listing.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionListing> {
        self.listing.clone()
    }

    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionListPoller {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
