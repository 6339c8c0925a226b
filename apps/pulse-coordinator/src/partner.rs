use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use service_sdk::{BlobStorage, ChannelRole, MediaTransport, SessionRecorder};
use session_sync::{
    Direction, Document, Fields, FilterOp, Query, SessionSyncClient, StoreError, Subscription,
};
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::metrics;
use crate::model::{
    cutoff_millis, PartnerSession, PartnerStatus, RatingAggregate, RatingRecord,
    PARTNER_SESSIONS, RATINGS, USERS,
};

const ENTITY: &str = "partner session";

#[derive(Debug, Clone)]
pub struct PartnerPolicy {
    pub waiting_stale_after: Duration,
    pub recording_prefix: String,
}

impl PartnerPolicy {
    pub fn from_config(cfg: &CoordinatorConfig) -> Self {
        Self {
            waiting_stale_after: cfg.partner_waiting_stale_after(),
            recording_prefix: cfg.recording_prefix().to_string(),
        }
    }
}

impl Default for PartnerPolicy {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

/// The session this client is currently connected to.
#[derive(Debug, Clone)]
struct ActiveCall {
    session_id: String,
    recording: bool,
}

struct PartnerInner {
    sync: SessionSyncClient,
    transport: Arc<dyn MediaTransport>,
    recorder: Arc<dyn SessionRecorder>,
    blobs: Arc<dyn BlobStorage>,
    policy: PartnerPolicy,
    active: Mutex<Option<ActiveCall>>,
}

/// Two-party sessions: `waiting -> inProgress -> ended`.
#[derive(Clone)]
pub struct PartnerSessionCoordinator {
    inner: Arc<PartnerInner>,
}

impl PartnerSessionCoordinator {
    pub fn new(
        sync: SessionSyncClient,
        transport: Arc<dyn MediaTransport>,
        recorder: Arc<dyn SessionRecorder>,
        blobs: Arc<dyn BlobStorage>,
        policy: PartnerPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(PartnerInner {
                sync,
                transport,
                recorder,
                blobs,
                policy,
                active: Mutex::new(None),
            }),
        }
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|call| call.session_id.clone())
    }

    /// Publish a waiting session and connect the host to its channel.
    pub async fn create(
        &self,
        host_id: &str,
        workout_type: &str,
        duration_minutes: u32,
    ) -> CoordinatorResult<PartnerSession> {
        self.ensure_idle()?;
        let mut session = PartnerSession::new(host_id, workout_type, duration_minutes);
        let doc = self.inner.sync.create(PARTNER_SESSIONS, &session).await?;
        session.id = doc.id;

        if let Err(err) = self
            .inner
            .transport
            .join_channel(&session.channel_id, ChannelRole::Broadcaster)
            .await
        {
            warn!(target = "partner", session_id = %session.id, error = %err, "host join failed; ending session");
            if let Err(close_err) = self.transition(&session.id, PartnerStatus::Ended).await {
                warn!(target = "partner", session_id = %session.id, error = %close_err, "could not end session after failed join");
            }
            return Err(err.into());
        }
        let recording = self.start_recording(&session.id).await;
        *self.inner.active.lock() = Some(ActiveCall {
            session_id: session.id.clone(),
            recording,
        });
        metrics::SESSIONS_STARTED.with_label_values(&["partner"]).inc();
        info!(target = "partner", session_id = %session.id, host_id, workout_type, "partner session created");
        Ok(session)
    }

    /// Claim the partner seat. Only a `waiting` session can be joined; a
    /// losing concurrent joiner gets [`CoordinatorError::Conflict`].
    pub async fn join(&self, session_id: &str, partner_id: &str) -> CoordinatorResult<PartnerSession> {
        self.ensure_idle()?;
        let doc = self
            .inner
            .sync
            .transact(PARTNER_SESSIONS, session_id, |current| {
                let (session, mut fields) = decode_current(current, session_id)?;
                if session.status != PartnerStatus::Waiting {
                    return Err(CoordinatorError::Conflict {
                        session_id: session_id.to_string(),
                        expected: PartnerStatus::Waiting.as_str(),
                    });
                }
                if session.host_id == partner_id {
                    return Err(CoordinatorError::InvalidState(
                        "host cannot join their own session".into(),
                    ));
                }
                fields.insert("partnerId".into(), Value::from(partner_id));
                fields.insert("status".into(), Value::from(PartnerStatus::InProgress.as_str()));
                Ok(fields)
            })
            .await?;
        let session: PartnerSession = doc.decode()?;

        if let Err(err) = self
            .inner
            .transport
            .join_channel(&session.channel_id, ChannelRole::Broadcaster)
            .await
        {
            warn!(target = "partner", session_id, error = %err, "partner join failed; ending session");
            if let Err(close_err) = self.transition(session_id, PartnerStatus::Ended).await {
                warn!(target = "partner", session_id, error = %close_err, "could not end session after failed join");
            }
            return Err(err.into());
        }
        let recording = self.start_recording(session_id).await;
        *self.inner.active.lock() = Some(ActiveCall {
            session_id: session_id.to_string(),
            recording,
        });
        info!(target = "partner", session_id, partner_id, "partner joined");
        Ok(session)
    }

    /// End the session for `user_id`. Ending twice is harmless. If this client
    /// is connected to the session it stops recording, uploads the capture
    /// and leaves the channel.
    pub async fn end(&self, session_id: &str, user_id: &str) -> CoordinatorResult<PartnerSession> {
        let Some(current) = self
            .inner
            .sync
            .get::<PartnerSession>(PARTNER_SESSIONS, session_id)
            .await?
        else {
            return Err(not_found(session_id));
        };
        if !current.is_participant(user_id) {
            return Err(CoordinatorError::NotParticipant {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        if current.status != PartnerStatus::Ended {
            self.transition(session_id, PartnerStatus::Ended).await?;
            info!(target = "partner", session_id, user_id, "partner session ended");
        } else {
            debug!(target = "partner", session_id, "session already ended");
        }

        let call = {
            let mut active = self.inner.active.lock();
            if active
                .as_ref()
                .is_some_and(|call| call.session_id == session_id)
            {
                active.take()
            } else {
                None
            }
        };
        if let Some(call) = call {
            let handoff = if call.recording {
                self.hand_off_recording(session_id, user_id).await
            } else {
                Ok(None)
            };
            if let Err(err) = self.inner.transport.leave_channel().await {
                warn!(target = "partner", session_id, error = %err, "failed to leave partner channel");
            }
            handoff?;
        }

        self.inner
            .sync
            .get::<PartnerSession>(PARTNER_SESSIONS, session_id)
            .await?
            .ok_or_else(|| not_found(session_id))
    }

    /// Rate the other participant of an ended session, once per rater.
    pub async fn submit_rating(
        &self,
        session_id: &str,
        rater_id: &str,
        rating: u8,
    ) -> CoordinatorResult<RatingAggregate> {
        if !(1..=5).contains(&rating) {
            return Err(CoordinatorError::InvalidRating(rating));
        }
        let Some(session) = self
            .inner
            .sync
            .get::<PartnerSession>(PARTNER_SESSIONS, session_id)
            .await?
        else {
            return Err(not_found(session_id));
        };
        if session.status != PartnerStatus::Ended {
            return Err(CoordinatorError::InvalidState(format!(
                "session {session_id} must end before it can be rated"
            )));
        }
        let Some(rated_id) = session.counterpart_of(rater_id).map(str::to_string) else {
            return Err(CoordinatorError::NotParticipant {
                session_id: session_id.to_string(),
                user_id: rater_id.to_string(),
            });
        };

        let key = RatingRecord::key(session_id, rater_id);
        let record = RatingRecord {
            session_id: session_id.to_string(),
            rater_id: rater_id.to_string(),
            rated_id: rated_id.clone(),
            rating,
            created_at: Utc::now(),
        };
        match self.inner.sync.create_with_id(RATINGS, &key, &record).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                return Err(CoordinatorError::AlreadyRated {
                    session_id: session_id.to_string(),
                    rater_id: rater_id.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        }

        let updated = self
            .inner
            .sync
            .increment(
                USERS,
                &rated_id,
                &[("totalRatings", 1), ("ratingSum", i64::from(rating))],
            )
            .await;
        let doc = match updated {
            Ok(doc) => doc,
            Err(err) => {
                // Let the rater retry.
                if let Err(undo_err) = self.inner.sync.delete(RATINGS, &key).await {
                    warn!(target = "partner", session_id, rater_id, error = %undo_err, "failed to roll back rating marker");
                }
                return Err(err.into());
            }
        };
        metrics::RATINGS_SUBMITTED.inc();
        info!(target = "partner", session_id, rater_id, rated_id = %rated_id, rating, "rating submitted");
        Ok(doc.decode()?)
    }

    pub async fn rating_for(&self, user_id: &str) -> CoordinatorResult<RatingAggregate> {
        Ok(self
            .inner
            .sync
            .get::<RatingAggregate>(USERS, user_id)
            .await?
            .unwrap_or_default())
    }

    /// Waiting sessions, newest first. Runs the staleness sweep first.
    pub async fn list_waiting(&self) -> CoordinatorResult<Vec<PartnerSession>> {
        if let Err(err) = self.cleanup_stale().await {
            warn!(target = "partner", error = %err, "staleness sweep failed");
        }
        let query = Query::collection(PARTNER_SESSIONS)
            .filter("status", FilterOp::Eq, PartnerStatus::Waiting.as_str())
            .order_by("createdAt", Direction::Descending);
        Ok(self.inner.sync.query(&query).await?)
    }

    /// End waiting sessions past the age limit. A session claimed while the
    /// sweep runs is left alone.
    pub async fn cleanup_stale(&self) -> CoordinatorResult<usize> {
        let now = Utc::now();
        let cutoff = cutoff_millis(now, self.inner.policy.waiting_stale_after);
        let query = Query::collection(PARTNER_SESSIONS)
            .filter("status", FilterOp::Eq, PartnerStatus::Waiting.as_str())
            .filter("createdAt", FilterOp::Lt, cutoff);
        let stale: Vec<PartnerSession> = self.inner.sync.query(&query).await?;
        let mut repaired = 0usize;
        for session in stale {
            match self.close_if_stale(&session.id, now).await {
                Ok(true) => {
                    repaired += 1;
                    info!(target = "partner", session_id = %session.id, host_id = %session.host_id, "ended stale waiting session");
                }
                Ok(false) => {
                    debug!(target = "partner", session_id = %session.id, "stale candidate was claimed meanwhile");
                }
                Err(err) => {
                    warn!(target = "partner", session_id = %session.id, error = %err, "failed to end stale session");
                }
            }
        }
        if repaired > 0 {
            metrics::STALE_SESSIONS_SWEPT
                .with_label_values(&["partner"])
                .inc_by(repaired as u64);
        }
        Ok(repaired)
    }

    /// Drop the local connection without touching the session record. Any
    /// capture in progress is discarded.
    pub async fn disconnect(&self) {
        let Some(call) = self.inner.active.lock().take() else {
            return;
        };
        if call.recording {
            if let Err(err) = self.inner.recorder.stop().await {
                warn!(target = "partner", session_id = %call.session_id, error = %err, "failed to stop recording");
            }
        }
        if let Err(err) = self.inner.transport.leave_channel().await {
            warn!(target = "partner", session_id = %call.session_id, error = %err, "failed to leave partner channel");
        }
        debug!(target = "partner", session_id = %call.session_id, "disconnected");
    }

    pub async fn watch(&self, session_id: &str) -> CoordinatorResult<Subscription<PartnerSession>> {
        match self.inner.sync.watch(PARTNER_SESSIONS, session_id).await {
            Ok(subscription) => Ok(subscription),
            Err(StoreError::NotFound { .. }) => Err(not_found(session_id)),
            Err(err) => Err(err.into()),
        }
    }

    fn ensure_idle(&self) -> CoordinatorResult<()> {
        match self.inner.active.lock().as_ref() {
            Some(call) => Err(CoordinatorError::InvalidState(format!(
                "already connected to session {}",
                call.session_id
            ))),
            None => Ok(()),
        }
    }

    async fn start_recording(&self, session_id: &str) -> bool {
        match self.inner.recorder.start(session_id).await {
            Ok(()) => true,
            Err(err) => {
                warn!(target = "partner", session_id, error = %err, "recording unavailable");
                false
            }
        }
    }

    async fn hand_off_recording(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> CoordinatorResult<Option<String>> {
        let Some(bytes) = self.inner.recorder.stop().await? else {
            debug!(target = "partner", session_id, "no recording captured");
            return Ok(None);
        };
        let path = format!(
            "{}/{session_id}/{user_id}.mp4",
            self.inner.policy.recording_prefix
        );
        let size = bytes.len();
        let url = self.inner.blobs.upload(bytes, &path).await?;
        let mut patch = Fields::new();
        patch.insert(format!("recordingUrls.{user_id}"), Value::from(url.as_str()));
        self.inner
            .sync
            .mutate(PARTNER_SESSIONS, session_id, Value::Object(patch))
            .await?;
        info!(target = "partner", session_id, user_id, size, url = %url, "recording uploaded");
        Ok(Some(url))
    }

    /// Move the session forward to `next`; rejects backwards moves.
    async fn transition(&self, session_id: &str, next: PartnerStatus) -> CoordinatorResult<Document> {
        self.inner
            .sync
            .transact(PARTNER_SESSIONS, session_id, |current| {
                let (session, mut fields) = decode_current(current, session_id)?;
                if session.status == next {
                    return Ok(fields);
                }
                if !session.status.can_transition_to(next) {
                    return Err(CoordinatorError::InvalidState(format!(
                        "cannot move session {session_id} from {} to {}",
                        session.status.as_str(),
                        next.as_str()
                    )));
                }
                fields.insert("status".into(), Value::from(next.as_str()));
                if next == PartnerStatus::Ended {
                    fields.insert("isActive".into(), Value::Bool(false));
                }
                Ok(fields)
            })
            .await
    }

    /// End the session only if it is still waiting and past the age limit
    /// when the transaction reads it.
    async fn close_if_stale(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let max_age = self.inner.policy.waiting_stale_after;
        let result = self
            .inner
            .sync
            .transact(PARTNER_SESSIONS, session_id, |current| {
                let (session, mut fields) = decode_current(current, session_id)?;
                if !session.is_stale(now, max_age) {
                    return Err(CoordinatorError::Conflict {
                        session_id: session_id.to_string(),
                        expected: PartnerStatus::Waiting.as_str(),
                    });
                }
                fields.insert("status".into(), Value::from(PartnerStatus::Ended.as_str()));
                fields.insert("isActive".into(), Value::Bool(false));
                Ok(fields)
            })
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(CoordinatorError::Conflict { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn not_found(session_id: &str) -> CoordinatorError {
    CoordinatorError::NotFound {
        entity: ENTITY,
        id: session_id.to_string(),
    }
}

fn decode_current(
    current: Option<&Document>,
    session_id: &str,
) -> CoordinatorResult<(PartnerSession, Fields)> {
    let doc = current.ok_or_else(|| not_found(session_id))?;
    Ok((doc.decode()?, doc.fields.clone()))
}
