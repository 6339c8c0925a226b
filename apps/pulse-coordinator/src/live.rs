use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use service_sdk::{
    ChannelRole, GenerationRequest, MediaTransport, SpeechTranscriber, TextGenerator,
    TransportEvent,
};
use session_sync::{Direction, FilterOp, Query, SessionSyncClient, StoreError, Subscription};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::counter;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::generation::generate_once;
use crate::metrics;
use crate::model::{cutoff_millis, LiveSession, LIVE_SESSIONS};

/// Host lifecycle: `Idle -> Creating -> Live -> Ending -> Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostPhase {
    #[default]
    Idle,
    Creating,
    Live,
    Ending,
    Ended,
}

/// Progress of the workout plan requested when a broadcast ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationStatus {
    Idle,
    Generating,
    Ready(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndOutcome {
    pub session: LiveSession,
    pub generation_started: bool,
}

#[derive(Debug, Clone)]
pub struct LivePolicy {
    pub stale_after: Duration,
    pub generation_timeout: Option<Duration>,
}

impl LivePolicy {
    pub fn from_config(cfg: &CoordinatorConfig) -> Self {
        Self {
            stale_after: cfg.live_stale_after(),
            generation_timeout: cfg.generation_timeout(),
        }
    }
}

impl Default for LivePolicy {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

#[derive(Default)]
struct HostState {
    phase: HostPhase,
    session: Option<LiveSession>,
    transcript: String,
    tasks: Option<CancellationToken>,
    pump: Option<JoinHandle<()>>,
    remote_users: BTreeSet<String>,
    /// An `end` call is between teardown and the closing write.
    ending_in_flight: bool,
    /// Capture stopped and the channel left; only the closing write remains.
    torn_down: bool,
}

struct LiveInner {
    sync: SessionSyncClient,
    transport: Arc<dyn MediaTransport>,
    transcriber: Arc<dyn SpeechTranscriber>,
    generator: Arc<dyn TextGenerator>,
    policy: LivePolicy,
    state: Mutex<HostState>,
    generation: watch::Sender<GenerationStatus>,
}

impl LiveInner {
    async fn update_transcript(&self, text: &str) -> CoordinatorResult<()> {
        let session_id = {
            let state = self.state.lock();
            if state.phase != HostPhase::Live {
                return Err(CoordinatorError::InvalidState(
                    "transcript updates require a live broadcast".into(),
                ));
            }
            match state.session.as_ref() {
                Some(session) => session.id.clone(),
                None => return Err(CoordinatorError::InvalidState("no live session".into())),
            }
        };
        self.sync
            .mutate(LIVE_SESSIONS, &session_id, json!({ "workoutTranscript": text }))
            .await?;

        // Local state only mirrors writes that landed.
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(session) = state.session.as_mut().filter(|s| s.id == session_id) {
            session.workout_transcript = Some(text.to_string());
            state.transcript = text.to_string();
        }
        Ok(())
    }

    async fn generate_workout(self: Arc<Self>, session_id: String, transcript: String) {
        let request = GenerationRequest::workout_plan(transcript);
        let status = match generate_once(&self.generator, &request, self.policy.generation_timeout)
            .await
        {
            Ok(plan) if !plan.trim().is_empty() => {
                match self
                    .sync
                    .mutate(LIVE_SESSIONS, &session_id, json!({ "generatedWorkout": plan }))
                    .await
                {
                    Ok(_) => {
                        if let Some(session) = self.state.lock().session.as_mut() {
                            if session.id == session_id {
                                session.generated_workout = Some(plan.clone());
                            }
                        }
                        info!(target = "live", session_id = %session_id, "workout plan published");
                        GenerationStatus::Ready(plan)
                    }
                    Err(err) => {
                        warn!(target = "live", session_id = %session_id, error = %err, "failed to store workout plan");
                        GenerationStatus::Failed(err.to_string())
                    }
                }
            }
            Ok(_) => {
                warn!(target = "live", session_id = %session_id, "generator returned an empty plan");
                GenerationStatus::Failed("empty workout plan".into())
            }
            Err(err) => {
                warn!(target = "live", session_id = %session_id, error = %err, "workout plan generation failed");
                GenerationStatus::Failed(err.to_string())
            }
        };
        self.generation.send_replace(status);
    }
}

/// Host side of a live broadcast. Clones share one host state.
#[derive(Clone)]
pub struct LiveSessionCoordinator {
    inner: Arc<LiveInner>,
}

impl LiveSessionCoordinator {
    pub fn new(
        sync: SessionSyncClient,
        transport: Arc<dyn MediaTransport>,
        transcriber: Arc<dyn SpeechTranscriber>,
        generator: Arc<dyn TextGenerator>,
        policy: LivePolicy,
    ) -> Self {
        let (generation, _) = watch::channel(GenerationStatus::Idle);
        Self {
            inner: Arc::new(LiveInner {
                sync,
                transport,
                transcriber,
                generator,
                policy,
                state: Mutex::new(HostState::default()),
                generation,
            }),
        }
    }

    pub fn phase(&self) -> HostPhase {
        self.inner.state.lock().phase
    }

    pub fn session(&self) -> Option<LiveSession> {
        self.inner.state.lock().session.clone()
    }

    pub fn transcript(&self) -> String {
        self.inner.state.lock().transcript.clone()
    }

    pub fn remote_users(&self) -> Vec<String> {
        self.inner.state.lock().remote_users.iter().cloned().collect()
    }

    pub fn generation_status(&self) -> watch::Receiver<GenerationStatus> {
        self.inner.generation.subscribe()
    }

    /// Resolves once the pending workout generation settles. Returns
    /// immediately when nothing was requested.
    pub async fn wait_for_generation(&self) -> GenerationStatus {
        let mut rx = self.inner.generation.subscribe();
        let settled = rx
            .wait_for(|status| *status != GenerationStatus::Generating)
            .await
            .map(|status| status.clone());
        match settled {
            Ok(status) => status,
            Err(_) => self.inner.generation.borrow().clone(),
        }
    }

    /// Create the session record, then join the channel as broadcaster.
    pub async fn start(&self, host_id: &str, host_name: &str) -> CoordinatorResult<LiveSession> {
        {
            let mut state = self.inner.state.lock();
            if matches!(
                state.phase,
                HostPhase::Creating | HostPhase::Live | HostPhase::Ending
            ) {
                return Err(CoordinatorError::InvalidState(format!(
                    "host is already {:?}",
                    state.phase
                )));
            }
            *state = HostState {
                phase: HostPhase::Creating,
                ..HostState::default()
            };
        }
        self.inner.generation.send_replace(GenerationStatus::Idle);

        let mut session = LiveSession::new(host_id, host_name);
        let doc = match self.inner.sync.create(LIVE_SESSIONS, &session).await {
            Ok(doc) => doc,
            Err(err) => {
                self.inner.state.lock().phase = HostPhase::Idle;
                return Err(err.into());
            }
        };
        session.id = doc.id;

        let tasks = CancellationToken::new();
        spawn_event_monitor(
            Arc::downgrade(&self.inner),
            self.inner.transport.events(),
            tasks.clone(),
        );

        if let Err(err) = self
            .inner
            .transport
            .join_channel(&session.channel_id, ChannelRole::Broadcaster)
            .await
        {
            tasks.cancel();
            warn!(target = "live", session_id = %session.id, error = %err, "broadcast join failed; closing session");
            if let Err(close_err) = self
                .inner
                .sync
                .mutate(LIVE_SESSIONS, &session.id, json!({ "isActive": false }))
                .await
            {
                warn!(target = "live", session_id = %session.id, error = %close_err, "could not close session after failed join");
            }
            self.inner.state.lock().phase = HostPhase::Ended;
            return Err(err.into());
        }
        metrics::SESSIONS_STARTED.with_label_values(&["live"]).inc();

        {
            let mut state = self.inner.state.lock();
            state.phase = HostPhase::Live;
            state.session = Some(session.clone());
            state.tasks = Some(tasks.clone());
        }

        match self.inner.transcriber.start().await {
            Ok(partials) => {
                let pump = spawn_transcript_pump(Arc::downgrade(&self.inner), partials, tasks);
                self.inner.state.lock().pump = Some(pump);
            }
            Err(err) => {
                warn!(target = "live", session_id = %session.id, error = %err, "transcription unavailable; broadcasting without transcript");
            }
        }
        info!(target = "live", session_id = %session.id, host_id, "broadcast started");
        Ok(session)
    }

    /// Overwrite `workoutTranscript`. Last write wins.
    pub async fn update_transcript(&self, text: &str) -> CoordinatorResult<()> {
        self.inner.update_transcript(text).await
    }

    /// Stop capture, leave the channel and close the session. A non-empty
    /// transcript triggers one workout plan request in the background.
    ///
    /// If the closing write fails the host stays `Ending` and `end` may be
    /// called again; capture is not restarted and only the write is retried.
    pub async fn end(&self) -> CoordinatorResult<EndOutcome> {
        let (session, teardown) = {
            let mut state = self.inner.state.lock();
            let retry = state.phase == HostPhase::Ending && !state.ending_in_flight;
            if state.phase != HostPhase::Live && !retry {
                return Err(CoordinatorError::InvalidState(format!(
                    "cannot end a broadcast while {:?}",
                    state.phase
                )));
            }
            let Some(session) = state.session.clone() else {
                return Err(CoordinatorError::InvalidState("no live session".into()));
            };
            state.phase = HostPhase::Ending;
            state.ending_in_flight = true;
            let teardown = if state.torn_down {
                None
            } else {
                state.torn_down = true;
                Some((state.tasks.take(), state.pump.take()))
            };
            (session, teardown)
        };

        if let Some((tasks, pump)) = teardown {
            if let Some(tasks) = tasks {
                tasks.cancel();
            }
            // A transcript write already in flight finishes before the snapshot.
            if let Some(pump) = pump {
                if let Err(err) = pump.await {
                    warn!(target = "live", session_id = %session.id, error = %err, "transcript pump aborted");
                }
            }
            if let Err(err) = self.inner.transcriber.stop().await {
                warn!(target = "live", session_id = %session.id, error = %err, "failed to stop transcription");
            }
            if let Err(err) = self.inner.transport.leave_channel().await {
                warn!(target = "live", session_id = %session.id, error = %err, "failed to leave broadcast channel");
            }
        }

        let closed = match self
            .inner
            .sync
            .mutate(LIVE_SESSIONS, &session.id, json!({ "isActive": false }))
            .await
        {
            Ok(doc) => doc,
            Err(err) => {
                self.inner.state.lock().ending_in_flight = false;
                warn!(target = "live", session_id = %session.id, error = %err, "failed to close broadcast; end may be retried");
                return Err(err.into());
            }
        };
        let transcript = {
            let mut state = self.inner.state.lock();
            state.phase = HostPhase::Ended;
            state.ending_in_flight = false;
            state.remote_users.clear();
            state.transcript.clone()
        };
        let session: LiveSession = closed.decode()?;
        self.inner.state.lock().session = Some(session.clone());

        let transcript = transcript.trim().to_string();
        let generation_started = !transcript.is_empty();
        if generation_started {
            self.inner.generation.send_replace(GenerationStatus::Generating);
            tokio::spawn(
                Arc::clone(&self.inner).generate_workout(session.id.clone(), transcript),
            );
        }
        info!(target = "live", session_id = %session.id, generation_started, "broadcast ended");
        Ok(EndOutcome {
            session,
            generation_started,
        })
    }

    pub async fn switch_camera(&self) -> CoordinatorResult<()> {
        self.require_live()?;
        self.inner.transport.switch_camera().await?;
        Ok(())
    }

    pub async fn set_muted(&self, muted: bool) -> CoordinatorResult<()> {
        self.require_live()?;
        self.inner.transport.set_local_audio_muted(muted).await?;
        Ok(())
    }

    /// Active sessions, newest first. Runs the staleness sweep first.
    pub async fn list_active(&self) -> CoordinatorResult<Vec<LiveSession>> {
        if let Err(err) = self.cleanup_stale().await {
            warn!(target = "live", error = %err, "staleness sweep failed");
        }
        let query = Query::collection(LIVE_SESSIONS)
            .filter("isActive", FilterOp::Eq, true)
            .order_by("createdAt", Direction::Descending);
        Ok(self.inner.sync.query(&query).await?)
    }

    /// Force `isActive=false` on active sessions past the age limit. Returns
    /// how many were closed; individual write failures are logged and skipped.
    pub async fn cleanup_stale(&self) -> CoordinatorResult<usize> {
        let cutoff = cutoff_millis(Utc::now(), self.inner.policy.stale_after);
        let query = Query::collection(LIVE_SESSIONS)
            .filter("isActive", FilterOp::Eq, true)
            .filter("createdAt", FilterOp::Lt, cutoff);
        let now = Utc::now();
        let stale: Vec<LiveSession> = self.inner.sync.query(&query).await?;
        let mut repaired = 0usize;
        for session in stale
            .into_iter()
            .filter(|s| s.is_stale(now, self.inner.policy.stale_after))
        {
            match self
                .inner
                .sync
                .mutate(LIVE_SESSIONS, &session.id, json!({ "isActive": false }))
                .await
            {
                Ok(_) => {
                    repaired += 1;
                    info!(target = "live", session_id = %session.id, host_id = %session.host_id, "closed stale broadcast");
                }
                Err(err) => {
                    warn!(target = "live", session_id = %session.id, error = %err, "failed to close stale broadcast");
                }
            }
        }
        if repaired > 0 {
            metrics::STALE_SESSIONS_SWEPT
                .with_label_values(&["live"])
                .inc_by(repaired as u64);
        }
        Ok(repaired)
    }

    fn require_live(&self) -> CoordinatorResult<()> {
        match self.phase() {
            HostPhase::Live => Ok(()),
            phase => Err(CoordinatorError::InvalidState(format!(
                "broadcast is {phase:?}"
            ))),
        }
    }
}

fn spawn_event_monitor(
    inner: Weak<LiveInner>,
    mut events: broadcast::Receiver<TransportEvent>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(target = "live", skipped, "transport events lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(inner) = inner.upgrade() else { break };
            match event {
                TransportEvent::RemoteUserJoined(uid) => {
                    info!(target = "live", uid = %uid, "remote user joined");
                    inner.state.lock().remote_users.insert(uid);
                }
                TransportEvent::RemoteUserLeft(uid) => {
                    info!(target = "live", uid = %uid, "remote user left");
                    inner.state.lock().remote_users.remove(&uid);
                }
                TransportEvent::Error(code) => {
                    warn!(target = "live", code, "transport reported an error");
                }
                TransportEvent::ConnectionStateChanged(state) => {
                    debug!(target = "live", ?state, "transport connection state changed");
                }
            }
        }
    });
}

fn spawn_transcript_pump(
    inner: Weak<LiveInner>,
    mut partials: mpsc::Receiver<String>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                text = partials.recv() => match text {
                    Some(text) => text,
                    None => break,
                },
            };
            let Some(inner) = inner.upgrade() else { break };
            if let Err(err) = inner.update_transcript(&text).await {
                debug!(target = "live", error = %err, "dropping transcript update");
            }
        }
    })
}

/// What a viewer sees once the broadcast is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkoutOutcome {
    Ready(String),
    /// A transcript exists but the plan has not landed yet.
    Generating,
    NoWorkout,
}

impl WorkoutOutcome {
    pub fn of(session: &LiveSession) -> Self {
        match session.workout_plan() {
            Some(plan) => WorkoutOutcome::Ready(plan.to_string()),
            None if session.has_transcript() => WorkoutOutcome::Generating,
            None => WorkoutOutcome::NoWorkout,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    Updated(LiveSession),
    Ended(WorkoutOutcome),
}

/// Audience entry point.
#[derive(Clone)]
pub struct LiveAudience {
    sync: SessionSyncClient,
    transport: Arc<dyn MediaTransport>,
}

impl LiveAudience {
    pub fn new(sync: SessionSyncClient, transport: Arc<dyn MediaTransport>) -> Self {
        Self { sync, transport }
    }

    /// Subscribe to the session, join its channel as audience and count the
    /// viewer.
    pub async fn join(&self, session_id: &str) -> CoordinatorResult<LiveViewer> {
        let not_found = || CoordinatorError::NotFound {
            entity: "live session",
            id: session_id.to_string(),
        };
        let mut subscription = match self
            .sync
            .watch::<LiveSession>(LIVE_SESSIONS, session_id)
            .await
        {
            Ok(subscription) => subscription,
            Err(StoreError::NotFound { .. }) => return Err(not_found()),
            Err(err) => return Err(err.into()),
        };
        let Some(session) = subscription.next().await else {
            return Err(not_found());
        };
        if !session.is_active {
            return Err(CoordinatorError::Conflict {
                session_id: session_id.to_string(),
                expected: "active",
            });
        }

        self.transport
            .join_channel(&session.channel_id, ChannelRole::Audience)
            .await?;
        if let Err(err) = counter::adjust(
            &self.sync,
            LIVE_SESSIONS,
            "live session",
            session_id,
            "viewerCount",
            1,
        )
        .await
        {
            if let Err(leave_err) = self.transport.leave_channel().await {
                warn!(target = "live", session_id, error = %leave_err, "failed to leave after aborted join");
            }
            return Err(err);
        }
        info!(target = "live", session_id, uid = %self.transport.local_uid(), "viewer joined");

        Ok(LiveViewer {
            sync: self.sync.clone(),
            transport: Arc::clone(&self.transport),
            session,
            subscription,
            joined: true,
            counted: true,
            ended: false,
        })
    }
}

/// A joined viewer. Call [`LiveViewer::leave`] when the view goes away;
/// dropping it instead releases the membership from a background task.
pub struct LiveViewer {
    sync: SessionSyncClient,
    transport: Arc<dyn MediaTransport>,
    session: LiveSession,
    subscription: Subscription<LiveSession>,
    joined: bool,
    counted: bool,
    ended: bool,
}

impl LiveViewer {
    pub fn session(&self) -> &LiveSession {
        &self.session
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Next change to the session. After `Ended` has been yielded this
    /// returns `None`.
    pub async fn next_event(&mut self) -> CoordinatorResult<Option<ViewerEvent>> {
        if self.ended {
            return Ok(None);
        }
        match self.subscription.next().await {
            Some(session) if session.is_active => {
                self.session = session.clone();
                Ok(Some(ViewerEvent::Updated(session)))
            }
            Some(session) => {
                self.session = session;
                self.ended = true;
                self.release().await;
                Ok(Some(ViewerEvent::Ended(WorkoutOutcome::of(&self.session))))
            }
            None => {
                self.ended = true;
                self.release().await;
                Ok(None)
            }
        }
    }

    /// Keep listening after the broadcast ended until the plan appears or
    /// `timeout` elapses. Returns `Generating` on timeout.
    pub async fn await_workout(&mut self, timeout: Duration) -> WorkoutOutcome {
        let outcome = WorkoutOutcome::of(&self.session);
        if outcome != WorkoutOutcome::Generating {
            return outcome;
        }
        let waited = tokio::time::timeout(timeout, async {
            while let Some(session) = self.subscription.next().await {
                self.session = session;
                let outcome = WorkoutOutcome::of(&self.session);
                if outcome != WorkoutOutcome::Generating {
                    return outcome;
                }
            }
            WorkoutOutcome::of(&self.session)
        })
        .await;
        waited.unwrap_or(WorkoutOutcome::Generating)
    }

    pub async fn leave(mut self) {
        self.subscription.cancel();
        self.release().await;
    }

    async fn release(&mut self) {
        let joined = std::mem::take(&mut self.joined);
        let counted = std::mem::take(&mut self.counted);
        release_viewer(&self.sync, &self.transport, &self.session.id, joined, counted).await;
    }
}

impl Drop for LiveViewer {
    fn drop(&mut self) {
        self.subscription.cancel();
        let joined = std::mem::take(&mut self.joined);
        let counted = std::mem::take(&mut self.counted);
        if !joined && !counted {
            return;
        }
        let session_id = self.session.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let sync = self.sync.clone();
                let transport = Arc::clone(&self.transport);
                debug!(target = "live", session_id = %session_id, "viewer dropped without leaving");
                runtime.spawn(async move {
                    release_viewer(&sync, &transport, &session_id, joined, counted).await;
                });
            }
            Err(_) => {
                warn!(target = "live", session_id = %session_id, "viewer dropped outside a runtime; membership not released");
            }
        }
    }
}

async fn release_viewer(
    sync: &SessionSyncClient,
    transport: &Arc<dyn MediaTransport>,
    session_id: &str,
    joined: bool,
    counted: bool,
) {
    if joined {
        if let Err(err) = transport.leave_channel().await {
            warn!(target = "live", session_id, error = %err, "failed to leave audience channel");
        }
    }
    if counted {
        if let Err(err) = counter::adjust(
            sync,
            LIVE_SESSIONS,
            "live session",
            session_id,
            "viewerCount",
            -1,
        )
        .await
        {
            warn!(target = "live", session_id, error = %err, "failed to decrement viewer count");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workout_outcome_follows_session_fields() {
        let mut session = LiveSession::new("h", "Host");
        assert_eq!(WorkoutOutcome::of(&session), WorkoutOutcome::NoWorkout);
        session.workout_transcript = Some("   ".into());
        assert_eq!(WorkoutOutcome::of(&session), WorkoutOutcome::NoWorkout);
        session.workout_transcript = Some("ten burpees".into());
        assert_eq!(WorkoutOutcome::of(&session), WorkoutOutcome::Generating);
        session.generated_workout = Some("1. Ten burpees".into());
        assert_eq!(
            WorkoutOutcome::of(&session),
            WorkoutOutcome::Ready("1. Ten burpees".into())
        );
    }
}
