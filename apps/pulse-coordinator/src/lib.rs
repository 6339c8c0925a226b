//! Session coordination for the workout-video client: live broadcasts,
//! partner sessions, transcript quizzes and video posts, wired over a shared
//! document store and a bounded media handle cache.

pub mod config;
pub mod content;
mod counter;
pub mod error;
mod generation;
pub mod listing;
pub mod live;
pub mod metrics;
pub mod model;
pub mod partner;
pub mod projection;
pub mod quiz;
pub mod telemetry;

use std::sync::Arc;

use media_cache::{MediaHandleCache, MediaPreparer};
use parking_lot::Mutex;
use service_sdk::{BlobStorage, MediaTransport, SessionRecorder, SpeechTranscriber, TextGenerator};
use session_sync::{DocumentStore, SessionSyncClient};
use tokio::sync::watch;
use tracing::{info, warn};

pub use config::CoordinatorConfig;
pub use content::ContentService;
pub use error::{CoordinatorError, CoordinatorResult};
pub use listing::{SessionListPoller, SessionListing};
pub use live::{
    EndOutcome, GenerationStatus, HostPhase, LiveAudience, LivePolicy, LiveSessionCoordinator,
    LiveViewer, ViewerEvent, WorkoutOutcome,
};
pub use model::{
    Comment, LiveSession, PartnerSession, PartnerStatus, RatingAggregate, VideoPost,
};
pub use partner::{PartnerPolicy, PartnerSessionCoordinator};
pub use projection::{LikeState, LikeToggle, Projection};
pub use quiz::{Quiz, QuizPolicy, QuizQuestion, QuizTriggerEngine};

/// External services one client talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    pub transport: Arc<dyn MediaTransport>,
    pub transcriber: Arc<dyn SpeechTranscriber>,
    pub generator: Arc<dyn TextGenerator>,
    pub blobs: Arc<dyn BlobStorage>,
    pub recorder: Arc<dyn SessionRecorder>,
    pub preparer: Arc<dyn MediaPreparer>,
}

/// Composition root: one instance per signed-in client.
pub struct PulseRuntime {
    config: CoordinatorConfig,
    sync: SessionSyncClient,
    media: Arc<MediaHandleCache>,
    live: LiveSessionCoordinator,
    audience: LiveAudience,
    partner: PartnerSessionCoordinator,
    quiz: QuizTriggerEngine,
    content: ContentService,
    poller: Mutex<Option<SessionListPoller>>,
}

impl PulseRuntime {
    pub fn new(config: CoordinatorConfig, services: Collaborators) -> Self {
        let sync = SessionSyncClient::new(services.store);
        let media = MediaHandleCache::new(services.preparer, config.media_cache());
        let live = LiveSessionCoordinator::new(
            sync.clone(),
            Arc::clone(&services.transport),
            services.transcriber,
            Arc::clone(&services.generator),
            LivePolicy::from_config(&config),
        );
        let audience = LiveAudience::new(sync.clone(), Arc::clone(&services.transport));
        let partner = PartnerSessionCoordinator::new(
            sync.clone(),
            services.transport,
            services.recorder,
            Arc::clone(&services.blobs),
            PartnerPolicy::from_config(&config),
        );
        let quiz = QuizTriggerEngine::new(services.generator, QuizPolicy::from_config(&config));
        let content = ContentService::new(sync.clone(), services.blobs);
        Self {
            config,
            sync,
            media,
            live,
            audience,
            partner,
            quiz,
            content,
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn sync(&self) -> &SessionSyncClient {
        &self.sync
    }

    pub fn media(&self) -> &Arc<MediaHandleCache> {
        &self.media
    }

    pub fn live(&self) -> &LiveSessionCoordinator {
        &self.live
    }

    pub fn audience(&self) -> &LiveAudience {
        &self.audience
    }

    pub fn partner(&self) -> &PartnerSessionCoordinator {
        &self.partner
    }

    pub fn quiz(&self) -> &QuizTriggerEngine {
        &self.quiz
    }

    pub fn content(&self) -> &ContentService {
        &self.content
    }

    /// Start the lobby poller, or return the running one's channel.
    pub fn start_list_polling(&self) -> watch::Receiver<SessionListing> {
        let mut poller = self.poller.lock();
        poller
            .get_or_insert_with(|| {
                SessionListPoller::spawn(
                    self.live.clone(),
                    self.partner.clone(),
                    self.config.list_poll_interval(),
                )
            })
            .subscribe()
    }

    /// Stop background work and release local resources. An open broadcast
    /// is ended so viewers are not left waiting.
    pub async fn shutdown(self) {
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            poller.stop().await;
        }
        self.quiz.set_active(false);
        if matches!(self.live.phase(), HostPhase::Live | HostPhase::Ending) {
            if let Err(err) = self.live.end().await {
                warn!(target = "runtime", error = %err, "failed to end broadcast during shutdown");
            }
        }
        self.partner.disconnect().await;
        self.media.clear();
        info!(target = "runtime", "runtime shut down");
    }
}
