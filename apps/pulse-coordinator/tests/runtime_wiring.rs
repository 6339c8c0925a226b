use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use media_cache::{MediaMetadata, MediaPreparer, Orientation, PrepareError, ReadyState};
use pulse_coordinator::model::{LIVE_SESSIONS, PARTNER_SESSIONS};
use pulse_coordinator::{
    Collaborators, CoordinatorConfig, HostPhase, LiveSession, PartnerSession, PulseRuntime,
    SessionListPoller,
};
use service_sdk::{
    InMemoryBlobStorage, InMemoryRecorder, LoopbackNetwork, ScriptedGenerator,
    ScriptedTranscriber,
};
use session_sync::InMemoryDocumentStore;

struct InstantPreparer;

#[async_trait]
impl MediaPreparer for InstantPreparer {
    async fn prepare(&self, url: &str) -> Result<MediaMetadata, PrepareError> {
        if url.contains("broken") {
            return Err(PrepareError::Network("unreachable".into()));
        }
        Ok(MediaMetadata {
            playable: true,
            duration: Some(Duration::from_secs(15)),
            orientation: Orientation::Portrait,
        })
    }
}

fn runtime(store: &Arc<InMemoryDocumentStore>, network: &Arc<LoopbackNetwork>, uid: &str) -> PulseRuntime {
    let services = Collaborators {
        store: store.clone(),
        transport: network.client(uid),
        transcriber: ScriptedTranscriber::new(),
        generator: ScriptedGenerator::new(),
        blobs: InMemoryBlobStorage::new(),
        recorder: InMemoryRecorder::new(),
        preparer: Arc::new(InstantPreparer),
    };
    PulseRuntime::new(CoordinatorConfig::default(), services)
}

#[tokio::test(start_paused = true)]
async fn poller_refreshes_lobby_and_sweeps() {
    let store = InMemoryDocumentStore::new();
    let network = LoopbackNetwork::new();
    let host = runtime(&store, &network, "host");
    let viewer = runtime(&store, &network, "viewer");

    let mut stale = LiveSession::new("ghost", "Ghost");
    stale.created_at = Utc::now() - chrono::Duration::hours(5);
    let stale_id = host.sync().create(LIVE_SESSIONS, &stale).await.unwrap().id;
    let mut waiting = PartnerSession::new("ghost", "yoga", 30);
    waiting.created_at = Utc::now() - chrono::Duration::hours(1);
    host.sync().create(PARTNER_SESSIONS, &waiting).await.unwrap();

    let live = host.live().start("host", "Coach").await.unwrap();
    let mut listing = viewer.start_list_polling();

    let first = listing
        .wait_for(|l| l.refreshes >= 1)
        .await
        .unwrap()
        .clone();
    assert_eq!(first.live.len(), 1);
    assert_eq!(first.live[0].id, live.id);
    assert!(first.waiting.is_empty());
    let swept: LiveSession = host.sync().get(LIVE_SESSIONS, &stale_id).await.unwrap().unwrap();
    assert!(!swept.is_active);

    let partner = host.partner().create("host", "hiit", 20).await;
    // The host is still broadcasting on the same transport.
    assert!(partner.is_err());

    host.live().end().await.unwrap();
    tokio::time::sleep(viewer.config().list_poll_interval()).await;
    let next = listing
        .wait_for(|l| l.refreshes >= 2)
        .await
        .unwrap()
        .clone();
    assert!(next.live.is_empty());
    assert!(next.refreshed_at >= first.refreshed_at);

    // Polling twice returns the same channel.
    let _again = viewer.start_list_polling();
    viewer.shutdown().await;
    host.shutdown().await;
}

#[tokio::test]
async fn stopped_poller_publishes_nothing_more() {
    let store = InMemoryDocumentStore::new();
    let network = LoopbackNetwork::new();
    let rt = runtime(&store, &network, "solo");
    let poller = SessionListPoller::spawn(
        rt.live().clone(),
        rt.partner().clone(),
        Duration::from_millis(10),
    );
    let mut rx = poller.subscribe();
    rx.wait_for(|l| l.refreshes >= 1).await.unwrap();
    poller.stop().await;
    rx.borrow_and_update();
    assert!(rx.changed().await.is_err());
}

#[tokio::test]
async fn shutdown_ends_an_open_broadcast_and_frees_media() {
    let store = InMemoryDocumentStore::new();
    let network = LoopbackNetwork::new();
    let rt = runtime(&store, &network, "host");
    let session = rt.live().start("host", "Coach").await.unwrap();

    let handle = rt.media().play("mem://videos/a.mp4");
    assert_eq!(handle.ready().await, ReadyState::Ready);
    let fallback = rt.media().get_or_create("mem://videos/broken.mp4");
    assert_eq!(fallback.ready().await, ReadyState::Fallback);
    assert!(fallback.is_playable());
    assert_eq!(rt.media().audible_url().as_deref(), Some("mem://videos/a.mp4"));

    let sync = rt.sync().clone();
    let live = rt.live().clone();
    let media = rt.media().clone();
    rt.shutdown().await;

    assert_eq!(live.phase(), HostPhase::Ended);
    let stored: LiveSession = sync.get(LIVE_SESSIONS, &session.id).await.unwrap().unwrap();
    assert!(!stored.is_active);
    assert!(media.is_empty());
    assert_eq!(handle.ready_state(), ReadyState::Released);
    assert!(network.members(&session.channel_id).is_empty());
}

#[tokio::test]
async fn configured_cache_bound_applies() {
    let store = InMemoryDocumentStore::new();
    let network = LoopbackNetwork::new();
    let rt = runtime(&store, &network, "scroller");
    for n in 0..8 {
        rt.media().preload(&format!("mem://videos/{n}.mp4"));
    }
    assert_eq!(rt.media().len(), rt.config().media_cache_max_entries);
    assert!(!rt.media().contains("mem://videos/0.mp4"));
    assert!(rt.media().contains("mem://videos/7.mp4"));
}
