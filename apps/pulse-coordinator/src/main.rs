use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use media_cache::{MediaMetadata, MediaPreparer, Orientation, PrepareError};
use pulse_coordinator::telemetry::init_tracing;
use pulse_coordinator::{
    metrics, Collaborators, CoordinatorConfig, PulseRuntime, ViewerEvent,
};
use service_sdk::{
    InMemoryBlobStorage, InMemoryRecorder, LoopbackNetwork, ScriptedGenerator,
    ScriptedTranscriber,
};
use session_sync::{DocumentStore, InMemoryDocumentStore};
use tracing::{info, warn};

/// Pretends every asset is a 30 second portrait clip, except URLs ending in
/// `.broken`.
struct SimulatedPreparer;

#[async_trait]
impl MediaPreparer for SimulatedPreparer {
    async fn prepare(&self, url: &str) -> Result<MediaMetadata, PrepareError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if url.ends_with(".broken") {
            return Err(PrepareError::Malformed(format!("no playable track in {url}")));
        }
        Ok(MediaMetadata {
            playable: true,
            duration: Some(Duration::from_secs(30)),
            orientation: Orientation::from_dimensions(1080, 1920),
        })
    }
}

struct Device {
    runtime: PulseRuntime,
    transcriber: Arc<ScriptedTranscriber>,
    recorder: Arc<InMemoryRecorder>,
}

fn device(
    uid: &str,
    cfg: &CoordinatorConfig,
    store: &Arc<InMemoryDocumentStore>,
    network: &Arc<LoopbackNetwork>,
    blobs: &Arc<InMemoryBlobStorage>,
) -> Device {
    let transcriber = ScriptedTranscriber::new();
    let recorder = InMemoryRecorder::new();
    let store: Arc<dyn DocumentStore> = store.clone();
    let services = Collaborators {
        store,
        transport: network.client(uid),
        transcriber: transcriber.clone(),
        generator: ScriptedGenerator::with_delay(Duration::from_millis(50)),
        blobs: blobs.clone(),
        recorder: recorder.clone(),
        preparer: Arc::new(SimulatedPreparer),
    };
    Device {
        runtime: PulseRuntime::new(cfg.clone(), services),
        transcriber,
        recorder,
    }
}

async fn live_broadcast(host: &Device, viewer: &Device) -> anyhow::Result<()> {
    let session = host.runtime.live().start("coach-1", "Coach Ana").await?;
    let mut watching = viewer.runtime.audience().join(&session.id).await?;

    host.transcriber
        .speak("Warm up with twenty jumping jacks.")
        .await?;
    host.transcriber
        .speak("Then three rounds of ten squats and a thirty second plank.")
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ended = host.runtime.live().end().await?;
    info!(session_id = %ended.session.id, generation = ended.generation_started, "host ended broadcast");

    while let Some(event) = watching.next_event().await? {
        if let ViewerEvent::Ended(outcome) = event {
            info!(?outcome, "viewer saw the broadcast end");
            break;
        }
    }
    let wait = viewer.runtime.config().workout_wait_timeout();
    let outcome = watching.await_workout(wait).await;
    info!(?outcome, "viewer workout outcome");
    watching.leave().await;
    Ok(())
}

async fn partner_workout(host: &Device, guest: &Device) -> anyhow::Result<()> {
    let session = host.runtime.partner().create("coach-1", "hiit", 20).await?;
    guest.runtime.partner().join(&session.id, "member-7").await?;

    host.recorder.capture(b"host-frames");
    guest.recorder.capture(b"guest-frames");

    let ended = guest.runtime.partner().end(&session.id, "member-7").await?;
    host.runtime.partner().end(&session.id, "coach-1").await?;
    info!(session_id = %ended.id, status = ended.status.as_str(), "partner session ended");

    let aggregate = guest
        .runtime
        .partner()
        .submit_rating(&session.id, "member-7", 5)
        .await?;
    info!(average = ?aggregate.average(), "coach rating updated");
    Ok(())
}

async fn quiz_round(viewer: &Device) -> anyhow::Result<()> {
    let quiz = viewer.runtime.quiz();
    quiz.set_active(true);
    let mut published = quiz.subscribe();
    for line in [
        "Keep your core braced and your back flat during every plank hold.",
        "Drive through your heels on each squat and keep your knees out.",
        "Breathe out on the effort and in on the way back down for each rep.",
    ] {
        quiz.add_transcript(line);
    }
    let arrived = tokio::time::timeout(Duration::from_secs(5), async {
        published.wait_for(|quiz| quiz.is_some()).await.is_ok()
    })
    .await
    .context("quiz did not arrive in time")?;
    if arrived {
        info!(questions = ?quiz.current_quiz().map(|q| q.questions.len()), "quiz published");
    }
    quiz.set_active(false);
    Ok(())
}

async fn scroll_feed(viewer: &Device) -> anyhow::Result<()> {
    let content = viewer.runtime.content();
    for n in 0..3 {
        content
            .publish("member-7", Bytes::from(vec![n as u8; 16]), &format!("clip {n}"))
            .await?;
    }
    let media = viewer.runtime.media();
    let feed = content.feed(10).await?;
    for post in &feed {
        media.preload(&post.video_url);
    }
    for post in &feed {
        let handle = media.play(&post.video_url);
        handle.ready().await;
    }
    media.preload("mem://videos/legacy/clip.broken");
    info!(cached = media.len(), stats = ?media.stats(), "feed scrolled");
    Ok(())
}

async fn run(cfg: CoordinatorConfig) -> anyhow::Result<()> {
    let store = InMemoryDocumentStore::new();
    let network = LoopbackNetwork::new();
    let blobs = InMemoryBlobStorage::new();
    let host = device("coach-1", &cfg, &store, &network, &blobs);
    let viewer = device("member-7", &cfg, &store, &network, &blobs);

    let mut listing = viewer.runtime.start_list_polling();
    live_broadcast(&host, &viewer).await?;
    partner_workout(&host, &viewer).await?;
    quiz_round(&viewer).await?;
    scroll_feed(&viewer).await?;

    if listing.has_changed().unwrap_or(false) {
        let latest = listing.borrow_and_update().clone();
        info!(live = latest.live.len(), waiting = latest.waiting.len(), "lobby snapshot");
    }

    host.runtime.shutdown().await;
    viewer.runtime.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = CoordinatorConfig::from_env();
    init_tracing(&cfg.log_filter, cfg.log_format);

    tokio::select! {
        result = run(cfg) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
            return Ok(());
        }
    }

    println!("{}", metrics::export_prometheus());
    Ok(())
}
