use std::sync::Arc;

use bytes::Bytes;
use pulse_coordinator::model::{COMMENTS, LIKES, VIDEOS};
use pulse_coordinator::{ContentService, CoordinatorError, LikeState, LikeToggle, VideoPost};
use service_sdk::{BlobStorage, InMemoryBlobStorage};
use session_sync::{InMemoryDocumentStore, Query, SessionSyncClient};

fn service() -> (SessionSyncClient, Arc<InMemoryBlobStorage>, ContentService) {
    let sync = SessionSyncClient::new(InMemoryDocumentStore::new());
    let blobs = InMemoryBlobStorage::new();
    let content = ContentService::new(sync.clone(), blobs.clone());
    (sync, blobs, content)
}

async fn publish(content: &ContentService, owner: &str) -> VideoPost {
    content
        .publish(owner, Bytes::from_static(b"clip"), " morning flow ")
        .await
        .unwrap()
}

#[tokio::test]
async fn publish_uploads_and_lists_newest_first() {
    let (_, blobs, content) = service();
    let first = publish(&content, "ana").await;
    assert_eq!(first.caption, "morning flow");
    assert!(first.video_url.starts_with("mem://videos/ana/"));
    assert_eq!(
        blobs.download(&first.video_url).await.unwrap(),
        Bytes::from_static(b"clip")
    );

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = publish(&content, "ben").await;
    let feed = content.feed(10).await.unwrap();
    assert_eq!(
        feed.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
        vec![second.id.as_str(), first.id.as_str()]
    );
    assert_eq!(content.feed(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn likes_are_idempotent_per_user() {
    let (_, _, content) = service();
    let post = publish(&content, "ana").await;

    assert!(content.like(&post.id, "ben").await.unwrap());
    assert!(!content.like(&post.id, "ben").await.unwrap());
    assert!(content.like(&post.id, "cara").await.unwrap());
    assert_eq!(content.get(&post.id).await.unwrap().like_count, 2);
    assert!(content.is_liked(&post.id, "ben").await.unwrap());

    assert!(content.unlike(&post.id, "ben").await.unwrap());
    assert!(!content.unlike(&post.id, "ben").await.unwrap());
    assert_eq!(content.get(&post.id).await.unwrap().like_count, 1);
    assert!(!content.is_liked(&post.id, "ben").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_likes_are_all_counted() {
    let (sync, _, content) = service();
    let content = ContentService::new(sync.with_max_attempts(64), Arc::new(InMemoryBlobStorage::default()));
    let post = publish(&content, "ana").await;

    let mut tasks = Vec::new();
    for n in 0..16 {
        let content = content.clone();
        let id = post.id.clone();
        tasks.push(tokio::spawn(async move {
            content.like(&id, &format!("fan-{n}")).await.unwrap()
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap());
    }
    assert_eq!(content.get(&post.id).await.unwrap().like_count, 16);
}

#[tokio::test]
async fn liking_a_missing_video_leaves_no_marker() {
    let (sync, _, content) = service();
    assert!(matches!(
        content.like("missing", "ben").await,
        Err(CoordinatorError::NotFound { .. })
    ));
    let markers = sync.store().query(&Query::collection(LIKES)).await.unwrap();
    assert!(markers.is_empty());
}

#[tokio::test]
async fn comments_bump_the_counter() {
    let (_, _, content) = service();
    let post = publish(&content, "ana").await;

    content.add_comment(&post.id, "ben", "great pace").await.unwrap();
    content.add_comment(&post.id, "cara", " love it ").await.unwrap();
    assert!(matches!(
        content.add_comment(&post.id, "dan", "   ").await,
        Err(CoordinatorError::InvalidState(_))
    ));
    assert!(matches!(
        content.add_comment("missing", "dan", "hello").await,
        Err(CoordinatorError::NotFound { .. })
    ));

    let comments = content.comments(&post.id).await.unwrap();
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[1].text, "love it");
    assert_eq!(content.get(&post.id).await.unwrap().comment_count, 2);
}

#[tokio::test]
async fn only_the_owner_may_delete() {
    let (sync, blobs, content) = service();
    let post = publish(&content, "ana").await;
    content.like(&post.id, "ben").await.unwrap();
    content.add_comment(&post.id, "ben", "nice").await.unwrap();

    assert!(matches!(
        content.delete(&post.id, "ben").await,
        Err(CoordinatorError::Forbidden { .. })
    ));
    assert_eq!(blobs.len(), 1);
    assert!(content.get(&post.id).await.is_ok());

    content.delete(&post.id, "ana").await.unwrap();
    assert!(blobs.is_empty());
    for collection in [VIDEOS, LIKES, COMMENTS] {
        let left = sync
            .store()
            .query(&Query::collection(collection))
            .await
            .unwrap();
        assert!(left.is_empty(), "{collection} not cleaned up");
    }
}

#[tokio::test]
async fn like_toggle_confirms_or_rolls_back() {
    let (sync, _, content) = service();
    let post = publish(&content, "ana").await;
    let mut toggle = LikeToggle::load(content.clone(), &post.id, "ben")
        .await
        .unwrap();
    assert_eq!(toggle.state(), LikeState { liked: false, count: 0 });

    let liked = toggle.toggle().await.unwrap();
    assert_eq!(liked, LikeState { liked: true, count: 1 });
    assert!(!toggle.is_pending());

    toggle.observe_count(4);
    assert_eq!(toggle.state(), LikeState { liked: true, count: 4 });

    sync.delete(VIDEOS, &post.id).await.unwrap();
    assert!(toggle.toggle().await.is_err());
    assert_eq!(toggle.state(), LikeState { liked: true, count: 4 });
    assert!(!toggle.is_pending());
}
