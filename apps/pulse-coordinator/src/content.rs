use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use service_sdk::{BlobStorage, ServiceError};
use session_sync::{Direction, FilterOp, Query, SessionSyncClient, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::counter;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::model::{Comment, LikeMarker, VideoPost, COMMENTS, LIKES, VIDEOS};

const ENTITY: &str = "video";

/// Video posts with their like and comment counters. Ownership is checked
/// client-side before any mutation.
#[derive(Clone)]
pub struct ContentService {
    sync: SessionSyncClient,
    blobs: Arc<dyn BlobStorage>,
}

impl ContentService {
    pub fn new(sync: SessionSyncClient, blobs: Arc<dyn BlobStorage>) -> Self {
        Self { sync, blobs }
    }

    pub async fn publish(
        &self,
        owner_id: &str,
        video: Bytes,
        caption: &str,
    ) -> CoordinatorResult<VideoPost> {
        let path = format!("videos/{owner_id}/{}.mp4", Uuid::new_v4());
        let video_url = self.blobs.upload(video, &path).await?;
        let mut post = VideoPost {
            id: String::new(),
            owner_id: owner_id.to_string(),
            video_url,
            caption: caption.trim().to_string(),
            like_count: 0,
            comment_count: 0,
            created_at: Utc::now(),
        };
        match self.sync.create(VIDEOS, &post).await {
            Ok(doc) => post.id = doc.id,
            Err(err) => {
                if let Err(cleanup_err) = self.blobs.delete(&post.video_url).await {
                    warn!(target = "content", url = %post.video_url, error = %cleanup_err, "orphaned upload");
                }
                return Err(err.into());
            }
        }
        info!(target = "content", video_id = %post.id, owner_id, "video published");
        Ok(post)
    }

    pub async fn get(&self, video_id: &str) -> CoordinatorResult<VideoPost> {
        self.sync
            .get::<VideoPost>(VIDEOS, video_id)
            .await?
            .ok_or_else(|| not_found(video_id))
    }

    /// Newest first.
    pub async fn feed(&self, limit: usize) -> CoordinatorResult<Vec<VideoPost>> {
        let query = Query::collection(VIDEOS)
            .order_by("createdAt", Direction::Descending)
            .limit(limit);
        Ok(self.sync.query(&query).await?)
    }

    pub async fn is_liked(&self, video_id: &str, user_id: &str) -> CoordinatorResult<bool> {
        let marker = self
            .sync
            .store()
            .get(LIKES, &LikeMarker::key(video_id, user_id))
            .await?;
        Ok(marker.is_some())
    }

    /// Returns `false` if the user already liked the video.
    pub async fn like(&self, video_id: &str, user_id: &str) -> CoordinatorResult<bool> {
        let key = LikeMarker::key(video_id, user_id);
        let marker = LikeMarker {
            video_id: video_id.to_string(),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
        };
        match self.sync.create_with_id(LIKES, &key, &marker).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        if let Err(err) =
            counter::adjust(&self.sync, VIDEOS, ENTITY, video_id, "likeCount", 1).await
        {
            self.discard_marker(&key).await;
            return Err(err);
        }
        debug!(target = "content", video_id, user_id, "video liked");
        Ok(true)
    }

    /// Returns `false` if there was no like to remove.
    pub async fn unlike(&self, video_id: &str, user_id: &str) -> CoordinatorResult<bool> {
        let key = LikeMarker::key(video_id, user_id);
        let Some(existing) = self.sync.get::<LikeMarker>(LIKES, &key).await? else {
            return Ok(false);
        };
        match self.sync.delete(LIKES, &key).await {
            Ok(()) => {}
            Err(StoreError::NotFound { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        if let Err(err) =
            counter::adjust(&self.sync, VIDEOS, ENTITY, video_id, "likeCount", -1).await
        {
            if let Err(restore_err) = self.sync.create_with_id(LIKES, &key, &existing).await {
                warn!(target = "content", key = %key, error = %restore_err, "failed to restore like marker");
            }
            return Err(err);
        }
        debug!(target = "content", video_id, user_id, "video unliked");
        Ok(true)
    }

    pub async fn add_comment(
        &self,
        video_id: &str,
        author_id: &str,
        text: &str,
    ) -> CoordinatorResult<Comment> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CoordinatorError::InvalidState("comment is empty".into()));
        }
        self.get(video_id).await?;
        let mut comment = Comment {
            id: String::new(),
            video_id: video_id.to_string(),
            author_id: author_id.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        };
        comment.id = self.sync.create(COMMENTS, &comment).await?.id;
        if let Err(err) =
            counter::adjust(&self.sync, VIDEOS, ENTITY, video_id, "commentCount", 1).await
        {
            self.discard_comment(&comment.id).await;
            return Err(err);
        }
        Ok(comment)
    }

    /// Oldest first.
    pub async fn comments(&self, video_id: &str) -> CoordinatorResult<Vec<Comment>> {
        let query = Query::collection(COMMENTS)
            .filter("videoId", FilterOp::Eq, video_id)
            .order_by("createdAt", Direction::Ascending);
        Ok(self.sync.query(&query).await?)
    }

    /// Delete a post and everything hanging off it. Only the owner may delete;
    /// the check runs before anything is touched.
    pub async fn delete(&self, video_id: &str, requester_id: &str) -> CoordinatorResult<()> {
        let post = self.get(video_id).await?;
        if post.owner_id != requester_id {
            warn!(target = "content", video_id, requester_id, "refusing to delete someone else's video");
            return Err(CoordinatorError::Forbidden {
                actor: requester_id.to_string(),
                entity: ENTITY,
                id: video_id.to_string(),
            });
        }

        match self.blobs.delete(&post.video_url).await {
            Ok(()) | Err(ServiceError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        for collection in [LIKES, COMMENTS] {
            let query = Query::collection(collection).filter("videoId", FilterOp::Eq, video_id);
            for doc in self.sync.store().query(&query).await? {
                if let Err(err) = self.sync.delete(collection, &doc.id).await {
                    warn!(target = "content", collection, id = %doc.id, error = %err, "failed to delete dependent document");
                }
            }
        }
        self.sync.delete(VIDEOS, video_id).await?;
        info!(target = "content", video_id, requester_id, "video deleted");
        Ok(())
    }

    async fn discard_marker(&self, key: &str) {
        if let Err(err) = self.sync.delete(LIKES, key).await {
            warn!(target = "content", key, error = %err, "failed to roll back like marker");
        }
    }

    async fn discard_comment(&self, comment_id: &str) {
        if let Err(err) = self.sync.delete(COMMENTS, comment_id).await {
            warn!(target = "content", comment_id, error = %err, "failed to roll back comment");
        }
    }
}

fn not_found(video_id: &str) -> CoordinatorError {
    CoordinatorError::NotFound {
        entity: ENTITY,
        id: video_id.to_string(),
    }
}
