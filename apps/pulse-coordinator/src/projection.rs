use tracing::debug;

use crate::content::ContentService;
use crate::error::CoordinatorResult;

/// A value with a remote-confirmed layer and an optional optimistic layer on
/// top. Readers see the optimistic value while a local change is pending.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection<T> {
    confirmed: T,
    optimistic: Option<T>,
}

impl<T: Clone> Projection<T> {
    pub fn new(confirmed: T) -> Self {
        Self {
            confirmed,
            optimistic: None,
        }
    }

    /// Show `value` immediately, ahead of confirmation.
    pub fn apply_local(&mut self, value: T) {
        self.optimistic = Some(value);
    }

    /// Record the authoritative value and drop any pending local change.
    pub fn confirm(&mut self, value: T) {
        self.confirmed = value;
        self.optimistic = None;
    }

    /// Record a remote value without discarding a pending local change.
    pub fn observe(&mut self, value: T) {
        self.confirmed = value;
    }

    pub fn rollback(&mut self) {
        self.optimistic = None;
    }

    pub fn current(&self) -> &T {
        self.optimistic.as_ref().unwrap_or(&self.confirmed)
    }

    pub fn confirmed(&self) -> &T {
        &self.confirmed
    }

    pub fn is_pending(&self) -> bool {
        self.optimistic.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeState {
    pub liked: bool,
    pub count: i64,
}

impl LikeState {
    fn toggled(self) -> Self {
        if self.liked {
            LikeState {
                liked: false,
                count: (self.count - 1).max(0),
            }
        } else {
            LikeState {
                liked: true,
                count: self.count + 1,
            }
        }
    }
}

/// Like button state for one user and one video.
pub struct LikeToggle {
    content: ContentService,
    video_id: String,
    user_id: String,
    state: Projection<LikeState>,
}

impl LikeToggle {
    pub async fn load(
        content: ContentService,
        video_id: &str,
        user_id: &str,
    ) -> CoordinatorResult<Self> {
        let state = Self::fetch(&content, video_id, user_id).await?;
        Ok(Self {
            content,
            video_id: video_id.to_string(),
            user_id: user_id.to_string(),
            state: Projection::new(state),
        })
    }

    pub fn state(&self) -> LikeState {
        *self.state.current()
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    /// Flip the like locally, then apply it remotely. On failure the local
    /// change is rolled back and the error returned.
    pub async fn toggle(&mut self) -> CoordinatorResult<LikeState> {
        let next = self.state.current().toggled();
        self.state.apply_local(next);
        let applied = if next.liked {
            self.content.like(&self.video_id, &self.user_id).await
        } else {
            self.content.unlike(&self.video_id, &self.user_id).await
        };
        if let Err(err) = applied {
            debug!(target = "content", video_id = %self.video_id, error = %err, "like toggle rolled back");
            self.state.rollback();
            return Err(err);
        }
        let confirmed = Self::fetch(&self.content, &self.video_id, &self.user_id).await?;
        self.state.confirm(confirmed);
        Ok(confirmed)
    }

    /// Fold in a like count pushed by a subscription.
    pub fn observe_count(&mut self, count: i64) {
        let liked = self.state.confirmed().liked;
        self.state.observe(LikeState { liked, count });
    }

    async fn fetch(
        content: &ContentService,
        video_id: &str,
        user_id: &str,
    ) -> CoordinatorResult<LikeState> {
        let post = content.get(video_id).await?;
        let liked = content.is_liked(video_id, user_id).await?;
        Ok(LikeState {
            liked,
            count: post.like_count,
        })
    }
}
