use service_sdk::ServiceError;
use session_sync::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("session {session_id} is no longer {expected}")]
    Conflict {
        session_id: String,
        expected: &'static str,
    },
    #[error("{actor} may not modify {entity} {id}")]
    Forbidden {
        actor: String,
        entity: &'static str,
        id: String,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),
    #[error("{rater_id} already rated session {session_id}")]
    AlreadyRated { session_id: String, rater_id: String },
    #[error("{user_id} is not a participant of session {session_id}")]
    NotParticipant { session_id: String, user_id: String },
    #[error("generation timed out")]
    GenerationTimeout,
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
