//! Interfaces to the services the coordinators depend on but do not own:
//! media transport, blob storage, speech transcription, text generation and
//! local recording. Each interface ships with an in-memory implementation
//! for tests and local wiring.

pub mod blob;
pub mod generation;
pub mod recorder;
pub mod speech;
pub mod transport;

pub use blob::{BlobStorage, InMemoryBlobStorage};
pub use generation::{GenerationKind, GenerationRequest, ScriptedGenerator, TextGenerator};
pub use recorder::{InMemoryRecorder, SessionRecorder};
pub use speech::{ScriptedTranscriber, SpeechTranscriber};
pub use transport::{
    ChannelRole, ConnectionState, LoopbackNetwork, LoopbackTransport, MediaTransport,
    TransportEvent,
};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("already joined channel {0}")]
    AlreadyJoined(String),
    #[error("not joined to any channel")]
    NotJoined,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
