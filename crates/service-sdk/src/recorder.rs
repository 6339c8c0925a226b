use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::{ServiceError, ServiceResult};

/// Local capture of a session. `stop` hands back the recorded asset, if any.
#[async_trait]
pub trait SessionRecorder: Send + Sync {
    async fn start(&self, session_id: &str) -> ServiceResult<()>;

    async fn stop(&self) -> ServiceResult<Option<Bytes>>;
}

#[derive(Default)]
struct Recording {
    session_id: String,
    buffer: BytesMut,
}

/// Recorder that accumulates frames pushed with [`InMemoryRecorder::capture`].
#[derive(Default)]
pub struct InMemoryRecorder {
    active: Mutex<Option<Recording>>,
}

impl InMemoryRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_recording(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|r| r.session_id.clone())
    }

    pub fn capture(&self, frame: &[u8]) -> bool {
        match self.active.lock().as_mut() {
            Some(recording) => {
                recording.buffer.extend_from_slice(frame);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SessionRecorder for InMemoryRecorder {
    async fn start(&self, session_id: &str) -> ServiceResult<()> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            return Err(ServiceError::Rejected(format!(
                "already recording session {}",
                current.session_id
            )));
        }
        *active = Some(Recording {
            session_id: session_id.to_string(),
            buffer: BytesMut::new(),
        });
        Ok(())
    }

    async fn stop(&self) -> ServiceResult<Option<Bytes>> {
        let finished = self.active.lock().take();
        Ok(finished
            .map(|r| r.buffer.freeze())
            .filter(|bytes| !bytes.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_recordings_yield_nothing() {
        let recorder = InMemoryRecorder::new();
        recorder.start("s1").await.unwrap();
        assert!(recorder.start("s2").await.is_err());
        assert_eq!(recorder.stop().await.unwrap(), None);

        recorder.start("s3").await.unwrap();
        assert!(recorder.capture(b"frame-1"));
        assert_eq!(
            recorder.stop().await.unwrap(),
            Some(Bytes::from_static(b"frame-1"))
        );
        assert!(!recorder.capture(b"late"));
    }
}
