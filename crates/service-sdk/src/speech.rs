use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{ServiceError, ServiceResult};

const PARTIALS_BUFFER: usize = 32;

/// Streaming speech recognition. Each message on the returned channel is the
/// full partial transcript recognised so far.
#[async_trait]
pub trait SpeechTranscriber: Send + Sync {
    async fn start(&self) -> ServiceResult<mpsc::Receiver<String>>;

    async fn stop(&self) -> ServiceResult<()>;
}

/// Transcriber driven by the test or simulation via [`ScriptedTranscriber::speak`].
#[derive(Default)]
pub struct ScriptedTranscriber {
    sender: Mutex<Option<mpsc::Sender<String>>>,
    heard: Mutex<String>,
}

impl ScriptedTranscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Append recognised words and emit the accumulated partial transcript.
    pub async fn speak(&self, words: &str) -> ServiceResult<()> {
        let (sender, partial) = {
            let sender = self.sender.lock().clone().ok_or(ServiceError::NotJoined)?;
            let mut heard = self.heard.lock();
            if !heard.is_empty() {
                heard.push(' ');
            }
            heard.push_str(words.trim());
            (sender, heard.clone())
        };
        sender
            .send(partial)
            .await
            .map_err(|_| ServiceError::Rejected("transcript consumer dropped".into()))
    }
}

#[async_trait]
impl SpeechTranscriber for ScriptedTranscriber {
    async fn start(&self) -> ServiceResult<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(PARTIALS_BUFFER);
        let mut sender = self.sender.lock();
        if sender.is_some() {
            return Err(ServiceError::Rejected("transcription already running".into()));
        }
        *sender = Some(tx);
        self.heard.lock().clear();
        Ok(rx)
    }

    async fn stop(&self) -> ServiceResult<()> {
        self.sender.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partials_accumulate_until_stopped() {
        let transcriber = ScriptedTranscriber::new();
        let mut partials = transcriber.start().await.unwrap();
        transcriber.speak("ten squats").await.unwrap();
        transcriber.speak("then a plank").await.unwrap();
        assert_eq!(partials.recv().await.unwrap(), "ten squats");
        assert_eq!(partials.recv().await.unwrap(), "ten squats then a plank");
        transcriber.stop().await.unwrap();
        assert!(partials.recv().await.is_none());
        assert!(transcriber.speak("ignored").await.is_err());
    }
}
