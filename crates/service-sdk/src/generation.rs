use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::ServiceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    WorkoutPlan,
    Quiz,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub context: Vec<String>,
}

impl GenerationRequest {
    pub fn workout_plan(transcript: impl Into<String>) -> Self {
        Self {
            kind: GenerationKind::WorkoutPlan,
            context: vec![transcript.into()],
        }
    }

    pub fn quiz(transcripts: Vec<String>) -> Self {
        Self {
            kind: GenerationKind::Quiz,
            context: transcripts,
        }
    }

    /// Instruction text sent to the model.
    pub fn prompt(&self) -> String {
        let joined = self.context.join("\n---\n");
        match self.kind {
            GenerationKind::WorkoutPlan => format!(
                "Turn this live workout transcript into a structured workout plan \
                 with exercises, sets, reps and rest periods:\n{joined}"
            ),
            GenerationKind::Quiz => format!(
                "Write a short multiple-choice quiz as JSON \
                 {{\"questions\":[{{\"question\",\"options\",\"answerIndex\"}}]}} \
                 about the following workout commentary:\n{joined}"
            ),
        }
    }
}

/// Single-shot text generation. May fail; callers decide whether to retry.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> ServiceResult<String>;
}

/// Generator returning queued replies first, then a deterministic reply
/// derived from the request.
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<ServiceResult<String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call sleeps for `delay` before replying.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn push_reply(&self, reply: ServiceResult<String>) {
        self.replies.lock().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    fn derived_reply(request: &GenerationRequest) -> String {
        match request.kind {
            GenerationKind::WorkoutPlan => {
                let mut plan = String::from("Workout plan\n");
                for (n, line) in request
                    .context
                    .iter()
                    .flat_map(|c| c.split(&['.', '\n'][..]))
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .enumerate()
                {
                    plan.push_str(&format!("{}. {}\n", n + 1, line));
                }
                plan
            }
            GenerationKind::Quiz => {
                let questions: Vec<_> = request
                    .context
                    .iter()
                    .take(3)
                    .map(|c| {
                        let topic: String = c.split_whitespace().take(6).collect::<Vec<_>>().join(" ");
                        json!({
                            "question": format!("What was the focus of: \"{topic}\"?"),
                            "options": ["Strength", "Mobility", "Cardio", "Recovery"],
                            "answerIndex": 0,
                        })
                    })
                    .collect();
                json!({ "questions": questions }).to_string()
            }
        }
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> ServiceResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.replies.lock().pop_front();
        match queued {
            Some(reply) => reply,
            None => Ok(Self::derived_reply(request)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceError;

    #[tokio::test]
    async fn queued_replies_take_precedence() {
        let generator = ScriptedGenerator::new();
        generator.push_reply(Err(ServiceError::Timeout));
        let request = GenerationRequest::workout_plan("Ten squats. Rest thirty seconds.");
        assert_eq!(
            generator.generate(&request).await,
            Err(ServiceError::Timeout)
        );
        let plan = generator.generate(&request).await.unwrap();
        assert!(plan.contains("1. Ten squats"));
        assert!(plan.contains("2. Rest thirty seconds"));
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn derived_quiz_is_json() {
        let generator = ScriptedGenerator::new();
        let reply = generator
            .generate(&GenerationRequest::quiz(vec!["keep your core braced".into()]))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["questions"].as_array().unwrap().len(), 1);
    }
}
