use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use service_sdk::{GenerationRequest, TextGenerator};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::generation::generate_once;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub answer_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    pub questions: Vec<QuizQuestion>,
}

impl Quiz {
    /// Parse a generator reply. Text around the outermost JSON object (code
    /// fences, preambles) is ignored.
    pub fn parse(reply: &str) -> CoordinatorResult<Quiz> {
        let body = match (reply.find('{'), reply.rfind('}')) {
            (Some(start), Some(end)) if start < end => &reply[start..=end],
            _ => reply,
        };
        let quiz: Quiz = serde_json::from_str(body)?;
        if quiz.questions.is_empty() {
            return Err(CoordinatorError::InvalidState("quiz has no questions".into()));
        }
        if let Some(bad) = quiz
            .questions
            .iter()
            .find(|q| q.options.is_empty() || q.answer_index >= q.options.len())
        {
            return Err(CoordinatorError::InvalidState(format!(
                "question {:?} has no valid answer",
                bad.question
            )));
        }
        Ok(quiz)
    }
}

#[derive(Debug, Clone)]
pub struct QuizPolicy {
    pub min_transcript_chars: usize,
    pub trigger_threshold: u32,
    pub min_transcripts: usize,
    pub recent_capacity: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub generation_timeout: Option<Duration>,
}

impl QuizPolicy {
    pub fn from_config(cfg: &CoordinatorConfig) -> Self {
        Self {
            min_transcript_chars: cfg.quiz_min_transcript_chars,
            trigger_threshold: cfg.quiz_trigger_threshold,
            min_transcripts: cfg.quiz_min_transcripts,
            recent_capacity: cfg.quiz_recent_capacity,
            max_retries: cfg.quiz_max_retries,
            retry_backoff: Duration::from_millis(cfg.quiz_retry_backoff_ms),
            generation_timeout: cfg.generation_timeout(),
        }
    }
}

impl Default for QuizPolicy {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

#[derive(Default)]
struct Accumulator {
    active: bool,
    recent: VecDeque<String>,
    observed: u32,
    in_flight: bool,
    epoch: u64,
}

impl Accumulator {
    fn reset(&mut self) {
        self.recent.clear();
        self.observed = 0;
        self.in_flight = false;
        self.epoch += 1;
    }
}

struct QuizInner {
    generator: Arc<dyn TextGenerator>,
    policy: QuizPolicy,
    state: Mutex<Accumulator>,
    published: watch::Sender<Option<Quiz>>,
}

/// Collects transcript fragments while a workout view is on screen and asks
/// for a quiz once enough material has accumulated.
#[derive(Clone)]
pub struct QuizTriggerEngine {
    inner: Arc<QuizInner>,
}

impl QuizTriggerEngine {
    pub fn new(generator: Arc<dyn TextGenerator>, policy: QuizPolicy) -> Self {
        let (published, _) = watch::channel(None);
        Self {
            inner: Arc::new(QuizInner {
                generator,
                policy,
                state: Mutex::new(Accumulator::default()),
                published,
            }),
        }
    }

    /// Gate processing. Either transition starts from a clean state and
    /// discards any generation still running.
    pub fn set_active(&self, active: bool) {
        let mut state = self.inner.state.lock();
        if state.active == active {
            return;
        }
        state.reset();
        state.active = active;
        drop(state);
        if !active {
            self.inner.published.send_replace(None);
        }
        debug!(target = "quiz", active, "quiz engine toggled");
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    pub fn is_generating(&self) -> bool {
        self.inner.state.lock().in_flight
    }

    /// Observations counted since the last successful quiz.
    pub fn pending_observations(&self) -> u32 {
        self.inner.state.lock().observed
    }

    /// Newest first.
    pub fn recent_transcripts(&self) -> Vec<String> {
        self.inner.state.lock().recent.iter().cloned().collect()
    }

    pub fn current_quiz(&self) -> Option<Quiz> {
        self.inner.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Quiz>> {
        self.inner.published.subscribe()
    }

    /// Record a transcript fragment. Returns whether it was accepted.
    pub fn add_transcript(&self, text: &str) -> bool {
        let text = text.trim();
        let policy = &self.inner.policy;
        let job = {
            let mut state = self.inner.state.lock();
            if !state.active || text.chars().count() < policy.min_transcript_chars {
                return false;
            }
            state.recent.push_front(text.to_string());
            state.recent.truncate(policy.recent_capacity);
            state.observed += 1;

            let ready = state.observed >= policy.trigger_threshold
                && state.recent.len() >= policy.min_transcripts;
            if ready && !state.in_flight {
                state.in_flight = true;
                Some((state.recent.iter().cloned().collect::<Vec<_>>(), state.epoch))
            } else {
                if ready {
                    debug!(target = "quiz", "generation already in flight; not triggering");
                }
                None
            }
        };
        if let Some((transcripts, epoch)) = job {
            info!(target = "quiz", transcripts = transcripts.len(), "requesting quiz");
            tokio::spawn(Arc::clone(&self.inner).run(transcripts, epoch));
        }
        true
    }
}

impl QuizInner {
    fn is_current(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        state.active && state.epoch == epoch
    }

    async fn run(self: Arc<Self>, transcripts: Vec<String>, epoch: u64) {
        let request = GenerationRequest::quiz(transcripts);
        let attempts = self.policy.max_retries + 1;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.retry_backoff).await;
            }
            if !self.is_current(epoch) {
                debug!(target = "quiz", "quiz request abandoned after deactivation");
                return;
            }
            let result = generate_once(&self.generator, &request, self.policy.generation_timeout)
                .await
                .and_then(|reply| Quiz::parse(&reply));
            match result {
                Ok(quiz) => {
                    let mut state = self.state.lock();
                    if !state.active || state.epoch != epoch {
                        return;
                    }
                    state.observed = 0;
                    state.in_flight = false;
                    drop(state);
                    info!(target = "quiz", questions = quiz.questions.len(), attempt, "quiz ready");
                    self.published.send_replace(Some(quiz));
                    return;
                }
                Err(err) => {
                    warn!(target = "quiz", attempt, attempts, error = %err, "quiz generation failed");
                }
            }
        }
        let mut state = self.state.lock();
        if state.epoch == epoch {
            // One more transcript re-triggers.
            state.observed = self.policy.trigger_threshold.saturating_sub(1);
            state.in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_fenced_json() {
        let reply = "```json\n{\"questions\":[{\"question\":\"Q\",\"options\":[\"a\",\"b\"],\"answerIndex\":1}]}\n```";
        let quiz = Quiz::parse(reply).unwrap();
        assert_eq!(quiz.questions[0].answer_index, 1);
    }

    #[test]
    fn parse_rejects_out_of_range_answers() {
        let reply = r#"{"questions":[{"question":"Q","options":["a"],"answerIndex":3}]}"#;
        assert!(matches!(
            Quiz::parse(reply),
            Err(CoordinatorError::InvalidState(_))
        ));
        assert!(matches!(
            Quiz::parse("not json"),
            Err(CoordinatorError::Serde(_))
        ));
        assert!(Quiz::parse(r#"{"questions":[]}"#).is_err());
    }
}
