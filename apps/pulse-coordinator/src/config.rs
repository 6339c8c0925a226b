use std::time::Duration;

use media_cache::{MediaCacheConfig, DEFAULT_MAX_ENTRIES};
use serde::Deserialize;

use crate::telemetry::LogFormat;

/// Runtime knobs, read from `PULSE_*` environment variables (a `.env` file is
/// honoured). Every field has a default so an empty environment is valid.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_live_stale_after_secs")]
    pub live_stale_after_secs: u64,
    #[serde(default = "default_partner_waiting_stale_secs")]
    pub partner_waiting_stale_secs: u64,
    #[serde(default = "default_media_cache_max_entries")]
    pub media_cache_max_entries: usize,
    #[serde(default = "default_quiz_min_transcript_chars")]
    pub quiz_min_transcript_chars: usize,
    #[serde(default = "default_quiz_trigger_threshold")]
    pub quiz_trigger_threshold: u32,
    #[serde(default = "default_quiz_min_transcripts")]
    pub quiz_min_transcripts: usize,
    #[serde(default = "default_quiz_recent_capacity")]
    pub quiz_recent_capacity: usize,
    #[serde(default = "default_quiz_max_retries")]
    pub quiz_max_retries: u32,
    #[serde(default = "default_quiz_retry_backoff_ms")]
    pub quiz_retry_backoff_ms: u64,
    #[serde(default = "default_list_poll_interval_ms")]
    pub list_poll_interval_ms: u64,
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: Option<u64>,
    #[serde(default = "default_workout_wait_timeout_ms")]
    pub workout_wait_timeout_ms: u64,
    #[serde(default)]
    pub recording_path_prefix: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            log_format: LogFormat::default(),
            live_stale_after_secs: default_live_stale_after_secs(),
            partner_waiting_stale_secs: default_partner_waiting_stale_secs(),
            media_cache_max_entries: default_media_cache_max_entries(),
            quiz_min_transcript_chars: default_quiz_min_transcript_chars(),
            quiz_trigger_threshold: default_quiz_trigger_threshold(),
            quiz_min_transcripts: default_quiz_min_transcripts(),
            quiz_recent_capacity: default_quiz_recent_capacity(),
            quiz_max_retries: default_quiz_max_retries(),
            quiz_retry_backoff_ms: default_quiz_retry_backoff_ms(),
            list_poll_interval_ms: default_list_poll_interval_ms(),
            generation_timeout_ms: default_generation_timeout_ms(),
            workout_wait_timeout_ms: default_workout_wait_timeout_ms(),
            recording_path_prefix: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("PULSE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map(CoordinatorConfig::normalize)
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "invalid PULSE_* configuration; using defaults");
                CoordinatorConfig::default().normalize()
            })
    }

    fn normalize(mut self) -> Self {
        self.recording_path_prefix = self.recording_path_prefix.take().and_then(|s| {
            let trimmed = s.trim().trim_matches('/');
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        });
        self.media_cache_max_entries = self.media_cache_max_entries.max(1);
        self.quiz_trigger_threshold = self.quiz_trigger_threshold.max(1);
        self.quiz_recent_capacity = self.quiz_recent_capacity.max(self.quiz_min_transcripts);
        self.generation_timeout_ms = self.generation_timeout_ms.filter(|ms| *ms > 0);
        self
    }

    pub fn live_stale_after(&self) -> Duration {
        Duration::from_secs(self.live_stale_after_secs)
    }

    pub fn partner_waiting_stale_after(&self) -> Duration {
        Duration::from_secs(self.partner_waiting_stale_secs)
    }

    pub fn list_poll_interval(&self) -> Duration {
        Duration::from_millis(self.list_poll_interval_ms.max(1))
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        self.generation_timeout_ms.map(Duration::from_millis)
    }

    pub fn workout_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.workout_wait_timeout_ms)
    }

    pub fn recording_prefix(&self) -> &str {
        self.recording_path_prefix.as_deref().unwrap_or("recordings")
    }

    pub fn media_cache(&self) -> MediaCacheConfig {
        MediaCacheConfig {
            max_entries: self.media_cache_max_entries,
        }
    }
}

fn default_log_filter() -> String {
    "info,pulse_coordinator=debug".to_string()
}

fn default_live_stale_after_secs() -> u64 {
    2 * 60 * 60
}

fn default_partner_waiting_stale_secs() -> u64 {
    30 * 60
}

fn default_media_cache_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_quiz_min_transcript_chars() -> usize {
    50
}

fn default_quiz_trigger_threshold() -> u32 {
    3
}

fn default_quiz_min_transcripts() -> usize {
    2
}

fn default_quiz_recent_capacity() -> usize {
    5
}

fn default_quiz_max_retries() -> u32 {
    2
}

fn default_quiz_retry_backoff_ms() -> u64 {
    1_000
}

fn default_list_poll_interval_ms() -> u64 {
    5_000
}

fn default_generation_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_workout_wait_timeout_ms() -> u64 {
    30_000
}
