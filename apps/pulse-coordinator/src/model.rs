use std::collections::HashMap;
use std::time::Duration;

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const LIVE_SESSIONS: &str = "liveSessions";
pub const PARTNER_SESSIONS: &str = "partnerSessions";
pub const USERS: &str = "users";
pub const RATINGS: &str = "ratings";
pub const VIDEOS: &str = "videos";
pub const LIKES: &str = "likes";
pub const COMMENTS: &str = "comments";

const CHANNEL_TOKEN_BYTES: usize = 16;

/// Opaque transport channel identifier. Never interpreted locally.
pub fn new_channel_token() -> String {
    let mut bytes = [0u8; CHANNEL_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `true` if `created_at` lies further than `max_age` before `now`.
pub(crate) fn older_than(created_at: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    match chrono::Duration::from_std(max_age) {
        Ok(max_age) => now - created_at > max_age,
        Err(_) => false,
    }
}

/// Millisecond cutoff for range queries on `createdAt`.
pub(crate) fn cutoff_millis(now: DateTime<Utc>, max_age: Duration) -> i64 {
    let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_sub(max_age_ms)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSession {
    #[serde(default)]
    pub id: String,
    pub host_id: String,
    pub host_name: String,
    pub channel_id: String,
    pub is_active: bool,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub viewer_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workout_transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_workout: Option<String>,
}

impl LiveSession {
    pub fn new(host_id: &str, host_name: &str) -> Self {
        Self {
            id: String::new(),
            host_id: host_id.to_string(),
            host_name: host_name.to_string(),
            channel_id: new_channel_token(),
            is_active: true,
            created_at: Utc::now(),
            viewer_count: 0,
            workout_transcript: None,
            generated_workout: None,
        }
    }

    pub fn has_transcript(&self) -> bool {
        self.workout_transcript
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    pub fn workout_plan(&self) -> Option<&str> {
        self.generated_workout
            .as_deref()
            .filter(|plan| !plan.trim().is_empty())
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.is_active && older_than(self.created_at, now, max_age)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartnerStatus {
    Waiting,
    InProgress,
    Ended,
}

impl PartnerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PartnerStatus::Waiting => "waiting",
            PartnerStatus::InProgress => "inProgress",
            PartnerStatus::Ended => "ended",
        }
    }

    /// Status only moves forward. Waiting may end directly when the host
    /// cancels or the session goes stale.
    pub fn can_transition_to(self, next: PartnerStatus) -> bool {
        matches!(
            (self, next),
            (PartnerStatus::Waiting, PartnerStatus::InProgress)
                | (PartnerStatus::Waiting, PartnerStatus::Ended)
                | (PartnerStatus::InProgress, PartnerStatus::Ended)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerSession {
    #[serde(default)]
    pub id: String,
    pub host_id: String,
    #[serde(default)]
    pub partner_id: Option<String>,
    pub channel_id: String,
    pub is_active: bool,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub status: PartnerStatus,
    pub workout_type: String,
    pub duration_minutes: u32,
    #[serde(default)]
    pub recording_urls: HashMap<String, String>,
}

impl PartnerSession {
    pub fn new(host_id: &str, workout_type: &str, duration_minutes: u32) -> Self {
        Self {
            id: String::new(),
            host_id: host_id.to_string(),
            partner_id: None,
            channel_id: new_channel_token(),
            is_active: true,
            created_at: Utc::now(),
            status: PartnerStatus::Waiting,
            workout_type: workout_type.to_string(),
            duration_minutes,
            recording_urls: HashMap::new(),
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.host_id == user_id || self.partner_id.as_deref() == Some(user_id)
    }

    /// The participant facing `user_id`, if both seats are taken.
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        let partner = self.partner_id.as_deref()?;
        if self.host_id == user_id {
            Some(partner)
        } else if partner == user_id {
            Some(&self.host_id)
        } else {
            None
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.status == PartnerStatus::Waiting && older_than(self.created_at, now, max_age)
    }
}

/// Rating totals kept on `users/{id}`. The average is derived on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingAggregate {
    #[serde(default)]
    pub total_ratings: i64,
    #[serde(default)]
    pub rating_sum: i64,
}

impl RatingAggregate {
    pub fn average(&self) -> Option<f64> {
        (self.total_ratings > 0).then(|| self.rating_sum as f64 / self.total_ratings as f64)
    }
}

/// Marker stored at `ratings/{sessionId}_{raterId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingRecord {
    pub session_id: String,
    pub rater_id: String,
    pub rated_id: String,
    pub rating: u8,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl RatingRecord {
    pub fn key(session_id: &str, rater_id: &str) -> String {
        format!("{session_id}_{rater_id}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoPost {
    #[serde(default)]
    pub id: String,
    pub owner_id: String,
    pub video_url: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Marker stored at `likes/{videoId}_{userId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeMarker {
    pub video_id: String,
    pub user_id: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl LikeMarker {
    pub fn key(video_id: &str, user_id: &str) -> String {
        format!("{video_id}_{user_id}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default)]
    pub id: String,
    pub video_id: String,
    pub author_id: String,
    pub text: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partner_status_never_regresses() {
        use PartnerStatus::*;
        assert!(Waiting.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Ended));
        assert!(Waiting.can_transition_to(Ended));
        assert!(!Ended.can_transition_to(InProgress));
        assert!(!InProgress.can_transition_to(Waiting));
        assert!(!Ended.can_transition_to(Waiting));
        assert!(!InProgress.can_transition_to(InProgress));
    }

    #[test]
    fn partner_session_uses_camel_case_wire_names() {
        let session = PartnerSession::new("host", "hiit", 20);
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["status"], json!("waiting"));
        assert_eq!(value["durationMinutes"], json!(20));
        assert!(value["createdAt"].is_i64());
        assert_eq!(PartnerStatus::InProgress.as_str(), "inProgress");
    }

    #[test]
    fn counterpart_requires_both_seats() {
        let mut session = PartnerSession::new("host", "yoga", 30);
        assert_eq!(session.counterpart_of("host"), None);
        session.partner_id = Some("guest".into());
        assert_eq!(session.counterpart_of("host"), Some("guest"));
        assert_eq!(session.counterpart_of("guest"), Some("host"));
        assert_eq!(session.counterpart_of("stranger"), None);
    }

    #[test]
    fn staleness_uses_created_at() {
        let now = Utc::now();
        let mut session = LiveSession::new("h", "Host");
        session.created_at = now - chrono::Duration::hours(3);
        assert!(session.is_stale(now, Duration::from_secs(7_200)));
        session.is_active = false;
        assert!(!session.is_stale(now, Duration::from_secs(7_200)));
    }

    #[test]
    fn channel_tokens_are_fresh_hex() {
        let a = new_channel_token();
        let b = new_channel_token();
        assert_eq!(a.len(), CHANNEL_TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn rating_average_is_derived() {
        assert_eq!(RatingAggregate::default().average(), None);
        let agg = RatingAggregate {
            total_ratings: 2,
            rating_sum: 9,
        };
        assert_eq!(agg.average(), Some(4.5));
    }
}
