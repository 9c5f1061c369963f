use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::time::{OffsetDateTime, Time};
use sqlx::types::Json;
use uuid::Uuid;

use crate::types::CallAnalysis;

time::serde::format_description!(hhmm, Time, "[hour]:[minute]");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "call_direction", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Logical call states. `Completed`, `Failed` and `Cancelled` are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "call_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Completed,
    Failed,
    Cancelled,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "call_event_type", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum CallEventType {
    Dial,
    Ring,
    Answer,
    Hangup,
    Transfer,
    Hold,
    Mute,
    RecordingStart,
    RecordingStop,
    SupervisionStart,
    SupervisionEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "campaign_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "queue_item_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Calling,
    Completed,
    Failed,
    Skipped,
}

impl QueueItemStatus {
    /// A lead with an active item may not be queued again in the same campaign.
    pub fn is_active(&self) -> bool {
        matches!(self, QueueItemStatus::Pending | QueueItemStatus::Calling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "supervision_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SupervisionType {
    /// One-way audio to the supervisor.
    Listen,
    /// Supervisor audible to the rep only.
    Whisper,
    /// Full three-way audio.
    Barge,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CallSession {
    pub id: Uuid,
    pub provider_call_id: Option<String>,
    /// The rep's leg in the session's conference, once connected.
    pub agent_call_id: Option<String>,
    pub direction: CallDirection,
    pub from_number: String,
    pub to_number: String,
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub status: CallStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub answered_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub duration_seconds: Option<i32>,
    pub recording_sid: Option<String>,
    pub recording_url: Option<String>,
    pub transcription: Option<String>,
    pub sentiment_score: Option<f64>,
    pub quality_score: Option<f64>,
    pub disposition: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CallEvent {
    pub id: Uuid,
    /// Insertion sequence; breaks ties between equal timestamps.
    pub seq: i64,
    pub session_id: Uuid,
    pub event_type: CallEventType,
    pub payload: Json<Value>,
    pub acting_user_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewCallEvent {
    pub session_id: Uuid,
    pub event_type: CallEventType,
    pub payload: Value,
    pub acting_user_id: Option<Uuid>,
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DialerCampaign {
    pub id: Uuid,
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    /// Opaque to the dialer; interpreted by whoever enqueues leads.
    pub lead_filter: Json<Value>,
    pub script: String,
    pub max_attempts: i32,
    pub retry_delay_minutes: i32,
    #[serde(with = "hhmm")]
    pub working_hours_start: Time,
    #[serde(with = "hhmm")]
    pub working_hours_end: Time,
    /// IANA zone name, e.g. `America/Chicago`.
    pub timezone: String,
    pub status: CampaignStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub lead_filter: Value,
    #[serde(default)]
    pub script: String,
    pub max_attempts: i32,
    pub retry_delay_minutes: i32,
    #[serde(with = "hhmm")]
    pub working_hours_start: Time,
    #[serde(with = "hhmm")]
    pub working_hours_end: Time,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DialerQueueItem {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    pub phone_number: String,
    /// Higher dials sooner.
    pub priority: i32,
    pub attempts: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    /// `None` means immediately eligible.
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_attempt_at: Option<OffsetDateTime>,
    pub status: QueueItemStatus,
    /// Session of the current (or most recent) attempt.
    pub session_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CallSupervision {
    pub id: Uuid,
    pub session_id: Uuid,
    pub supervisor_id: Uuid,
    pub supervision_type: SupervisionType,
    /// Provider handle of the supervisor's leg, used for teardown.
    pub provider_bridge_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub notes: Option<String>,
}

impl CallSupervision {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CallRecording {
    pub id: Uuid,
    pub session_id: Uuid,
    pub provider_recording_id: String,
    pub url: String,
    pub duration_seconds: Option<i32>,
    pub size_bytes: Option<i64>,
    pub transcription: Option<String>,
    pub transcription_confidence: Option<f64>,
    pub transcription_failed: bool,
    pub analysis: Option<Json<CallAnalysis>>,
    pub analysis_failed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl CallRecording {
    pub fn is_transcribed(&self) -> bool {
        self.transcription.is_some()
    }
}
