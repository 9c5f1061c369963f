use crate::bus::EventBus;
use crate::call_state::CallStateMachine;
use crate::config::OrchestratorSettings;
use crate::db_types::{CallDirection, SupervisionType};
use crate::dialer::DialerScheduler;
use crate::error::AppError;
use crate::event_log::CallEventLog;
use crate::providers::{AnalysisProvider, TelephonyProvider, TranscriptionProvider};
use crate::recording_pipeline::RecordingPipeline;
use crate::store::CallStore;
use crate::supervision::SupervisionCoordinator;
use crate::utils::KeyedLocks;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Provider-side reference to a finished recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingRef {
    pub provider_recording_id: String,
    pub url: String,
    pub duration_seconds: Option<i32>,
    pub size_bytes: Option<i64>,
}

/// A status callback from the telephony provider, already lifted out of its wire format.
#[derive(Debug, Clone, Default)]
pub struct ProviderEvent {
    pub provider_call_id: String,
    pub raw_status: String,
    /// Session id echoed back in the callback URL; lets early callbacks find their session.
    pub session_hint: Option<Uuid>,
    pub duration_seconds: Option<i32>,
    pub recording: Option<RecordingRef>,
}

#[derive(Debug, Clone)]
pub struct OriginateRequest {
    /// Assigned before the provider is contacted; authoritative.
    pub session_id: Uuid,
    pub direction: CallDirection,
    pub from: String,
    pub to: String,
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub lead_id: Option<Uuid>,
}

impl OriginateRequest {
    pub fn outbound(from: &str, to: &str, user_id: Uuid, company_id: Uuid, lead_id: Option<Uuid>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            direction: CallDirection::Outbound,
            from: from.to_string(),
            to: to.to_string(),
            user_id,
            company_id,
            lead_id,
        }
    }
}

/// The rep joining a session's conference once the other party is on the line.
#[derive(Debug, Clone)]
pub struct AgentLeg {
    pub session_id: Uuid,
    pub conference_name: String,
    pub agent_id: Uuid,
}

/// What the provider needs to put a supervisor onto a live call.
#[derive(Debug, Clone)]
pub struct SupervisionBridge {
    pub session_id: Uuid,
    pub conference_name: String,
    pub supervisor_id: Uuid,
    pub mode: SupervisionType,
    /// The rep's leg; whisper audio reaches only this participant.
    pub coach_call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// 0..=1
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: SentimentLabel,
    /// -1..=1
    pub score: f64,
}

/// Sub-scores and overall score, each 1..=10.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub clarity: f64,
    pub professionalism: f64,
    pub resolution: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnalysis {
    pub sentiment: Sentiment,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub quality: QualityScores,
}

impl CallAnalysis {
    pub fn validate(&self) -> Result<(), AppError> {
        if !(-1.0..=1.0).contains(&self.sentiment.score) {
            return Err(AppError::Provider(format!(
                "sentiment score {} outside [-1, 1]",
                self.sentiment.score
            )));
        }
        let q = &self.quality;
        for (name, score) in [
            ("clarity", q.clarity),
            ("professionalism", q.professionalism),
            ("resolution", q.resolution),
            ("overall", q.overall),
        ] {
            if !(1.0..=10.0).contains(&score) {
                return Err(AppError::Provider(format!(
                    "{name} score {score} outside [1, 10]"
                )));
            }
        }
        Ok(())
    }
}

pub struct AppState {
    pub settings: OrchestratorSettings,
    pub store: Arc<dyn CallStore>,
    pub bus: EventBus,
    pub calls: Arc<CallStateMachine>,
    pub dialer: Arc<DialerScheduler>,
    pub supervision: Arc<SupervisionCoordinator>,
    pub recordings: Arc<RecordingPipeline>,
}

impl AppState {
    /// Wire the orchestration components around one store and one set of providers.
    pub fn new(
        settings: OrchestratorSettings,
        store: Arc<dyn CallStore>,
        telephony: Arc<dyn TelephonyProvider>,
        transcriber: Arc<dyn TranscriptionProvider>,
        analyzer: Arc<dyn AnalysisProvider>,
    ) -> Self {
        let bus = EventBus::new();
        let session_locks = Arc::new(KeyedLocks::new());
        let event_log = CallEventLog::new(store.clone(), bus.clone());
        let supervision = Arc::new(SupervisionCoordinator::new(
            store.clone(),
            telephony.clone(),
            event_log.clone(),
            bus.clone(),
            session_locks.clone(),
            settings.provider_timeout,
        ));
        let calls = Arc::new(CallStateMachine::new(
            &settings,
            store.clone(),
            telephony,
            event_log,
            bus.clone(),
            supervision.clone(),
            session_locks.clone(),
        ));
        let dialer = Arc::new(DialerScheduler::new(
            &settings,
            store.clone(),
            calls.clone(),
            bus.clone(),
        ));
        let recordings = Arc::new(RecordingPipeline::new(
            &settings,
            store.clone(),
            transcriber,
            analyzer,
            bus.clone(),
            session_locks,
        ));

        Self {
            settings,
            store,
            bus,
            calls,
            dialer,
            supervision,
            recordings,
        }
    }
}
