//! Seams to the external collaborators: the carrier, speech-to-text, and the LLM analyzer.

use crate::db_types::CallRecording;
use crate::error::AppError;
use crate::types::{AgentLeg, CallAnalysis, OriginateRequest, SupervisionBridge, Transcript};

use async_trait::async_trait;

#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Place the call; returns the provider's call id.
    async fn originate(&self, request: &OriginateRequest) -> Result<String, AppError>;

    /// Dial the rep into the session's conference; returns the rep leg's provider id.
    async fn connect_agent(&self, leg: &AgentLeg) -> Result<String, AppError>;

    /// Add a supervisor leg to the session's conference; returns the leg's provider id.
    async fn bridge_supervisor(&self, bridge: &SupervisionBridge) -> Result<String, AppError>;

    async fn end_bridge(&self, provider_bridge_id: &str) -> Result<(), AppError>;

    /// `answered` selects between hanging up a live call and cancelling one still ringing.
    async fn hangup(&self, provider_call_id: &str, answered: bool) -> Result<(), AppError>;
}

#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    async fn transcribe(&self, recording: &CallRecording) -> Result<Transcript, AppError>;
}

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyze(&self, transcription: &str) -> Result<CallAnalysis, AppError>;
}
