//! Repository interface over the relational store.
//!
//! Every conditional method (`claim_queue_item`, `finish_attempt`, `end_supervision`, ...)
//! applies its change only while the row is still in the expected state and returns `None`
//! otherwise, so concurrent workers racing for the same row see exactly one winner.

use crate::db_types::{
    CallEvent, CallRecording, CallSession, CallSupervision, CampaignStatus, DialerCampaign,
    DialerQueueItem, NewCallEvent, QueueItemStatus,
};
use crate::error::AppError;
use crate::types::{CallAnalysis, Transcript};

use async_trait::async_trait;
use sqlx::types::time::OffsetDateTime;
use uuid::Uuid;

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn insert_session(&self, session: &CallSession) -> Result<(), AppError>;
    async fn get_session(&self, id: Uuid) -> Result<Option<CallSession>, AppError>;
    async fn find_session_by_provider_id(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallSession>, AppError>;
    /// Writes the lifecycle fields of a session. Transcription and scores are left alone;
    /// only `record_session_analysis` writes those. Callers hold the session lock.
    async fn update_session(&self, session: &CallSession) -> Result<(), AppError>;
    /// Idempotent write of the pipeline's results onto the session.
    async fn record_session_analysis(
        &self,
        session_id: Uuid,
        transcription: &str,
        sentiment_score: f64,
        quality_score: f64,
    ) -> Result<(), AppError>;

    async fn append_event(&self, event: NewCallEvent) -> Result<CallEvent, AppError>;
    /// Ordered by timestamp, then insertion sequence.
    async fn list_events(&self, session_id: Uuid) -> Result<Vec<CallEvent>, AppError>;

    async fn insert_campaign(&self, campaign: &DialerCampaign) -> Result<(), AppError>;
    async fn get_campaign(&self, id: Uuid) -> Result<Option<DialerCampaign>, AppError>;
    async fn set_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<Option<DialerCampaign>, AppError>;
    async fn list_campaigns(&self, status: CampaignStatus) -> Result<Vec<DialerCampaign>, AppError>;

    /// Fails with `AlreadyQueued` when the lead has a pending or calling item in the campaign.
    async fn insert_queue_item(&self, item: &DialerQueueItem) -> Result<(), AppError>;
    async fn get_queue_item(&self, id: Uuid) -> Result<Option<DialerQueueItem>, AppError>;
    /// Highest priority, then earliest queued, among pending items due at `now`.
    async fn next_eligible_item(
        &self,
        campaign_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DialerQueueItem>, AppError>;
    /// pending -> calling, bumping attempts and linking the attempt's session.
    async fn claim_queue_item(
        &self,
        item_id: Uuid,
        session_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DialerQueueItem>, AppError>;
    /// Every item with a dial attempt in flight, oldest attempt first.
    async fn list_calling_items(&self) -> Result<Vec<DialerQueueItem>, AppError>;
    async fn find_calling_item(&self, session_id: Uuid) -> Result<Option<DialerQueueItem>, AppError>;
    /// calling -> `status`, only while the item is still calling for `session_id`.
    async fn finish_attempt(
        &self,
        item_id: Uuid,
        session_id: Uuid,
        status: QueueItemStatus,
        next_attempt_at: Option<OffsetDateTime>,
    ) -> Result<Option<DialerQueueItem>, AppError>;
    /// pending -> skipped.
    async fn skip_queue_item(&self, item_id: Uuid) -> Result<Option<DialerQueueItem>, AppError>;

    /// Fails with `SupervisionInProgress` when the session already has an unended supervision.
    async fn insert_supervision(&self, supervision: &CallSupervision) -> Result<(), AppError>;
    async fn get_supervision(&self, id: Uuid) -> Result<Option<CallSupervision>, AppError>;
    async fn active_supervision(&self, session_id: Uuid) -> Result<Option<CallSupervision>, AppError>;
    /// Sets ended-at only if the supervision is still active.
    async fn end_supervision(
        &self,
        id: Uuid,
        ended_at: OffsetDateTime,
    ) -> Result<Option<CallSupervision>, AppError>;
    async fn update_supervision_notes(
        &self,
        id: Uuid,
        notes: &str,
    ) -> Result<Option<CallSupervision>, AppError>;

    /// Insert keyed by provider recording id; returns the existing row on conflict.
    async fn upsert_recording(&self, recording: &CallRecording) -> Result<CallRecording, AppError>;
    async fn get_recording(&self, id: Uuid) -> Result<Option<CallRecording>, AppError>;
    async fn set_transcription(&self, id: Uuid, transcript: &Transcript) -> Result<(), AppError>;
    async fn mark_transcription_failed(&self, id: Uuid) -> Result<(), AppError>;
    /// Refuses recordings without a transcription.
    async fn set_analysis(&self, id: Uuid, analysis: &CallAnalysis) -> Result<(), AppError>;
    async fn mark_analysis_failed(&self, id: Uuid) -> Result<(), AppError>;
}
