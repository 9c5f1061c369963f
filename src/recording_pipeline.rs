//! Post-call processing of a recording: ingest, transcribe, analyze.
//!
//! Each stage persists its own result, so a recording can sit ingested-but-untranscribed (or
//! transcribed-but-unanalyzed) and be picked up again with [`RecordingPipeline::resume`].
//! Stage failures are flagged on the recording and published; they never touch the call
//! session's status.

use crate::bus::{DomainEvent, EventBus};
use crate::config::OrchestratorSettings;
use crate::db_types::CallRecording;
use crate::error::AppError;
use crate::providers::{AnalysisProvider, TranscriptionProvider};
use crate::store::CallStore;
use crate::types::{CallAnalysis, RecordingRef};
use crate::utils::{bounded, with_retry, KeyedLocks, RetryPolicy};

use sqlx::types::time::OffsetDateTime;
use sqlx::types::Json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct RecordingPipeline {
    store: Arc<dyn CallStore>,
    transcriber: Arc<dyn TranscriptionProvider>,
    analyzer: Arc<dyn AnalysisProvider>,
    bus: EventBus,
    retry: RetryPolicy,
    provider_timeout: Duration,
    /// Keyed by provider recording id so duplicate triggers run one after the other.
    locks: KeyedLocks<String>,
    session_locks: Arc<KeyedLocks<Uuid>>,
}

impl RecordingPipeline {
    pub fn new(
        settings: &OrchestratorSettings,
        store: Arc<dyn CallStore>,
        transcriber: Arc<dyn TranscriptionProvider>,
        analyzer: Arc<dyn AnalysisProvider>,
        bus: EventBus,
        session_locks: Arc<KeyedLocks<Uuid>>,
    ) -> Self {
        Self {
            store,
            transcriber,
            analyzer,
            bus,
            retry: settings.retry,
            provider_timeout: settings.provider_timeout,
            locks: KeyedLocks::new(),
            session_locks,
        }
    }

    /// Run the pipeline for a completed call's recording. A recording seen before resumes
    /// from its first incomplete stage.
    pub async fn process(
        &self,
        session_id: Uuid,
        recording: RecordingRef,
    ) -> Result<CallRecording, AppError> {
        let _guard = self.locks.lock(&recording.provider_recording_id).await;

        let row = CallRecording {
            id: Uuid::new_v4(),
            session_id,
            provider_recording_id: recording.provider_recording_id.clone(),
            url: recording.url.clone(),
            duration_seconds: recording.duration_seconds,
            size_bytes: recording.size_bytes,
            transcription: None,
            transcription_confidence: None,
            transcription_failed: false,
            analysis: None,
            analysis_failed: false,
            created_at: OffsetDateTime::now_utc(),
        };
        let store = &self.store;
        let row_ref = &row;
        let limit = self.provider_timeout;
        let stored = match with_retry(self.retry, "recording ingest", move || {
            bounded(limit, "recording ingest", store.upsert_recording(row_ref))
        })
        .await
        {
            Ok(stored) => stored,
            Err(e) => {
                error!(error=%e, session_id=%session_id, recording=%recording.provider_recording_id, "recording ingestion failed");
                self.bus.publish(DomainEvent::RecordingIngestionFailed {
                    session_id,
                    provider_recording_id: recording.provider_recording_id,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        info!(session_id=%session_id, recording_id=%stored.id, "recording ingested");
        self.bus.publish(DomainEvent::RecordingIngested {
            session_id,
            recording_id: stored.id,
        });

        self.run_stages(stored).await
    }

    /// Re-run whatever stages of a stored recording are incomplete.
    pub async fn resume(&self, recording_id: Uuid) -> Result<CallRecording, AppError> {
        let recording = self.get(recording_id).await?;
        let _guard = self.locks.lock(&recording.provider_recording_id).await;
        let recording = self.get(recording_id).await?;
        self.run_stages(recording).await
    }

    pub async fn get(&self, recording_id: Uuid) -> Result<CallRecording, AppError> {
        self.store
            .get_recording(recording_id)
            .await?
            .ok_or(AppError::RecordingNotFound(recording_id))
    }

    async fn run_stages(&self, mut recording: CallRecording) -> Result<CallRecording, AppError> {
        if !recording.is_transcribed() && !self.transcribe(&mut recording).await? {
            return Ok(recording);
        }
        if recording.analysis.is_none() && !self.analyze(&mut recording).await? {
            return Ok(recording);
        }
        self.write_back_to_session(&recording).await?;
        Ok(recording)
    }

    /// Stage 2. `Ok(false)` when the provider failed and the recording was flagged.
    async fn transcribe(&self, recording: &mut CallRecording) -> Result<bool, AppError> {
        let transcriber = &self.transcriber;
        let target = &*recording;
        let limit = self.provider_timeout;
        let res = with_retry(self.retry, "transcription", move || {
            bounded(limit, "transcription", transcriber.transcribe(target))
        })
        .await;

        match res {
            Ok(transcript) => {
                self.store
                    .set_transcription(recording.id, &transcript)
                    .await?;
                debug!(recording_id=%recording.id, confidence=transcript.confidence, "recording transcribed");
                recording.transcription = Some(transcript.text);
                recording.transcription_confidence = Some(transcript.confidence);
                recording.transcription_failed = false;
                self.bus.publish(DomainEvent::RecordingTranscribed {
                    session_id: recording.session_id,
                    recording_id: recording.id,
                });
                Ok(true)
            }
            Err(e) => {
                warn!(error=%e, recording_id=%recording.id, "transcription failed; skipping analysis");
                self.store.mark_transcription_failed(recording.id).await?;
                recording.transcription_failed = true;
                self.bus.publish(DomainEvent::RecordingTranscriptionFailed {
                    session_id: recording.session_id,
                    recording_id: recording.id,
                    reason: e.to_string(),
                });
                Ok(false)
            }
        }
    }

    /// Stage 3. Only reached with a transcription in hand.
    async fn analyze(&self, recording: &mut CallRecording) -> Result<bool, AppError> {
        let Some(text) = recording.transcription.clone() else {
            return Ok(false);
        };
        let analyzer = &self.analyzer;
        let text_ref = text.as_str();
        let limit = self.provider_timeout;
        let res = with_retry(self.retry, "analysis", move || async move {
            let analysis: CallAnalysis =
                bounded(limit, "analysis", analyzer.analyze(text_ref)).await?;
            analysis.validate()?;
            Ok::<_, AppError>(analysis)
        })
        .await;

        match res {
            Ok(analysis) => {
                self.store.set_analysis(recording.id, &analysis).await?;
                debug!(recording_id=%recording.id, overall=analysis.quality.overall, "recording analyzed");
                recording.analysis = Some(Json(analysis));
                recording.analysis_failed = false;
                self.bus.publish(DomainEvent::RecordingAnalyzed {
                    session_id: recording.session_id,
                    recording_id: recording.id,
                });
                Ok(true)
            }
            Err(e) => {
                warn!(error=%e, recording_id=%recording.id, "analysis failed");
                self.store.mark_analysis_failed(recording.id).await?;
                recording.analysis_failed = true;
                self.bus.publish(DomainEvent::RecordingAnalysisFailed {
                    session_id: recording.session_id,
                    recording_id: recording.id,
                    reason: e.to_string(),
                });
                Ok(false)
            }
        }
    }

    /// Copy transcription and scores onto the session. Idempotent, so it runs on every pass
    /// that has an analysis. Runs under the session lock, between the state machine's writes.
    async fn write_back_to_session(&self, recording: &CallRecording) -> Result<(), AppError> {
        let (Some(text), Some(Json(analysis))) = (&recording.transcription, &recording.analysis)
        else {
            return Ok(());
        };
        let session_id = recording.session_id;
        let _guard = self.session_locks.lock(&session_id).await;
        let store = &self.store;
        let (sentiment, quality) = (analysis.sentiment.score, analysis.quality.overall);
        with_retry(self.retry, "session analysis write", move || {
            store.record_session_analysis(session_id, text, sentiment, quality)
        })
        .await
    }
}
