use crate::db_types::{
    CallEvent, CallRecording, CallSession, CallSupervision, CampaignStatus, DialerCampaign,
    DialerQueueItem, NewCallEvent, QueueItemStatus,
};
use crate::error::AppError;
use crate::store::CallStore;
use crate::types::{CallAnalysis, Transcript};

use async_trait::async_trait;
use sqlx::types::time::OffsetDateTime;
use sqlx::types::Json;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, CallSession>,
    events: Vec<CallEvent>,
    next_seq: i64,
    campaigns: HashMap<Uuid, DialerCampaign>,
    queue: HashMap<Uuid, DialerQueueItem>,
    supervisions: HashMap<Uuid, CallSupervision>,
    recordings: HashMap<Uuid, CallRecording>,
}

/// Process-local `CallStore` with the same conflict and guard semantics as `PgStore`.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, AppError> {
        self.tables
            .lock()
            .map_err(|_| AppError::Store("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn insert_session(&self, session: &CallSession) -> Result<(), AppError> {
        let mut t = self.tables()?;
        if let Some(provider_id) = &session.provider_call_id {
            if t
                .sessions
                .values()
                .any(|s| s.provider_call_id.as_ref() == Some(provider_id))
            {
                return Err(AppError::Store(format!(
                    "duplicate provider call id {provider_id}"
                )));
            }
        }
        if t.sessions.contains_key(&session.id) {
            return Err(AppError::Store(format!("duplicate session {}", session.id)));
        }
        t.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<CallSession>, AppError> {
        Ok(self.tables()?.sessions.get(&id).cloned())
    }

    async fn find_session_by_provider_id(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallSession>, AppError> {
        Ok(self
            .tables()?
            .sessions
            .values()
            .find(|s| s.provider_call_id.as_deref() == Some(provider_call_id))
            .cloned())
    }

    async fn update_session(&self, session: &CallSession) -> Result<(), AppError> {
        let mut t = self.tables()?;
        match t.sessions.get_mut(&session.id) {
            Some(existing) => {
                let mut updated = session.clone();
                updated.transcription = existing.transcription.take();
                updated.sentiment_score = existing.sentiment_score;
                updated.quality_score = existing.quality_score;
                *existing = updated;
                Ok(())
            }
            None => Err(AppError::SessionNotFound(session.id)),
        }
    }

    async fn record_session_analysis(
        &self,
        session_id: Uuid,
        transcription: &str,
        sentiment_score: f64,
        quality_score: f64,
    ) -> Result<(), AppError> {
        let mut t = self.tables()?;
        let session = t
            .sessions
            .get_mut(&session_id)
            .ok_or(AppError::SessionNotFound(session_id))?;
        session.transcription = Some(transcription.to_string());
        session.sentiment_score = Some(sentiment_score);
        session.quality_score = Some(quality_score);
        Ok(())
    }

    async fn append_event(&self, event: NewCallEvent) -> Result<CallEvent, AppError> {
        let mut t = self.tables()?;
        t.next_seq += 1;
        let stored = CallEvent {
            id: Uuid::new_v4(),
            seq: t.next_seq,
            session_id: event.session_id,
            event_type: event.event_type,
            payload: Json(event.payload),
            acting_user_id: event.acting_user_id,
            occurred_at: event.occurred_at,
        };
        t.events.push(stored.clone());
        Ok(stored)
    }

    async fn list_events(&self, session_id: Uuid) -> Result<Vec<CallEvent>, AppError> {
        let mut events: Vec<CallEvent> = self
            .tables()?
            .events
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.occurred_at, e.seq));
        Ok(events)
    }

    async fn insert_campaign(&self, campaign: &DialerCampaign) -> Result<(), AppError> {
        self.tables()?.campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<DialerCampaign>, AppError> {
        Ok(self.tables()?.campaigns.get(&id).cloned())
    }

    async fn set_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<Option<DialerCampaign>, AppError> {
        let mut t = self.tables()?;
        Ok(t.campaigns.get_mut(&id).map(|c| {
            c.status = status;
            c.clone()
        }))
    }

    async fn list_campaigns(&self, status: CampaignStatus) -> Result<Vec<DialerCampaign>, AppError> {
        Ok(self
            .tables()?
            .campaigns
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect())
    }

    async fn insert_queue_item(&self, item: &DialerQueueItem) -> Result<(), AppError> {
        let mut t = self.tables()?;
        let duplicate = t.queue.values().any(|q| {
            q.campaign_id == item.campaign_id && q.lead_id == item.lead_id && q.status.is_active()
        });
        if duplicate {
            return Err(AppError::AlreadyQueued {
                campaign_id: item.campaign_id,
                lead_id: item.lead_id,
            });
        }
        t.queue.insert(item.id, item.clone());
        Ok(())
    }

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        Ok(self.tables()?.queue.get(&id).cloned())
    }

    async fn next_eligible_item(
        &self,
        campaign_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        Ok(self
            .tables()?
            .queue
            .values()
            .filter(|q| {
                q.campaign_id == campaign_id
                    && q.status == QueueItemStatus::Pending
                    && q.next_attempt_at.map_or(true, |at| at <= now)
            })
            .min_by_key(|q| (Reverse(q.priority), q.created_at, q.id))
            .cloned())
    }

    async fn claim_queue_item(
        &self,
        item_id: Uuid,
        session_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        let mut t = self.tables()?;
        Ok(t.queue
            .get_mut(&item_id)
            .filter(|q| q.status == QueueItemStatus::Pending)
            .map(|q| {
                q.status = QueueItemStatus::Calling;
                q.attempts += 1;
                q.last_attempt_at = Some(now);
                q.session_id = Some(session_id);
                q.clone()
            }))
    }

    async fn list_calling_items(&self) -> Result<Vec<DialerQueueItem>, AppError> {
        let mut items: Vec<DialerQueueItem> = self
            .tables()?
            .queue
            .values()
            .filter(|q| q.status == QueueItemStatus::Calling)
            .cloned()
            .collect();
        items.sort_by_key(|q| q.last_attempt_at);
        Ok(items)
    }

    async fn find_calling_item(&self, session_id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        Ok(self
            .tables()?
            .queue
            .values()
            .find(|q| q.status == QueueItemStatus::Calling && q.session_id == Some(session_id))
            .cloned())
    }

    async fn finish_attempt(
        &self,
        item_id: Uuid,
        session_id: Uuid,
        status: QueueItemStatus,
        next_attempt_at: Option<OffsetDateTime>,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        let mut t = self.tables()?;
        Ok(t.queue
            .get_mut(&item_id)
            .filter(|q| q.status == QueueItemStatus::Calling && q.session_id == Some(session_id))
            .map(|q| {
                q.status = status;
                q.next_attempt_at = next_attempt_at;
                q.clone()
            }))
    }

    async fn skip_queue_item(&self, item_id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        let mut t = self.tables()?;
        Ok(t.queue
            .get_mut(&item_id)
            .filter(|q| q.status == QueueItemStatus::Pending)
            .map(|q| {
                q.status = QueueItemStatus::Skipped;
                q.clone()
            }))
    }

    async fn insert_supervision(&self, supervision: &CallSupervision) -> Result<(), AppError> {
        let mut t = self.tables()?;
        if t
            .supervisions
            .values()
            .any(|s| s.session_id == supervision.session_id && s.is_active())
        {
            return Err(AppError::SupervisionInProgress(supervision.session_id));
        }
        t.supervisions.insert(supervision.id, supervision.clone());
        Ok(())
    }

    async fn get_supervision(&self, id: Uuid) -> Result<Option<CallSupervision>, AppError> {
        Ok(self.tables()?.supervisions.get(&id).cloned())
    }

    async fn active_supervision(&self, session_id: Uuid) -> Result<Option<CallSupervision>, AppError> {
        Ok(self
            .tables()?
            .supervisions
            .values()
            .find(|s| s.session_id == session_id && s.is_active())
            .cloned())
    }

    async fn end_supervision(
        &self,
        id: Uuid,
        ended_at: OffsetDateTime,
    ) -> Result<Option<CallSupervision>, AppError> {
        let mut t = self.tables()?;
        Ok(t.supervisions
            .get_mut(&id)
            .filter(|s| s.is_active())
            .map(|s| {
                s.ended_at = Some(ended_at);
                s.clone()
            }))
    }

    async fn update_supervision_notes(
        &self,
        id: Uuid,
        notes: &str,
    ) -> Result<Option<CallSupervision>, AppError> {
        let mut t = self.tables()?;
        Ok(t.supervisions.get_mut(&id).map(|s| {
            s.notes = Some(notes.to_string());
            s.clone()
        }))
    }

    async fn upsert_recording(&self, recording: &CallRecording) -> Result<CallRecording, AppError> {
        let mut t = self.tables()?;
        if let Some(existing) = t
            .recordings
            .values()
            .find(|r| r.provider_recording_id == recording.provider_recording_id)
        {
            return Ok(existing.clone());
        }
        t.recordings.insert(recording.id, recording.clone());
        Ok(recording.clone())
    }

    async fn get_recording(&self, id: Uuid) -> Result<Option<CallRecording>, AppError> {
        Ok(self.tables()?.recordings.get(&id).cloned())
    }

    async fn set_transcription(&self, id: Uuid, transcript: &Transcript) -> Result<(), AppError> {
        let mut t = self.tables()?;
        let recording = t
            .recordings
            .get_mut(&id)
            .ok_or(AppError::RecordingNotFound(id))?;
        recording.transcription = Some(transcript.text.clone());
        recording.transcription_confidence = Some(transcript.confidence);
        recording.transcription_failed = false;
        Ok(())
    }

    async fn mark_transcription_failed(&self, id: Uuid) -> Result<(), AppError> {
        let mut t = self.tables()?;
        let recording = t
            .recordings
            .get_mut(&id)
            .ok_or(AppError::RecordingNotFound(id))?;
        recording.transcription_failed = true;
        Ok(())
    }

    async fn set_analysis(&self, id: Uuid, analysis: &CallAnalysis) -> Result<(), AppError> {
        let mut t = self.tables()?;
        let recording = t
            .recordings
            .get_mut(&id)
            .ok_or(AppError::RecordingNotFound(id))?;
        if !recording.is_transcribed() {
            return Err(AppError::InvalidRequest(format!(
                "recording {id} has no transcription"
            )));
        }
        recording.analysis = Some(Json(analysis.clone()));
        recording.analysis_failed = false;
        Ok(())
    }

    async fn mark_analysis_failed(&self, id: Uuid) -> Result<(), AppError> {
        let mut t = self.tables()?;
        let recording = t
            .recordings
            .get_mut(&id)
            .ok_or(AppError::RecordingNotFound(id))?;
        recording.analysis_failed = true;
        Ok(())
    }
}
