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
use sqlx::{Pool, Postgres};
use tracing::error;
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!(error=%e, "failed to run migrations");
                AppError::Store(e.to_string())
            })
    }
}

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| {
        error!(error=%e, "{context}");
        AppError::from(e)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

#[async_trait]
impl CallStore for PgStore {
    async fn insert_session(&self, session: &CallSession) -> Result<(), AppError> {
        sqlx::query(
            "
            insert into call_sessions (
              id, provider_call_id, agent_call_id, direction, from_number, to_number,
              user_id, company_id, lead_id, status, started_at, answered_at, ended_at,
              duration_seconds, recording_sid, recording_url, transcription, sentiment_score,
              quality_score, disposition, notes
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
              $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21
            )
            ",
        )
        .bind(session.id)
        .bind(&session.provider_call_id)
        .bind(&session.agent_call_id)
        .bind(session.direction)
        .bind(&session.from_number)
        .bind(&session.to_number)
        .bind(session.user_id)
        .bind(session.company_id)
        .bind(session.lead_id)
        .bind(session.status)
        .bind(session.started_at)
        .bind(session.answered_at)
        .bind(session.ended_at)
        .bind(session.duration_seconds)
        .bind(&session.recording_sid)
        .bind(&session.recording_url)
        .bind(&session.transcription)
        .bind(session.sentiment_score)
        .bind(session.quality_score)
        .bind(&session.disposition)
        .bind(&session.notes)
        .execute(&self.pool)
        .await
        .map_err(db_error("failed to insert call session"))?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<CallSession>, AppError> {
        sqlx::query_as::<_, CallSession>("select * from call_sessions where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("failed to fetch call session"))
    }

    async fn find_session_by_provider_id(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallSession>, AppError> {
        sqlx::query_as::<_, CallSession>(
            "select * from call_sessions where provider_call_id = $1",
        )
        .bind(provider_call_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to fetch call session by provider id"))
    }

    async fn update_session(&self, session: &CallSession) -> Result<(), AppError> {
        // transcription and scores belong to record_session_analysis.
        let res = sqlx::query(
            "
            update call_sessions set
              provider_call_id = $2,
              agent_call_id = $3,
              status = $4,
              answered_at = $5,
              ended_at = $6,
              duration_seconds = $7,
              recording_sid = $8,
              recording_url = $9,
              disposition = $10,
              notes = $11
            where id = $1
            ",
        )
        .bind(session.id)
        .bind(&session.provider_call_id)
        .bind(&session.agent_call_id)
        .bind(session.status)
        .bind(session.answered_at)
        .bind(session.ended_at)
        .bind(session.duration_seconds)
        .bind(&session.recording_sid)
        .bind(&session.recording_url)
        .bind(&session.disposition)
        .bind(&session.notes)
        .execute(&self.pool)
        .await
        .map_err(db_error("failed to update call session"))?;
        if res.rows_affected() == 0 {
            return Err(AppError::SessionNotFound(session.id));
        }
        Ok(())
    }

    async fn record_session_analysis(
        &self,
        session_id: Uuid,
        transcription: &str,
        sentiment_score: f64,
        quality_score: f64,
    ) -> Result<(), AppError> {
        let res = sqlx::query(
            "
            update call_sessions
            set transcription = $2, sentiment_score = $3, quality_score = $4
            where id = $1
            ",
        )
        .bind(session_id)
        .bind(transcription)
        .bind(sentiment_score)
        .bind(quality_score)
        .execute(&self.pool)
        .await
        .map_err(db_error("failed to write session analysis"))?;
        if res.rows_affected() == 0 {
            return Err(AppError::SessionNotFound(session_id));
        }
        Ok(())
    }

    async fn append_event(&self, event: NewCallEvent) -> Result<CallEvent, AppError> {
        sqlx::query_as::<_, CallEvent>(
            "
            insert into call_events (
              id, session_id, event_type, payload, acting_user_id, occurred_at
            ) values (
              $1, $2, $3, $4, $5, $6
            )
            returning *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(event.session_id)
        .bind(event.event_type)
        .bind(Json(&event.payload))
        .bind(event.acting_user_id)
        .bind(event.occurred_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("failed to append call event"))
    }

    async fn list_events(&self, session_id: Uuid) -> Result<Vec<CallEvent>, AppError> {
        sqlx::query_as::<_, CallEvent>(
            "select * from call_events where session_id = $1 order by occurred_at, seq",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to list call events"))
    }

    async fn insert_campaign(&self, campaign: &DialerCampaign) -> Result<(), AppError> {
        sqlx::query(
            "
            insert into dialer_campaigns (
              id, company_id, user_id, name, lead_filter, script, max_attempts,
              retry_delay_minutes, working_hours_start, working_hours_end, timezone,
              status, created_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
            )
            ",
        )
        .bind(campaign.id)
        .bind(campaign.company_id)
        .bind(campaign.user_id)
        .bind(&campaign.name)
        .bind(&campaign.lead_filter)
        .bind(&campaign.script)
        .bind(campaign.max_attempts)
        .bind(campaign.retry_delay_minutes)
        .bind(campaign.working_hours_start)
        .bind(campaign.working_hours_end)
        .bind(&campaign.timezone)
        .bind(campaign.status)
        .bind(campaign.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("failed to insert campaign"))?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<DialerCampaign>, AppError> {
        sqlx::query_as::<_, DialerCampaign>("select * from dialer_campaigns where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("failed to fetch campaign"))
    }

    async fn set_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<Option<DialerCampaign>, AppError> {
        sqlx::query_as::<_, DialerCampaign>(
            "update dialer_campaigns set status = $2 where id = $1 returning *",
        )
        .bind(id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to update campaign status"))
    }

    async fn list_campaigns(&self, status: CampaignStatus) -> Result<Vec<DialerCampaign>, AppError> {
        sqlx::query_as::<_, DialerCampaign>(
            "select * from dialer_campaigns where status = $1 order by created_at",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to list campaigns"))
    }

    async fn insert_queue_item(&self, item: &DialerQueueItem) -> Result<(), AppError> {
        let res = sqlx::query(
            "
            insert into dialer_queue (
              id, campaign_id, lead_id, phone_number, priority, attempts,
              last_attempt_at, next_attempt_at, status, session_id, created_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
            )
            ",
        )
        .bind(item.id)
        .bind(item.campaign_id)
        .bind(item.lead_id)
        .bind(&item.phone_number)
        .bind(item.priority)
        .bind(item.attempts)
        .bind(item.last_attempt_at)
        .bind(item.next_attempt_at)
        .bind(item.status)
        .bind(item.session_id)
        .bind(item.created_at)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(AppError::AlreadyQueued {
                campaign_id: item.campaign_id,
                lead_id: item.lead_id,
            }),
            Err(e) => Err(db_error("failed to insert queue item")(e)),
        }
    }

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        sqlx::query_as::<_, DialerQueueItem>("select * from dialer_queue where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("failed to fetch queue item"))
    }

    async fn next_eligible_item(
        &self,
        campaign_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        sqlx::query_as::<_, DialerQueueItem>(
            "
            select *
            from dialer_queue
            where campaign_id = $1
              and status = 'pending'
              and (next_attempt_at is null or next_attempt_at <= $2)
            order by priority desc, created_at asc, id asc
            limit 1
            ",
        )
        .bind(campaign_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to select next queue item"))
    }

    async fn claim_queue_item(
        &self,
        item_id: Uuid,
        session_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        sqlx::query_as::<_, DialerQueueItem>(
            "
            update dialer_queue
            set status = 'calling',
                attempts = attempts + 1,
                last_attempt_at = $3,
                session_id = $2
            where id = $1 and status = 'pending'
            returning *
            ",
        )
        .bind(item_id)
        .bind(session_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to claim queue item"))
    }

    async fn list_calling_items(&self) -> Result<Vec<DialerQueueItem>, AppError> {
        sqlx::query_as::<_, DialerQueueItem>(
            "select * from dialer_queue where status = 'calling' order by last_attempt_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to list calling queue items"))
    }

    async fn find_calling_item(&self, session_id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        sqlx::query_as::<_, DialerQueueItem>(
            "select * from dialer_queue where session_id = $1 and status = 'calling'",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to find calling queue item"))
    }

    async fn finish_attempt(
        &self,
        item_id: Uuid,
        session_id: Uuid,
        status: QueueItemStatus,
        next_attempt_at: Option<OffsetDateTime>,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        sqlx::query_as::<_, DialerQueueItem>(
            "
            update dialer_queue
            set status = $3, next_attempt_at = $4
            where id = $1 and session_id = $2 and status = 'calling'
            returning *
            ",
        )
        .bind(item_id)
        .bind(session_id)
        .bind(status)
        .bind(next_attempt_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to finish queue attempt"))
    }

    async fn skip_queue_item(&self, item_id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        sqlx::query_as::<_, DialerQueueItem>(
            "
            update dialer_queue set status = 'skipped'
            where id = $1 and status = 'pending'
            returning *
            ",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to skip queue item"))
    }

    async fn insert_supervision(&self, supervision: &CallSupervision) -> Result<(), AppError> {
        let res = sqlx::query(
            "
            insert into call_supervisions (
              id, session_id, supervisor_id, supervision_type, provider_bridge_id,
              started_at, ended_at, notes
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8
            )
            ",
        )
        .bind(supervision.id)
        .bind(supervision.session_id)
        .bind(supervision.supervisor_id)
        .bind(supervision.supervision_type)
        .bind(&supervision.provider_bridge_id)
        .bind(supervision.started_at)
        .bind(supervision.ended_at)
        .bind(&supervision.notes)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(AppError::SupervisionInProgress(supervision.session_id))
            }
            Err(e) => Err(db_error("failed to insert supervision")(e)),
        }
    }

    async fn get_supervision(&self, id: Uuid) -> Result<Option<CallSupervision>, AppError> {
        sqlx::query_as::<_, CallSupervision>("select * from call_supervisions where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("failed to fetch supervision"))
    }

    async fn active_supervision(&self, session_id: Uuid) -> Result<Option<CallSupervision>, AppError> {
        sqlx::query_as::<_, CallSupervision>(
            "select * from call_supervisions where session_id = $1 and ended_at is null",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to fetch active supervision"))
    }

    async fn end_supervision(
        &self,
        id: Uuid,
        ended_at: OffsetDateTime,
    ) -> Result<Option<CallSupervision>, AppError> {
        sqlx::query_as::<_, CallSupervision>(
            "
            update call_supervisions set ended_at = $2
            where id = $1 and ended_at is null
            returning *
            ",
        )
        .bind(id)
        .bind(ended_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to end supervision"))
    }

    async fn update_supervision_notes(
        &self,
        id: Uuid,
        notes: &str,
    ) -> Result<Option<CallSupervision>, AppError> {
        sqlx::query_as::<_, CallSupervision>(
            "update call_supervisions set notes = $2 where id = $1 returning *",
        )
        .bind(id)
        .bind(notes)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to update supervision notes"))
    }

    async fn upsert_recording(&self, recording: &CallRecording) -> Result<CallRecording, AppError> {
        // The no-op update makes `returning` yield the existing row on conflict.
        sqlx::query_as::<_, CallRecording>(
            "
            insert into call_recordings (
              id, session_id, provider_recording_id, url, duration_seconds, size_bytes,
              transcription, transcription_confidence, transcription_failed, analysis,
              analysis_failed, created_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            )
            on conflict (provider_recording_id)
            do update set provider_recording_id = excluded.provider_recording_id
            returning *
            ",
        )
        .bind(recording.id)
        .bind(recording.session_id)
        .bind(&recording.provider_recording_id)
        .bind(&recording.url)
        .bind(recording.duration_seconds)
        .bind(recording.size_bytes)
        .bind(&recording.transcription)
        .bind(recording.transcription_confidence)
        .bind(recording.transcription_failed)
        .bind(&recording.analysis)
        .bind(recording.analysis_failed)
        .bind(recording.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("failed to upsert recording"))
    }

    async fn get_recording(&self, id: Uuid) -> Result<Option<CallRecording>, AppError> {
        sqlx::query_as::<_, CallRecording>("select * from call_recordings where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("failed to fetch recording"))
    }

    async fn set_transcription(&self, id: Uuid, transcript: &Transcript) -> Result<(), AppError> {
        let res = sqlx::query(
            "
            update call_recordings
            set transcription = $2, transcription_confidence = $3, transcription_failed = false
            where id = $1
            ",
        )
        .bind(id)
        .bind(&transcript.text)
        .bind(transcript.confidence)
        .execute(&self.pool)
        .await
        .map_err(db_error("failed to write transcription"))?;
        if res.rows_affected() == 0 {
            return Err(AppError::RecordingNotFound(id));
        }
        Ok(())
    }

    async fn mark_transcription_failed(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("update call_recordings set transcription_failed = true where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("failed to flag transcription failure"))?;
        Ok(())
    }

    async fn set_analysis(&self, id: Uuid, analysis: &CallAnalysis) -> Result<(), AppError> {
        let res = sqlx::query(
            "
            update call_recordings
            set analysis = $2, analysis_failed = false
            where id = $1 and transcription is not null
            ",
        )
        .bind(id)
        .bind(Json(analysis))
        .execute(&self.pool)
        .await
        .map_err(db_error("failed to write analysis"))?;
        if res.rows_affected() == 0 {
            return Err(AppError::InvalidRequest(format!(
                "recording {id} missing or not transcribed"
            )));
        }
        Ok(())
    }

    async fn mark_analysis_failed(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("update call_recordings set analysis_failed = true where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("failed to flag analysis failure"))?;
        Ok(())
    }
}
