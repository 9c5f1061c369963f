use crate::bus::{DomainEvent, EventBus};
use crate::config::OrchestratorSettings;
use crate::db_types::{CallDirection, CallEvent, CallEventType, CallSession, CallStatus};
use crate::error::AppError;
use crate::event_log::CallEventLog;
use crate::providers::TelephonyProvider;
use crate::store::CallStore;
use crate::supervision::SupervisionCoordinator;
use crate::twilio_types::TwilioCallStatus;
use crate::types::{AgentLeg, OriginateRequest, ProviderEvent, RecordingRef};
use crate::utils::{bounded, conference_name, with_retry, KeyedLocks, RetryPolicy};

use serde_json::{json, Value};
use sqlx::types::time::OffsetDateTime;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Map a provider status to the logical state it represents, plus the disposition recorded
/// for provider-side failures. `None` for statuses outside the known vocabulary.
pub fn map_provider_status(raw: &str) -> Option<(CallStatus, Option<&'static str>)> {
    let status = raw.parse::<TwilioCallStatus>().ok()?;
    Some(match status {
        TwilioCallStatus::Queued | TwilioCallStatus::Initiated => (CallStatus::Initiated, None),
        TwilioCallStatus::Ringing => (CallStatus::Ringing, None),
        TwilioCallStatus::InProgress | TwilioCallStatus::Answered => (CallStatus::Answered, None),
        TwilioCallStatus::Completed => (CallStatus::Completed, None),
        TwilioCallStatus::Busy => (CallStatus::Failed, Some("busy")),
        TwilioCallStatus::NoAnswer => (CallStatus::Failed, Some("no-answer")),
        TwilioCallStatus::Failed => (CallStatus::Failed, Some("error")),
        TwilioCallStatus::Canceled => (CallStatus::Cancelled, None),
    })
}

/// Forward moves of the session lifecycle. Terminal states are sinks; anything not listed
/// (regressions, repeats) is dropped by the caller.
pub fn transition_allowed(from: CallStatus, to: CallStatus) -> bool {
    use CallStatus::*;
    matches!(
        (from, to),
        (Initiated, Ringing)
            | (Initiated, Answered)
            | (Ringing, Answered)
            | (Initiated | Ringing | Answered, Completed)
            | (Initiated | Ringing, Failed)
            | (Initiated | Ringing | Answered, Cancelled)
    )
}

fn event_type_for(status: CallStatus) -> CallEventType {
    match status {
        CallStatus::Initiated => CallEventType::Dial,
        CallStatus::Ringing => CallEventType::Ring,
        CallStatus::Answered => CallEventType::Answer,
        CallStatus::Completed | CallStatus::Failed | CallStatus::Cancelled => {
            CallEventType::Hangup
        }
    }
}

/// Event types a user may record against a live call.
const USER_ACTIONS: &[CallEventType] = &[
    CallEventType::Hold,
    CallEventType::Mute,
    CallEventType::Transfer,
    CallEventType::RecordingStart,
    CallEventType::RecordingStop,
];

#[derive(Debug, Default)]
struct TransitionDetails {
    provider_status: Option<String>,
    disposition: Option<String>,
    duration_seconds: Option<i32>,
    recording: Option<RecordingRef>,
    acting_user_id: Option<Uuid>,
}

/// Owns every call session's lifecycle. All mutations of one session run under that
/// session's lock.
pub struct CallStateMachine {
    store: Arc<dyn CallStore>,
    telephony: Arc<dyn TelephonyProvider>,
    event_log: CallEventLog,
    bus: EventBus,
    supervision: Arc<SupervisionCoordinator>,
    session_locks: Arc<KeyedLocks<Uuid>>,
    inbound_locks: KeyedLocks<String>,
    provider_timeout: Duration,
    retry: RetryPolicy,
    inbound_user_id: Uuid,
    inbound_company_id: Uuid,
}

impl CallStateMachine {
    pub fn new(
        settings: &OrchestratorSettings,
        store: Arc<dyn CallStore>,
        telephony: Arc<dyn TelephonyProvider>,
        event_log: CallEventLog,
        bus: EventBus,
        supervision: Arc<SupervisionCoordinator>,
        session_locks: Arc<KeyedLocks<Uuid>>,
    ) -> Self {
        Self {
            store,
            telephony,
            event_log,
            bus,
            supervision,
            session_locks,
            inbound_locks: KeyedLocks::new(),
            provider_timeout: settings.provider_timeout,
            retry: settings.retry,
            inbound_user_id: settings.inbound_user_id,
            inbound_company_id: settings.inbound_company_id,
        }
    }

    /// Persist a session in `initiated` and ask the provider to place the call.
    ///
    /// A provider failure still leaves the session behind, moved to `failed` with disposition
    /// `error`, and surfaces as `ProviderUnavailable`. The provider request is not repeated
    /// here: a timed-out request may still have placed the call.
    pub async fn originate(&self, request: OriginateRequest) -> Result<Uuid, AppError> {
        let session_id = request.session_id;
        let _guard = self.session_locks.lock(&session_id).await;

        let mut session = CallSession {
            id: session_id,
            provider_call_id: None,
            agent_call_id: None,
            direction: request.direction,
            from_number: request.from.clone(),
            to_number: request.to.clone(),
            user_id: request.user_id,
            company_id: request.company_id,
            lead_id: request.lead_id,
            status: CallStatus::Initiated,
            started_at: OffsetDateTime::now_utc(),
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
            recording_sid: None,
            recording_url: None,
            transcription: None,
            sentiment_score: None,
            quality_score: None,
            disposition: None,
            notes: None,
        };
        let dial_payload = json!({ "to": request.to, "from": request.from });
        self.create_session(&session, dial_payload, Some(request.user_id))
            .await?;

        match bounded(
            self.provider_timeout,
            "originate call",
            self.telephony.originate(&request),
        )
        .await
        {
            Ok(provider_call_id) => {
                info!(session_id=%session_id, provider_call_id=%provider_call_id, "call placed");
                session.provider_call_id = Some(provider_call_id);
                if let Err(e) = self.store.update_session(&session).await {
                    // Callbacks still find the session through the echoed session id.
                    warn!(error=%e, session_id=%session_id, "failed to store provider call id");
                }
                Ok(session_id)
            }
            Err(e) => {
                error!(error=%e, session_id=%session_id, "provider could not place call");
                let details = TransitionDetails {
                    disposition: Some("error".to_string()),
                    ..Default::default()
                };
                self.transition(session, CallStatus::Failed, details).await?;
                Err(AppError::ProviderUnavailable {
                    session_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Create the session for a call arriving on one of our numbers, once per provider call.
    pub async fn register_inbound(
        &self,
        provider_call_id: &str,
        from: &str,
        to: &str,
    ) -> Result<CallSession, AppError> {
        let _guard = self.inbound_locks.lock(&provider_call_id.to_string()).await;
        if let Some(existing) = self.store.find_session_by_provider_id(provider_call_id).await? {
            return Ok(existing);
        }

        let session = CallSession {
            id: Uuid::new_v4(),
            provider_call_id: Some(provider_call_id.to_string()),
            agent_call_id: None,
            direction: CallDirection::Inbound,
            from_number: from.to_string(),
            to_number: to.to_string(),
            user_id: self.inbound_user_id,
            company_id: self.inbound_company_id,
            lead_id: None,
            status: CallStatus::Initiated,
            started_at: OffsetDateTime::now_utc(),
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
            recording_sid: None,
            recording_url: None,
            transcription: None,
            sentiment_score: None,
            quality_score: None,
            disposition: None,
            notes: None,
        };
        self.create_session(
            &session,
            json!({ "from": from, "to": to, "provider_call_id": provider_call_id }),
            None,
        )
        .await?;
        info!(session_id=%session.id, provider_call_id=%provider_call_id, "inbound call registered");
        Ok(session)
    }

    /// Apply one provider status callback. Returns the state entered, or `None` when the
    /// callback was a duplicate, a regression, unknown, or for a call we do not track.
    pub async fn apply_provider_event(
        &self,
        event: ProviderEvent,
    ) -> Result<Option<CallStatus>, AppError> {
        let (target, disposition) = match map_provider_status(&event.raw_status) {
            Some(mapped) => mapped,
            None => {
                warn!(status=%event.raw_status, provider_call_id=%event.provider_call_id, "ignoring unknown provider status");
                return Ok(None);
            }
        };
        let session_id = match self
            .resolve_session(&event.provider_call_id, event.session_hint)
            .await?
        {
            Some(id) => id,
            None => {
                warn!(provider_call_id=%event.provider_call_id, "status callback for unknown call");
                return Ok(None);
            }
        };

        let _guard = self.session_locks.lock(&session_id).await;
        let mut session = self.load(session_id).await?;

        let mut dirty = false;
        if session.provider_call_id.is_none() && !event.provider_call_id.is_empty() {
            session.provider_call_id = Some(event.provider_call_id.clone());
            dirty = true;
        }

        if !transition_allowed(session.status, target) {
            if dirty {
                self.store.update_session(&session).await?;
            }
            debug!(session_id=%session_id, current=%session.status, incoming=%target, "dropping non-advancing status");
            return Ok(None);
        }

        let details = TransitionDetails {
            provider_status: Some(event.raw_status),
            disposition: disposition.map(str::to_string),
            duration_seconds: event.duration_seconds,
            recording: event.recording,
            acting_user_id: None,
        };
        self.transition(session, target, details).await?;
        Ok(Some(target))
    }

    /// Store the recording reference delivered by the provider's recording callback. Only the
    /// first reference is kept.
    pub async fn attach_recording(
        &self,
        provider_call_id: &str,
        session_hint: Option<Uuid>,
        recording: RecordingRef,
    ) -> Result<(), AppError> {
        let session_id = self
            .resolve_session(provider_call_id, session_hint)
            .await?
            .ok_or_else(|| {
                AppError::InvalidRequest(format!("no session for provider call {provider_call_id}"))
            })?;

        let _guard = self.session_locks.lock(&session_id).await;
        let mut session = self.load(session_id).await?;
        if session.recording_sid.is_some() {
            debug!(session_id=%session_id, recording=%recording.provider_recording_id, "recording already attached");
            return Ok(());
        }

        session.recording_sid = Some(recording.provider_recording_id.clone());
        session.recording_url = Some(recording.url.clone());
        self.store.update_session(&session).await?;
        self.event_log
            .append(
                session_id,
                CallEventType::RecordingStop,
                recording_payload(&recording),
                None,
            )
            .await?;

        if session.status == CallStatus::Completed {
            self.bus.publish(DomainEvent::RecordingAvailable {
                session_id,
                recording,
            });
        }
        Ok(())
    }

    /// Record a user action (hold, mute, transfer, recording toggles) against a live call.
    pub async fn append_event(
        &self,
        session_id: Uuid,
        event_type: CallEventType,
        payload: Value,
        acting_user_id: Option<Uuid>,
    ) -> Result<CallEvent, AppError> {
        if !USER_ACTIONS.contains(&event_type) {
            return Err(AppError::InvalidRequest(format!(
                "{event_type:?} events are recorded by the call lifecycle"
            )));
        }
        let _guard = self.session_locks.lock(&session_id).await;
        let session = self.load(session_id).await?;
        if session.status.is_terminal() {
            return Err(AppError::InvalidRequest(format!(
                "call session {session_id} has ended"
            )));
        }
        self.event_log
            .append(session_id, event_type, payload, acting_user_id)
            .await
    }

    /// Post-call wrap-up.
    pub async fn set_disposition(
        &self,
        session_id: Uuid,
        disposition: &str,
        notes: Option<String>,
    ) -> Result<CallSession, AppError> {
        if disposition.trim().is_empty() {
            return Err(AppError::InvalidRequest("disposition is empty".to_string()));
        }
        let _guard = self.session_locks.lock(&session_id).await;
        let mut session = self.load(session_id).await?;
        if !session.status.is_terminal() {
            return Err(AppError::InvalidRequest(format!(
                "call session {session_id} is still live"
            )));
        }
        session.disposition = Some(disposition.trim().to_string());
        if notes.is_some() {
            session.notes = notes;
        }
        self.store.update_session(&session).await?;
        Ok(session)
    }

    /// Hang up (or abandon, if still ringing) a live call at a user's request.
    pub async fn cancel(
        &self,
        session_id: Uuid,
        acting_user_id: Option<Uuid>,
    ) -> Result<CallSession, AppError> {
        let _guard = self.session_locks.lock(&session_id).await;
        let session = self.load(session_id).await?;
        if session.status == CallStatus::Cancelled {
            return Ok(session);
        }
        if session.status.is_terminal() {
            return Err(AppError::InvalidRequest(format!(
                "call session {session_id} already ended as {}",
                session.status
            )));
        }

        if let Some(provider_call_id) = &session.provider_call_id {
            let answered = session.status == CallStatus::Answered;
            let telephony = &self.telephony;
            let limit = self.provider_timeout;
            with_retry(self.retry, "hang up call", move || {
                bounded(limit, "hang up call", telephony.hangup(provider_call_id, answered))
            })
            .await?;
        }

        let details = TransitionDetails {
            disposition: Some("cancelled".to_string()),
            acting_user_id,
            ..Default::default()
        };
        self.transition(session, CallStatus::Cancelled, details).await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<CallSession, AppError> {
        self.load(session_id).await
    }

    pub async fn events(&self, session_id: Uuid) -> Result<Vec<CallEvent>, AppError> {
        self.load(session_id).await?;
        self.event_log.history(session_id).await
    }

    async fn load(&self, session_id: Uuid) -> Result<CallSession, AppError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or(AppError::SessionNotFound(session_id))
    }

    /// Webhooks can beat the provider call id into the store; the session id echoed on the
    /// callback URL covers that window.
    async fn resolve_session(
        &self,
        provider_call_id: &str,
        session_hint: Option<Uuid>,
    ) -> Result<Option<Uuid>, AppError> {
        if !provider_call_id.is_empty() {
            if let Some(session) = self.store.find_session_by_provider_id(provider_call_id).await? {
                return Ok(Some(session.id));
            }
        }
        match session_hint {
            Some(hint) => Ok(self.store.get_session(hint).await?.and_then(|s| {
                let matches = s
                    .provider_call_id
                    .as_deref()
                    .map_or(true, |known| known == provider_call_id);
                matches.then_some(s.id)
            })),
            None => Ok(None),
        }
    }

    /// Dial the session's rep into its conference. Without a rep leg the call carries on, but
    /// whisper has nobody to coach.
    async fn connect_agent(&self, session: &CallSession) -> Option<String> {
        let leg = AgentLeg {
            session_id: session.id,
            conference_name: conference_name(session.id),
            agent_id: session.user_id,
        };
        match bounded(
            self.provider_timeout,
            "connect rep",
            self.telephony.connect_agent(&leg),
        )
        .await
        {
            Ok(agent_call_id) => {
                debug!(session_id=%session.id, agent_call_id=%agent_call_id, "rep joined conference");
                Some(agent_call_id)
            }
            Err(e) => {
                warn!(error=%e, session_id=%session.id, agent_id=%session.user_id, "failed to connect rep");
                None
            }
        }
    }

    async fn create_session(
        &self,
        session: &CallSession,
        dial_payload: Value,
        acting_user_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        self.store.insert_session(session).await?;
        self.bus.publish(DomainEvent::SessionCreated {
            session: session.clone(),
        });
        self.event_log
            .append(session.id, CallEventType::Dial, dial_payload, acting_user_id)
            .await?;
        Ok(())
    }

    /// Move a session (whose lock the caller holds) into `to`, recording the side effects
    /// that belong to the new state.
    async fn transition(
        &self,
        mut session: CallSession,
        to: CallStatus,
        details: TransitionDetails,
    ) -> Result<CallSession, AppError> {
        let from = session.status;
        let now = OffsetDateTime::now_utc();

        if to == CallStatus::Answered && session.answered_at.is_none() {
            session.answered_at = Some(now);
        }
        if to == CallStatus::Answered && session.agent_call_id.is_none() {
            session.agent_call_id = self.connect_agent(&session).await;
        }
        if to.is_terminal() {
            session.ended_at = Some(now);
            session.duration_seconds = Some(details.duration_seconds.unwrap_or_else(|| {
                session
                    .answered_at
                    .map(|answered| (now - answered).whole_seconds().max(0) as i32)
                    .unwrap_or(0)
            }));
            if session.disposition.is_none() {
                session.disposition = details.disposition.clone();
            }
        }
        let mut new_recording = None;
        if let Some(recording) = &details.recording {
            if session.recording_sid.is_none() {
                session.recording_sid = Some(recording.provider_recording_id.clone());
                session.recording_url = Some(recording.url.clone());
                new_recording = Some(recording.clone());
            }
        }
        session.status = to;
        self.store.update_session(&session).await?;

        self.event_log
            .append(
                session.id,
                event_type_for(to),
                json!({
                    "from": from,
                    "to": to,
                    "provider_status": details.provider_status,
                    "disposition": session.disposition,
                    "duration_seconds": session.duration_seconds,
                }),
                details.acting_user_id,
            )
            .await?;
        if let Some(recording) = &new_recording {
            self.event_log
                .append(session.id, CallEventType::RecordingStop, recording_payload(recording), None)
                .await?;
        }
        info!(session_id=%session.id, from=%from, to=%to, "call session transitioned");
        self.bus.publish(DomainEvent::SessionStatusChanged {
            session_id: session.id,
            from,
            to,
        });

        if to.is_terminal() {
            if let Err(e) = self.supervision.release_for_terminated_session(session.id).await {
                error!(error=%e, session_id=%session.id, "failed to release supervision of ended call");
            }
            self.bus.publish(DomainEvent::CallEnded {
                session_id: session.id,
                status: to,
                disposition: session.disposition.clone(),
            });
        }
        if to == CallStatus::Completed {
            let recording = new_recording.or_else(|| stored_recording(&session));
            self.bus.publish(DomainEvent::CallCompleted {
                session_id: session.id,
                recording,
            });
        }
        Ok(session)
    }
}

fn recording_payload(recording: &RecordingRef) -> Value {
    json!({
        "recording_sid": recording.provider_recording_id,
        "url": recording.url,
        "duration_seconds": recording.duration_seconds,
    })
}

fn stored_recording(session: &CallSession) -> Option<RecordingRef> {
    match (&session.recording_sid, &session.recording_url) {
        (Some(sid), Some(url)) => Some(RecordingRef {
            provider_recording_id: sid.clone(),
            url: url.clone(),
            duration_seconds: None,
            size_bytes: None,
        }),
        _ => None,
    }
}
