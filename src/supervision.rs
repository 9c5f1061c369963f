use crate::bus::{DomainEvent, EventBus};
use crate::db_types::{CallEventType, CallStatus, CallSupervision, SupervisionType};
use crate::error::AppError;
use crate::event_log::CallEventLog;
use crate::providers::TelephonyProvider;
use crate::store::CallStore;
use crate::types::SupervisionBridge;
use crate::utils::{bounded, conference_name, KeyedLocks};

use serde_json::json;
use sqlx::types::time::OffsetDateTime;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Arbitrates listen/whisper/barge engagements, one at a time per session.
///
/// Shares the per-session lock map with the state machine, so a supervision can never start
/// on a session that is concurrently reaching a terminal state.
pub struct SupervisionCoordinator {
    store: Arc<dyn CallStore>,
    telephony: Arc<dyn TelephonyProvider>,
    event_log: CallEventLog,
    bus: EventBus,
    session_locks: Arc<KeyedLocks<Uuid>>,
    provider_timeout: Duration,
}

impl SupervisionCoordinator {
    pub fn new(
        store: Arc<dyn CallStore>,
        telephony: Arc<dyn TelephonyProvider>,
        event_log: CallEventLog,
        bus: EventBus,
        session_locks: Arc<KeyedLocks<Uuid>>,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            store,
            telephony,
            event_log,
            bus,
            session_locks,
            provider_timeout,
        }
    }

    pub async fn start_supervision(
        &self,
        session_id: Uuid,
        supervisor_id: Uuid,
        mode: SupervisionType,
    ) -> Result<CallSupervision, AppError> {
        let _guard = self.session_locks.lock(&session_id).await;

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(AppError::SessionNotFound(session_id))?;
        if session.status != CallStatus::Answered {
            return Err(AppError::SessionNotAnswered(session_id));
        }
        if self.store.active_supervision(session_id).await?.is_some() {
            return Err(AppError::SupervisionInProgress(session_id));
        }
        if session.provider_call_id.is_none() {
            return Err(AppError::SessionNotAnswered(session_id));
        }
        let coach_call_id = match mode {
            SupervisionType::Whisper => Some(session.agent_call_id.ok_or_else(|| {
                AppError::InvalidRequest(format!(
                    "call session {session_id} has no rep leg to coach"
                ))
            })?),
            SupervisionType::Listen | SupervisionType::Barge => None,
        };

        let bridge = SupervisionBridge {
            session_id,
            conference_name: conference_name(session_id),
            supervisor_id,
            mode,
            coach_call_id,
        };
        let provider_bridge_id = bounded(
            self.provider_timeout,
            "supervision bridge",
            self.telephony.bridge_supervisor(&bridge),
        )
        .await?;

        let supervision = CallSupervision {
            id: Uuid::new_v4(),
            session_id,
            supervisor_id,
            supervision_type: mode,
            provider_bridge_id: Some(provider_bridge_id.clone()),
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
            notes: None,
        };
        if let Err(e) = self.store.insert_supervision(&supervision).await {
            // The leg is already up; take it down so it is not left without a record.
            self.teardown(&provider_bridge_id).await;
            return Err(e);
        }

        self.event_log
            .append(
                session_id,
                CallEventType::SupervisionStart,
                json!({ "supervision_id": supervision.id, "type": mode }),
                Some(supervisor_id),
            )
            .await?;
        info!(session_id=%session_id, supervisor_id=%supervisor_id, mode=?mode, "supervision started");
        self.bus.publish(DomainEvent::SupervisionStarted {
            supervision: supervision.clone(),
        });
        Ok(supervision)
    }

    /// Ending an already-ended supervision returns it unchanged.
    pub async fn end_supervision(&self, supervision_id: Uuid) -> Result<CallSupervision, AppError> {
        let supervision = self.find(supervision_id).await?;
        if !supervision.is_active() {
            return Ok(supervision);
        }
        let _guard = self.session_locks.lock(&supervision.session_id).await;
        self.end_locked(supervision, false).await
    }

    /// Ends whatever supervision is still active on a session that just reached a terminal
    /// state. The caller holds the session lock.
    pub(crate) async fn release_for_terminated_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<CallSupervision>, AppError> {
        match self.store.active_supervision(session_id).await? {
            Some(supervision) => self.end_locked(supervision, true).await.map(Some),
            None => Ok(None),
        }
    }

    /// Notes stay editable after the supervision has ended.
    pub async fn update_notes(
        &self,
        supervision_id: Uuid,
        notes: &str,
    ) -> Result<CallSupervision, AppError> {
        self.store
            .update_supervision_notes(supervision_id, notes)
            .await?
            .ok_or(AppError::SupervisionNotFound(supervision_id))
    }

    pub async fn get(&self, supervision_id: Uuid) -> Result<CallSupervision, AppError> {
        self.find(supervision_id).await
    }

    async fn find(&self, supervision_id: Uuid) -> Result<CallSupervision, AppError> {
        self.store
            .get_supervision(supervision_id)
            .await?
            .ok_or(AppError::SupervisionNotFound(supervision_id))
    }

    async fn end_locked(
        &self,
        supervision: CallSupervision,
        forced: bool,
    ) -> Result<CallSupervision, AppError> {
        let ended = match self
            .store
            .end_supervision(supervision.id, OffsetDateTime::now_utc())
            .await?
        {
            Some(ended) => ended,
            // Lost a race with another ender; report the row as it now stands.
            None => return self.find(supervision.id).await,
        };

        self.event_log
            .append(
                ended.session_id,
                CallEventType::SupervisionEnd,
                json!({ "supervision_id": ended.id, "forced": forced }),
                Some(ended.supervisor_id),
            )
            .await?;
        info!(session_id=%ended.session_id, supervision_id=%ended.id, forced, "supervision ended");
        self.bus.publish(DomainEvent::SupervisionEnded {
            supervision: ended.clone(),
        });

        if let Some(bridge_id) = &ended.provider_bridge_id {
            self.teardown(bridge_id).await;
        }
        Ok(ended)
    }

    async fn teardown(&self, provider_bridge_id: &str) {
        let res = bounded(
            self.provider_timeout,
            "supervision teardown",
            self.telephony.end_bridge(provider_bridge_id),
        )
        .await;
        if let Err(e) = res {
            // The carrier drops the leg with the conference anyway.
            warn!(error=%e, bridge=%provider_bridge_id, "failed to tear down supervisor leg");
        }
    }
}
