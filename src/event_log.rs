use crate::bus::{DomainEvent, EventBus};
use crate::db_types::{CallEvent, CallEventType, NewCallEvent};
use crate::error::AppError;
use crate::store::CallStore;

use serde_json::Value;
use sqlx::types::time::OffsetDateTime;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Append-only history of a session. Appends never touch earlier entries, so concurrent
/// appenders need no coordination beyond the store's insertion sequence.
#[derive(Clone)]
pub struct CallEventLog {
    store: Arc<dyn CallStore>,
    bus: EventBus,
}

impl CallEventLog {
    pub fn new(store: Arc<dyn CallStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub async fn append(
        &self,
        session_id: Uuid,
        event_type: CallEventType,
        payload: Value,
        acting_user_id: Option<Uuid>,
    ) -> Result<CallEvent, AppError> {
        let event = self
            .store
            .append_event(NewCallEvent {
                session_id,
                event_type,
                payload,
                acting_user_id,
                occurred_at: OffsetDateTime::now_utc(),
            })
            .await?;
        debug!(session_id=%session_id, event_type=?event_type, seq=event.seq, "call event appended");
        self.bus.publish(DomainEvent::CallEventAppended {
            event: event.clone(),
        });
        Ok(event)
    }

    pub async fn history(&self, session_id: Uuid) -> Result<Vec<CallEvent>, AppError> {
        self.store.list_events(session_id).await
    }
}
