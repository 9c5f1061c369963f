use crate::db_types::{
    CallEvent, CallSession, CallStatus, CallSupervision, CampaignStatus, DialerQueueItem,
};
use crate::types::RecordingRef;

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

/// Facts published by the state machine, scheduler, coordinator and recording pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    SessionCreated {
        session: CallSession,
    },
    SessionStatusChanged {
        session_id: Uuid,
        from: CallStatus,
        to: CallStatus,
    },
    CallEventAppended {
        event: CallEvent,
    },
    /// Any terminal transition.
    CallEnded {
        session_id: Uuid,
        status: CallStatus,
        disposition: Option<String>,
    },
    CallCompleted {
        session_id: Uuid,
        recording: Option<RecordingRef>,
    },
    /// A recording reference arrived after the session had already completed.
    RecordingAvailable {
        session_id: Uuid,
        recording: RecordingRef,
    },
    CampaignStatusChanged {
        campaign_id: Uuid,
        status: CampaignStatus,
    },
    QueueItemUpdated {
        item: DialerQueueItem,
    },
    SupervisionStarted {
        supervision: CallSupervision,
    },
    SupervisionEnded {
        supervision: CallSupervision,
    },
    RecordingIngested {
        session_id: Uuid,
        recording_id: Uuid,
    },
    RecordingIngestionFailed {
        session_id: Uuid,
        provider_recording_id: String,
        reason: String,
    },
    RecordingTranscribed {
        session_id: Uuid,
        recording_id: Uuid,
    },
    RecordingTranscriptionFailed {
        session_id: Uuid,
        recording_id: Uuid,
        reason: String,
    },
    RecordingAnalyzed {
        session_id: Uuid,
        recording_id: Uuid,
    },
    RecordingAnalysisFailed {
        session_id: Uuid,
        recording_id: Uuid,
        reason: String,
    },
}

impl DomainEvent {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            DomainEvent::SessionCreated { session } => Some(session.id),
            DomainEvent::CallEventAppended { event } => Some(event.session_id),
            DomainEvent::SupervisionStarted { supervision }
            | DomainEvent::SupervisionEnded { supervision } => Some(supervision.session_id),
            DomainEvent::QueueItemUpdated { item } => item.session_id,
            DomainEvent::CampaignStatusChanged { .. } => None,
            DomainEvent::SessionStatusChanged { session_id, .. }
            | DomainEvent::CallEnded { session_id, .. }
            | DomainEvent::CallCompleted { session_id, .. }
            | DomainEvent::RecordingAvailable { session_id, .. }
            | DomainEvent::RecordingIngested { session_id, .. }
            | DomainEvent::RecordingIngestionFailed { session_id, .. }
            | DomainEvent::RecordingTranscribed { session_id, .. }
            | DomainEvent::RecordingTranscriptionFailed { session_id, .. }
            | DomainEvent::RecordingAnalyzed { session_id, .. }
            | DomainEvent::RecordingAnalysisFailed { session_id, .. } => Some(*session_id),
        }
    }
}

/// Fan-out of domain events. Every subscriber gets every event published after it subscribed,
/// in publish order; a slow subscriber buffers rather than drops.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<DomainEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DomainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        rx
    }

    pub fn publish(&self, event: DomainEvent) {
        trace!(event=?event, "publishing domain event");
        // Sending under the lock keeps a single global order across publishers.
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_change(session_id: Uuid, to: CallStatus) -> DomainEvent {
        DomainEvent::SessionStatusChanged {
            session_id,
            from: CallStatus::Initiated,
            to,
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_events_in_order() {
        let bus = EventBus::new();
        let mut ui = bus.subscribe();
        let mut notifier = bus.subscribe();
        let session = Uuid::new_v4();

        bus.publish(status_change(session, CallStatus::Ringing));
        bus.publish(status_change(session, CallStatus::Answered));

        for rx in [&mut ui, &mut notifier] {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            assert!(matches!(first, DomainEvent::SessionStatusChanged { to: CallStatus::Ringing, .. }));
            assert!(matches!(second, DomainEvent::SessionStatusChanged { to: CallStatus::Answered, .. }));
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        drop(rx);
        bus.publish(status_change(Uuid::new_v4(), CallStatus::Ringing));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(DomainEvent::CallEnded {
            session_id: id,
            status: CallStatus::Failed,
            disposition: Some("busy".to_string()),
        })
        .unwrap();
        assert_eq!(json["type"], "call_ended");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["disposition"], "busy");
    }
}
