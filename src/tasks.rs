use crate::bus::{DomainEvent, EventBus};
use crate::dialer::DialerScheduler;
use crate::error::handle_error;
use crate::recording_pipeline::RecordingPipeline;
use crate::types::RecordingRef;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Task that turns domain events into follow-up work: call outcomes feed the dialer's retry
/// policy, finished recordings go through the pipeline.
pub async fn route_domain_events(
    mut events: mpsc::UnboundedReceiver<DomainEvent>,
    dialer: Arc<DialerScheduler>,
    recordings: Arc<RecordingPipeline>,
) {
    while let Some(event) = events.recv().await {
        match event {
            DomainEvent::CallEnded {
                session_id, status, ..
            } => {
                if let Err(e) = dialer.record_outcome(session_id, status).await {
                    handle_error(e).await;
                }
            }
            DomainEvent::CallCompleted {
                session_id,
                recording: Some(recording),
            }
            | DomainEvent::RecordingAvailable {
                session_id,
                recording,
            } => spawn_pipeline(recordings.clone(), session_id, recording),
            _ => {}
        }
    }
    info!("domain event stream closed");
}

/// Each recording runs on its own task so one slow provider call never holds up the rest.
fn spawn_pipeline(recordings: Arc<RecordingPipeline>, session_id: Uuid, recording: RecordingRef) {
    tokio::spawn(async move {
        if let Err(e) = recordings.process(session_id, recording).await {
            handle_error(e).await;
        }
    });
}

/// Task that forwards domain events to a UI websocket until either side goes away.
/// With `session_filter` set, only that session's events are sent.
pub async fn forward_events_to_socket(
    socket: WebSocket,
    bus: EventBus,
    session_filter: Option<Uuid>,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let mut events = bus.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if session_filter.is_some() && event.session_id() != session_filter {
                    continue;
                }
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error=%e, "failed to serialize domain event");
                        continue;
                    }
                };
                if let Err(e) = ws_sink.send(Message::Text(json)).await {
                    debug!(error=%e, "event subscriber went away");
                    break;
                }
            }
            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

