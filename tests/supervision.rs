//! Listen, whisper and barge engagements on live calls.

mod common;

use call_orchestrator::bus::DomainEvent;
use call_orchestrator::db_types::{CallEventType, SupervisionType};
use call_orchestrator::error::AppError;
use common::harness;

use std::sync::atomic::Ordering;
use uuid::Uuid;

#[tokio::test]
async fn second_supervision_is_rejected_until_first_ends() {
    let h = harness();
    let (session_id, _) = h.answered_call().await;
    let manager = Uuid::new_v4();

    let whisper = h
        .state
        .supervision
        .start_supervision(session_id, manager, SupervisionType::Whisper)
        .await
        .unwrap();
    assert!(whisper.is_active());
    assert_eq!(h.telephony.bridge_count(), 1);
    let bridge = h.telephony.bridges.lock().unwrap()[0].clone();
    assert_eq!(bridge.mode, SupervisionType::Whisper);
    assert_eq!(bridge.conference_name, format!("session-{session_id}"));

    let err = h
        .state
        .supervision
        .start_supervision(session_id, Uuid::new_v4(), SupervisionType::Barge)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SupervisionInProgress(id) if id == session_id));
    assert_eq!(h.telephony.bridge_count(), 1);

    let ended = h.state.supervision.end_supervision(whisper.id).await.unwrap();
    assert!(ended.ended_at.is_some());
    assert_eq!(h.telephony.ended_bridges.lock().unwrap().len(), 1);

    let barge = h
        .state
        .supervision
        .start_supervision(session_id, manager, SupervisionType::Barge)
        .await
        .unwrap();
    assert_eq!(barge.supervision_type, SupervisionType::Barge);
}

#[tokio::test]
async fn concurrent_starts_yield_one_supervision() {
    let h = harness();
    let (session_id, _) = h.answered_call().await;

    let (a, b) = tokio::join!(
        h.state
            .supervision
            .start_supervision(session_id, Uuid::new_v4(), SupervisionType::Listen),
        h.state
            .supervision
            .start_supervision(session_id, Uuid::new_v4(), SupervisionType::Whisper)
    );
    assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(h.telephony.bridge_count(), 1);
}

#[tokio::test]
async fn unanswered_call_cannot_be_supervised() {
    let h = harness();
    let (session_id, provider_call_id) = h.place_call().await;
    h.push_status(&provider_call_id, "ringing").await;

    let err = h
        .state
        .supervision
        .start_supervision(session_id, Uuid::new_v4(), SupervisionType::Listen)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SessionNotAnswered(_)));
    assert!(h.state.store.active_supervision(session_id).await.unwrap().is_none());
    assert_eq!(h.telephony.bridge_count(), 0);

    assert!(matches!(
        h.state
            .supervision
            .start_supervision(Uuid::new_v4(), Uuid::new_v4(), SupervisionType::Listen)
            .await,
        Err(AppError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn bridge_failure_creates_no_record() {
    let h = harness();
    let (session_id, _) = h.answered_call().await;
    h.telephony.fail_bridge.store(true, Ordering::SeqCst);

    let err = h
        .state
        .supervision
        .start_supervision(session_id, Uuid::new_v4(), SupervisionType::Listen)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Provider(_)));
    assert!(h.state.store.active_supervision(session_id).await.unwrap().is_none());
}

#[tokio::test]
async fn call_end_forces_supervision_end() {
    let h = harness();
    let (session_id, provider_call_id) = h.answered_call().await;
    let supervisor = Uuid::new_v4();
    let listen = h
        .state
        .supervision
        .start_supervision(session_id, supervisor, SupervisionType::Listen)
        .await
        .unwrap();
    let mut rx = h.state.bus.subscribe();

    h.push_status(&provider_call_id, "completed").await;

    let ended = h.state.supervision.get(listen.id).await.unwrap();
    assert!(ended.ended_at.is_some());
    assert_eq!(
        h.telephony.ended_bridges.lock().unwrap().as_slice(),
        &[listen.provider_bridge_id.clone().unwrap()]
    );

    let events = h.state.calls.events(session_id).await.unwrap();
    let end = events
        .iter()
        .find(|e| e.event_type == CallEventType::SupervisionEnd)
        .unwrap();
    assert_eq!(end.payload.0["forced"], true);
    assert_eq!(end.acting_user_id, Some(supervisor));

    let mut saw_end = false;
    while let Ok(event) = rx.try_recv() {
        if let DomainEvent::SupervisionEnded { supervision } = event {
            assert_eq!(supervision.id, listen.id);
            saw_end = true;
        }
    }
    assert!(saw_end);

    // A late explicit end returns the already-ended record untouched.
    let again = h.state.supervision.end_supervision(listen.id).await.unwrap();
    assert_eq!(again.ended_at, ended.ended_at);
    assert_eq!(h.telephony.ended_bridges.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn notes_can_be_added_after_the_fact() {
    let h = harness();
    let (session_id, _) = h.answered_call().await;
    let barge = h
        .state
        .supervision
        .start_supervision(session_id, Uuid::new_v4(), SupervisionType::Barge)
        .await
        .unwrap();
    h.state.supervision.end_supervision(barge.id).await.unwrap();

    let noted = h
        .state
        .supervision
        .update_notes(barge.id, "rep handled the objection well")
        .await
        .unwrap();
    assert_eq!(noted.notes.as_deref(), Some("rep handled the objection well"));
    assert!(matches!(
        h.state.supervision.update_notes(Uuid::new_v4(), "x").await,
        Err(AppError::SupervisionNotFound(_))
    ));
}

#[tokio::test]
async fn supervision_events_land_in_call_log() {
    let h = harness();
    let (session_id, _) = h.answered_call().await;
    let s = h
        .state
        .supervision
        .start_supervision(session_id, Uuid::new_v4(), SupervisionType::Listen)
        .await
        .unwrap();
    h.state.supervision.end_supervision(s.id).await.unwrap();

    let events = h.state.calls.events(session_id).await.unwrap();
    let kinds: Vec<_> = events
        .iter()
        .map(|e| e.event_type)
        .filter(|t| matches!(t, CallEventType::SupervisionStart | CallEventType::SupervisionEnd))
        .collect();
    assert_eq!(kinds, vec![CallEventType::SupervisionStart, CallEventType::SupervisionEnd]);
}

#[tokio::test]
async fn whisper_coaches_the_rep_not_the_customer() {
    let h = harness();
    let (session_id, provider_call_id) = h.answered_call().await;
    let session = h.state.calls.get_session(session_id).await.unwrap();
    let rep_leg = session.agent_call_id.clone().unwrap();
    assert_ne!(rep_leg, provider_call_id);

    h.state
        .supervision
        .start_supervision(session_id, Uuid::new_v4(), SupervisionType::Whisper)
        .await
        .unwrap();
    let bridge = h.telephony.bridges.lock().unwrap()[0].clone();
    assert_eq!(bridge.coach_call_id.as_deref(), Some(rep_leg.as_str()));
}

#[tokio::test]
async fn whisper_needs_a_rep_leg() {
    let h = harness();
    h.telephony.fail_agent.store(true, Ordering::SeqCst);
    let (session_id, _) = h.answered_call().await;
    assert!(h
        .state
        .calls
        .get_session(session_id)
        .await
        .unwrap()
        .agent_call_id
        .is_none());

    let err = h
        .state
        .supervision
        .start_supervision(session_id, Uuid::new_v4(), SupervisionType::Whisper)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));
    assert_eq!(h.telephony.bridge_count(), 0);

    // Listening does not involve the rep's leg.
    let listen = h
        .state
        .supervision
        .start_supervision(session_id, Uuid::new_v4(), SupervisionType::Listen)
        .await
        .unwrap();
    assert_eq!(h.telephony.bridges.lock().unwrap()[0].coach_call_id, None);
    assert!(listen.is_active());
}
