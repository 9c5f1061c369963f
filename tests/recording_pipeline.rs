//! Recording ingestion, transcription and analysis.

mod common;

use call_orchestrator::bus::DomainEvent;
use call_orchestrator::db_types::CallStatus;
use call_orchestrator::error::AppError;
use call_orchestrator::tasks::route_domain_events;
use call_orchestrator::types::ProviderEvent;
use common::{eventually, flaky_harness, harness, recording_ref, sample_analysis, Harness};

use std::sync::atomic::Ordering;
use uuid::Uuid;

async fn completed_call(h: &Harness) -> Uuid {
    let (session_id, provider_call_id) = h.answered_call().await;
    h.push_status(&provider_call_id, "completed").await;
    session_id
}

#[tokio::test]
async fn recording_is_transcribed_analyzed_and_written_back() {
    let h = harness();
    let session_id = completed_call(&h).await;
    let mut rx = h.state.bus.subscribe();

    let recording = h
        .state
        .recordings
        .process(session_id, recording_ref("RE200"))
        .await
        .unwrap();
    assert_eq!(recording.transcription_confidence, Some(0.92));
    assert_eq!(recording.analysis.as_ref().map(|a| &a.0), Some(&sample_analysis()));

    let session = h.state.calls.get_session(session_id).await.unwrap();
    assert_eq!(session.transcription, recording.transcription);
    assert_eq!(session.sentiment_score, Some(0.6));
    assert_eq!(session.quality_score, Some(7.5));
    assert_eq!(session.status, CallStatus::Completed);

    let mut stages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            DomainEvent::RecordingIngested { .. } => stages.push("ingested"),
            DomainEvent::RecordingTranscribed { .. } => stages.push("transcribed"),
            DomainEvent::RecordingAnalyzed { .. } => stages.push("analyzed"),
            _ => {}
        }
    }
    assert_eq!(stages, vec!["ingested", "transcribed", "analyzed"]);
}

#[tokio::test]
async fn transcription_failure_skips_analysis_and_leaves_call_alone() {
    let h = harness();
    let session_id = completed_call(&h).await;
    h.transcriber.fail.store(true, Ordering::SeqCst);

    let recording = h
        .state
        .recordings
        .process(session_id, recording_ref("RE300"))
        .await
        .unwrap();
    assert!(recording.transcription_failed);
    assert!(recording.transcription.is_none());
    assert!(recording.analysis.is_none());
    // Retried up to the policy limit, never analyzed.
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 0);

    let session = h.state.calls.get_session(session_id).await.unwrap();
    assert_eq!(session.status, CallStatus::Completed);
    assert!(session.transcription.is_none());
    assert!(session.quality_score.is_none());

    // Provider recovers; resume picks up where the pipeline stopped.
    h.transcriber.fail.store(false, Ordering::SeqCst);
    let resumed = h.state.recordings.resume(recording.id).await.unwrap();
    assert!(!resumed.transcription_failed);
    assert!(resumed.analysis.is_some());
    assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn analysis_requires_a_transcription() {
    let h = harness();
    let session_id = completed_call(&h).await;
    h.transcriber.fail.store(true, Ordering::SeqCst);
    let recording = h
        .state
        .recordings
        .process(session_id, recording_ref("RE400"))
        .await
        .unwrap();

    assert!(h
        .state
        .store
        .set_analysis(recording.id, &sample_analysis())
        .await
        .is_err());
    let stored = h.state.recordings.get(recording.id).await.unwrap();
    assert!(stored.analysis.is_none());
}

#[tokio::test]
async fn duplicate_trigger_reuses_recording() {
    let h = harness();
    let session_id = completed_call(&h).await;

    let (a, b) = tokio::join!(
        h.state.recordings.process(session_id, recording_ref("RE500")),
        h.state.recordings.process(session_id, recording_ref("RE500"))
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.id, b.id);
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_recording_is_not_found() {
    let h = harness();
    assert!(matches!(
        h.state.recordings.resume(Uuid::new_v4()).await,
        Err(AppError::RecordingNotFound(_))
    ));
}

#[tokio::test]
async fn completed_call_with_recording_runs_pipeline() {
    let h = harness();
    tokio::spawn(route_domain_events(
        h.state.bus.subscribe(),
        h.state.dialer.clone(),
        h.state.recordings.clone(),
    ));
    let (session_id, provider_call_id) = h.answered_call().await;

    let completed = ProviderEvent {
        duration_seconds: Some(95),
        recording: Some(recording_ref("RE600")),
        ..common::status_callback(&provider_call_id, "completed")
    };
    h.state.calls.apply_provider_event(completed).await.unwrap();

    let calls = h.state.calls.clone();
    let session = eventually(|| {
        let calls = calls.clone();
        async move {
            calls
                .get_session(session_id)
                .await
                .ok()
                .filter(|s| s.quality_score.is_some())
        }
    })
    .await;
    assert_eq!(session.quality_score, Some(7.5));
    assert_eq!(session.recording_sid.as_deref(), Some("RE600"));
}

#[tokio::test]
async fn late_recording_callback_runs_pipeline() {
    let h = harness();
    tokio::spawn(route_domain_events(
        h.state.bus.subscribe(),
        h.state.dialer.clone(),
        h.state.recordings.clone(),
    ));
    let (session_id, provider_call_id) = h.answered_call().await;
    h.push_status(&provider_call_id, "completed").await;

    h.state
        .calls
        .attach_recording(&provider_call_id, None, recording_ref("RE700"))
        .await
        .unwrap();
    // A repeat of the callback keeps the first reference.
    h.state
        .calls
        .attach_recording(&provider_call_id, None, recording_ref("RE701"))
        .await
        .unwrap();

    let calls = h.state.calls.clone();
    let session = eventually(|| {
        let calls = calls.clone();
        async move {
            calls
                .get_session(session_id)
                .await
                .ok()
                .filter(|s| s.transcription.is_some())
        }
    })
    .await;
    assert_eq!(session.recording_sid.as_deref(), Some("RE700"));
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wrap_up_during_pipeline_keeps_scores() {
    let (h, store) = flaky_harness();
    let session_id = completed_call(&h).await;

    // The wrap-up reads the session, then stalls while the pipeline runs to completion.
    store.stall_next_session_read.store(true, Ordering::SeqCst);
    let (wrap_up, recording) = tokio::join!(
        h.state
            .calls
            .set_disposition(session_id, "resolved", Some("sent pricing".into())),
        h.state.recordings.process(session_id, recording_ref("RE800"))
    );
    wrap_up.unwrap();
    let recording = recording.unwrap();

    let session = h.state.calls.get_session(session_id).await.unwrap();
    assert_eq!(session.disposition.as_deref(), Some("resolved"));
    assert_eq!(session.notes.as_deref(), Some("sent pricing"));
    assert_eq!(session.transcription, recording.transcription);
    assert_eq!(session.sentiment_score, Some(0.6));
    assert_eq!(session.quality_score, Some(7.5));
}

#[tokio::test]
async fn ingest_failure_is_published_and_leaves_call_alone() {
    let (h, store) = flaky_harness();
    let session_id = completed_call(&h).await;
    let before = h.state.calls.get_session(session_id).await.unwrap();
    store.fail_recording_ingest.store(true, Ordering::SeqCst);
    let mut rx = h.state.bus.subscribe();

    let err = h
        .state
        .recordings
        .process(session_id, recording_ref("RE900"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Store(_)));
    // Retried up to the policy limit.
    assert_eq!(store.ingest_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 0);

    let mut failed = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            DomainEvent::RecordingIngestionFailed {
                session_id: id,
                provider_recording_id,
                ..
            } => failed = Some((id, provider_recording_id)),
            DomainEvent::RecordingIngested { .. } => panic!("ingest reported success"),
            _ => {}
        }
    }
    assert_eq!(failed, Some((session_id, "RE900".to_string())));

    let after = h.state.calls.get_session(session_id).await.unwrap();
    assert_eq!(after, before);
}
