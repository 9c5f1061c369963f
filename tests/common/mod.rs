//! Shared fixtures: scripted providers around an in-memory store.

#![allow(dead_code)]

use call_orchestrator::config::OrchestratorSettings;
use call_orchestrator::db_types::{
    CallEvent, CallRecording, CallSession, CallStatus, CallSupervision, CampaignStatus,
    DialerCampaign, DialerQueueItem, NewCallEvent, QueueItemStatus,
};
use call_orchestrator::error::AppError;
use call_orchestrator::memory_store::MemoryStore;
use call_orchestrator::providers::{AnalysisProvider, TelephonyProvider, TranscriptionProvider};
use call_orchestrator::store::CallStore;
use call_orchestrator::types::{
    AgentLeg, AppState, CallAnalysis, OriginateRequest, ProviderEvent, QualityScores,
    RecordingRef, Sentiment, SentimentLabel, SupervisionBridge, Transcript,
};
use call_orchestrator::utils::RetryPolicy;

use async_trait::async_trait;
use sqlx::types::time::OffsetDateTime;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
pub struct FakeTelephony {
    pub fail_originate: AtomicBool,
    pub fail_bridge: AtomicBool,
    pub fail_agent: AtomicBool,
    originated: AtomicU32,
    pub agent_legs: Mutex<Vec<AgentLeg>>,
    pub hangups: Mutex<Vec<(String, bool)>>,
    pub bridges: Mutex<Vec<SupervisionBridge>>,
    pub ended_bridges: Mutex<Vec<String>>,
}

impl FakeTelephony {
    pub fn bridge_count(&self) -> usize {
        self.bridges.lock().unwrap().len()
    }
}

#[async_trait]
impl TelephonyProvider for FakeTelephony {
    async fn originate(&self, _request: &OriginateRequest) -> Result<String, AppError> {
        if self.fail_originate.load(Ordering::SeqCst) {
            return Err(AppError::ProviderRejected("21211 invalid 'To' number".into()));
        }
        let n = self.originated.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("CA{n:032}"))
    }

    async fn connect_agent(&self, leg: &AgentLeg) -> Result<String, AppError> {
        if self.fail_agent.load(Ordering::SeqCst) {
            return Err(AppError::Provider("rep client offline".into()));
        }
        let mut legs = self.agent_legs.lock().unwrap();
        legs.push(leg.clone());
        Ok(format!("CA-rep-{}", legs.len()))
    }

    async fn bridge_supervisor(&self, bridge: &SupervisionBridge) -> Result<String, AppError> {
        if self.fail_bridge.load(Ordering::SeqCst) {
            return Err(AppError::Provider("conference unavailable".into()));
        }
        let mut bridges = self.bridges.lock().unwrap();
        bridges.push(bridge.clone());
        Ok(format!("CA-sup-{}", bridges.len()))
    }

    async fn end_bridge(&self, provider_bridge_id: &str) -> Result<(), AppError> {
        self.ended_bridges
            .lock()
            .unwrap()
            .push(provider_bridge_id.to_string());
        Ok(())
    }

    async fn hangup(&self, provider_call_id: &str, answered: bool) -> Result<(), AppError> {
        self.hangups
            .lock()
            .unwrap()
            .push((provider_call_id.to_string(), answered));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTranscriber {
    pub fail: AtomicBool,
    pub calls: AtomicU32,
}

#[async_trait]
impl TranscriptionProvider for FakeTranscriber {
    async fn transcribe(&self, recording: &CallRecording) -> Result<Transcript, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Provider("deepgram returned 503".into()));
        }
        Ok(Transcript {
            text: format!("Hi, this is a follow-up about {}.", recording.provider_recording_id),
            confidence: 0.92,
        })
    }
}

#[derive(Default)]
pub struct FakeAnalyzer {
    pub calls: AtomicU32,
}

#[async_trait]
impl AnalysisProvider for FakeAnalyzer {
    async fn analyze(&self, _transcription: &str) -> Result<CallAnalysis, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(sample_analysis())
    }
}

pub fn sample_analysis() -> CallAnalysis {
    CallAnalysis {
        sentiment: Sentiment {
            label: SentimentLabel::Positive,
            score: 0.6,
        },
        keywords: vec!["renewal".to_string(), "pricing".to_string()],
        quality: QualityScores {
            clarity: 8.0,
            professionalism: 9.0,
            resolution: 6.0,
            overall: 7.5,
        },
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub telephony: Arc<FakeTelephony>,
    pub transcriber: Arc<FakeTranscriber>,
    pub analyzer: Arc<FakeAnalyzer>,
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        caller_id: "+15550001111".to_string(),
        dispatch_interval: Duration::from_millis(20),
        provider_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        },
        inbound_user_id: Uuid::new_v4(),
        inbound_company_id: Uuid::new_v4(),
    }
}

pub fn harness() -> Harness {
    harness_with_store(Arc::new(MemoryStore::new()))
}

/// A harness over a [`FlakyStore`], returned alongside so tests can inject faults.
pub fn flaky_harness() -> (Harness, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    (harness_with_store(store.clone()), store)
}

pub fn harness_with_store(store: Arc<dyn CallStore>) -> Harness {
    let telephony = Arc::new(FakeTelephony::default());
    let transcriber = Arc::new(FakeTranscriber::default());
    let analyzer = Arc::new(FakeAnalyzer::default());
    let state = Arc::new(AppState::new(
        settings(),
        store,
        telephony.clone(),
        transcriber.clone(),
        analyzer.clone(),
    ));
    Harness {
        state,
        telephony,
        transcriber,
        analyzer,
    }
}

pub fn status_callback(provider_call_id: &str, raw_status: &str) -> ProviderEvent {
    ProviderEvent {
        provider_call_id: provider_call_id.to_string(),
        raw_status: raw_status.to_string(),
        ..Default::default()
    }
}

pub fn recording_ref(sid: &str) -> RecordingRef {
    RecordingRef {
        provider_recording_id: sid.to_string(),
        url: format!("https://api.twilio.com/recordings/{sid}"),
        duration_seconds: Some(42),
        size_bytes: None,
    }
}

impl Harness {
    /// Places an outbound call and returns its session id and provider call id.
    pub async fn place_call(&self) -> (Uuid, String) {
        let request = OriginateRequest::outbound(
            "+15550001111",
            "+15557654321",
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
        );
        let session_id = self.state.calls.originate(request).await.unwrap();
        let session = self.state.calls.get_session(session_id).await.unwrap();
        (session_id, session.provider_call_id.unwrap())
    }

    pub async fn push_status(&self, provider_call_id: &str, raw_status: &str) -> Option<CallStatus> {
        self.state
            .calls
            .apply_provider_event(status_callback(provider_call_id, raw_status))
            .await
            .unwrap()
    }

    pub async fn answered_call(&self) -> (Uuid, String) {
        let (session_id, provider_call_id) = self.place_call().await;
        self.push_status(&provider_call_id, "ringing").await;
        self.push_status(&provider_call_id, "in-progress").await;
        (session_id, provider_call_id)
    }
}

/// Polls `check` until it yields a value or two seconds pass.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(v) = check().await {
            return v;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// `MemoryStore` with switchable faults on the calls the error-path tests care about.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    /// Number of upcoming `find_calling_item` calls that fail.
    pub failing_calling_lookups: AtomicU32,
    pub fail_recording_ingest: AtomicBool,
    pub ingest_attempts: AtomicU32,
    /// `next_eligible_item` fails for this campaign.
    pub broken_campaign: Mutex<Option<Uuid>>,
    /// The next `get_session` stalls before reading.
    pub stall_next_session_read: AtomicBool,
}

fn outage() -> AppError {
    AppError::Store("connection reset by peer".into())
}

#[async_trait]
impl CallStore for FlakyStore {
    async fn insert_session(&self, session: &CallSession) -> Result<(), AppError> {
        self.inner.insert_session(session).await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<CallSession>, AppError> {
        let read = self.inner.get_session(id).await;
        if self.stall_next_session_read.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        read
    }

    async fn find_session_by_provider_id(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallSession>, AppError> {
        self.inner.find_session_by_provider_id(provider_call_id).await
    }

    async fn update_session(&self, session: &CallSession) -> Result<(), AppError> {
        self.inner.update_session(session).await
    }

    async fn record_session_analysis(
        &self,
        session_id: Uuid,
        transcription: &str,
        sentiment_score: f64,
        quality_score: f64,
    ) -> Result<(), AppError> {
        self.inner
            .record_session_analysis(session_id, transcription, sentiment_score, quality_score)
            .await
    }

    async fn append_event(&self, event: NewCallEvent) -> Result<CallEvent, AppError> {
        self.inner.append_event(event).await
    }

    async fn list_events(&self, session_id: Uuid) -> Result<Vec<CallEvent>, AppError> {
        self.inner.list_events(session_id).await
    }

    async fn insert_campaign(&self, campaign: &DialerCampaign) -> Result<(), AppError> {
        self.inner.insert_campaign(campaign).await
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<DialerCampaign>, AppError> {
        self.inner.get_campaign(id).await
    }

    async fn set_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<Option<DialerCampaign>, AppError> {
        self.inner.set_campaign_status(id, status).await
    }

    async fn list_campaigns(&self, status: CampaignStatus) -> Result<Vec<DialerCampaign>, AppError> {
        self.inner.list_campaigns(status).await
    }

    async fn insert_queue_item(&self, item: &DialerQueueItem) -> Result<(), AppError> {
        self.inner.insert_queue_item(item).await
    }

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        self.inner.get_queue_item(id).await
    }

    async fn next_eligible_item(
        &self,
        campaign_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        if *self.broken_campaign.lock().unwrap() == Some(campaign_id) {
            return Err(outage());
        }
        self.inner.next_eligible_item(campaign_id, now).await
    }

    async fn claim_queue_item(
        &self,
        item_id: Uuid,
        session_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        self.inner.claim_queue_item(item_id, session_id, now).await
    }

    async fn list_calling_items(&self) -> Result<Vec<DialerQueueItem>, AppError> {
        self.inner.list_calling_items().await
    }

    async fn find_calling_item(&self, session_id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        let failing = self.failing_calling_lookups.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if failing.is_ok() {
            return Err(outage());
        }
        self.inner.find_calling_item(session_id).await
    }

    async fn finish_attempt(
        &self,
        item_id: Uuid,
        session_id: Uuid,
        status: QueueItemStatus,
        next_attempt_at: Option<OffsetDateTime>,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        self.inner
            .finish_attempt(item_id, session_id, status, next_attempt_at)
            .await
    }

    async fn skip_queue_item(&self, item_id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        self.inner.skip_queue_item(item_id).await
    }

    async fn insert_supervision(&self, supervision: &CallSupervision) -> Result<(), AppError> {
        self.inner.insert_supervision(supervision).await
    }

    async fn get_supervision(&self, id: Uuid) -> Result<Option<CallSupervision>, AppError> {
        self.inner.get_supervision(id).await
    }

    async fn active_supervision(&self, session_id: Uuid) -> Result<Option<CallSupervision>, AppError> {
        self.inner.active_supervision(session_id).await
    }

    async fn end_supervision(
        &self,
        id: Uuid,
        ended_at: OffsetDateTime,
    ) -> Result<Option<CallSupervision>, AppError> {
        self.inner.end_supervision(id, ended_at).await
    }

    async fn update_supervision_notes(
        &self,
        id: Uuid,
        notes: &str,
    ) -> Result<Option<CallSupervision>, AppError> {
        self.inner.update_supervision_notes(id, notes).await
    }

    async fn upsert_recording(&self, recording: &CallRecording) -> Result<CallRecording, AppError> {
        self.ingest_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_recording_ingest.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.upsert_recording(recording).await
    }

    async fn get_recording(&self, id: Uuid) -> Result<Option<CallRecording>, AppError> {
        self.inner.get_recording(id).await
    }

    async fn set_transcription(&self, id: Uuid, transcript: &Transcript) -> Result<(), AppError> {
        self.inner.set_transcription(id, transcript).await
    }

    async fn mark_transcription_failed(&self, id: Uuid) -> Result<(), AppError> {
        self.inner.mark_transcription_failed(id).await
    }

    async fn set_analysis(&self, id: Uuid, analysis: &CallAnalysis) -> Result<(), AppError> {
        self.inner.set_analysis(id, analysis).await
    }

    async fn mark_analysis_failed(&self, id: Uuid) -> Result<(), AppError> {
        self.inner.mark_analysis_failed(id).await
    }
}
