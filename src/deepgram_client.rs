use crate::db_types::CallRecording;
use crate::deepgram_types::{ListenByUrl, PrerecordedResponse};
use crate::error::AppError;
use crate::providers::TranscriptionProvider;
use crate::types::Transcript;

use async_trait::async_trait;
use tracing::{debug, error};

const DEEPGRAM_LISTEN_URL: &str = "https://api.deepgram.com/v1/listen?punctuate=true";

pub struct DeepgramClient {
    http_client: reqwest::Client,
    api_key: String,
}

impl DeepgramClient {
    pub fn new(http_client: reqwest::Client, api_key: &str) -> Self {
        Self {
            http_client,
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl TranscriptionProvider for DeepgramClient {
    async fn transcribe(&self, recording: &CallRecording) -> Result<Transcript, AppError> {
        let resp = self
            .http_client
            .post(DEEPGRAM_LISTEN_URL)
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.api_key))
            .json(&ListenByUrl {
                url: &recording.url,
            })
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to Deepgram");
                AppError::from(e)
            })?;

        let status = resp.status();
        if status.is_client_error() {
            error!(status=%status, recording_id=%recording.id, "deepgram rejected recording");
            return Err(AppError::ProviderRejected(format!("deepgram returned {status}")));
        }
        if !status.is_success() {
            return Err(AppError::Provider(format!("deepgram returned {status}")));
        }

        let resp = resp.json::<PrerecordedResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize deepgram response");
            AppError::Provider("unreadable deepgram response".to_string())
        })?;
        let request_id = resp.metadata.as_ref().map(|m| m.request_id.as_str());
        debug!(recording_id=%recording.id, ?request_id, "deepgram transcription done");

        let best = resp.best_alternative().ok_or_else(|| {
            AppError::Provider("deepgram returned no transcript alternatives".to_string())
        })?;
        Ok(Transcript {
            text: best.transcript.trim().to_string(),
            confidence: f64::from(best.confidence).clamp(0.0, 1.0),
        })
    }
}
