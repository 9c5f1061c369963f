use crate::consts::ANALYSIS_SYSTEM_PROMPT;
use crate::error::AppError;
use crate::openai_types::{OpenAIBatchResponse, OpenAIMessage, OpenAIPayload, OpenAIResponseFormat};
use crate::providers::AnalysisProvider;
use crate::types::CallAnalysis;

use async_trait::async_trait;
use tracing::{debug, error};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Sentiment, keyword and quality scoring of a call transcript via chat completions.
pub struct OpenAiAnalyzer {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiAnalyzer {
    pub fn new(http_client: reqwest::Client, api_key: &str, model: &str) -> Self {
        Self {
            http_client,
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

/// Pull the analysis object out of the first choice.
fn parse_analysis(resp: &OpenAIBatchResponse) -> Result<CallAnalysis, AppError> {
    let content = &resp
        .choices
        .first()
        .ok_or_else(|| AppError::Provider("openai returned no choices".to_string()))?
        .message
        .content;
    let analysis = serde_json::from_str::<CallAnalysis>(content).map_err(|e| {
        error!(error=%e, content=%content, "failed to deserialize openai analysis");
        AppError::Provider("openai analysis was not valid json".to_string())
    })?;
    analysis.validate()?;
    Ok(analysis)
}

#[async_trait]
impl AnalysisProvider for OpenAiAnalyzer {
    async fn analyze(&self, transcription: &str) -> Result<CallAnalysis, AppError> {
        let payload = OpenAIPayload {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: ANALYSIS_SYSTEM_PROMPT.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: transcription.to_string(),
                },
            ],
            temperature: Some(0.0),
            response_format: Some(OpenAIResponseFormat::json_object()),
            ..Default::default()
        };
        let key = self.api_key.as_str();
        let resp = self
            .http_client
            .post(OPENAI_CHAT_URL)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to OpenAI");
                AppError::from(e)
            })?;

        let status = resp.status();
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            error!(status=%status, "openai rejected analysis request");
            return Err(AppError::ProviderRejected(format!("openai returned {status}")));
        }
        if !status.is_success() {
            return Err(AppError::Provider(format!("openai returned {status}")));
        }

        let resp = resp.json::<OpenAIBatchResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize openai analysis response");
            AppError::Provider("unreadable openai response".to_string())
        })?;
        debug!(id=%resp.id, model=%resp.model, usage=?resp.usage, "openai analysis done");
        parse_analysis(&resp)
    }
}
