use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GeminiConfig;
use crate::connectors::{
    http_client, retry_after, with_retry, ConnectorError, LlmClient, RetryPolicy,
};
use crate::extract::PromptPayload;

const SERVICE: &str = "gemini";

// Request/response shapes of `models/{model}:generateContent`, reduced to the
// text-only subset used here.

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, text: &str) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: Some(text.to_string()),
            }],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    response_mime_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    system_instruction: Content,
    generation_config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Content,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    prompt_feedback: Option<PromptFeedback>,
}

pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
    retry: RetryPolicy,
}

impl GeminiClient {
    pub fn new(
        config: GeminiConfig,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            client: http_client(SERVICE, timeout)?,
            config,
            retry,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        let model = self.config.model.trim_start_matches("models/");
        format!(
            "{}/models/{model}:generateContent",
            self.config.api_base.trim_end_matches('/')
        )
    }

    async fn generate_once(&self, request: &GenerateContentRequest) -> Result<String, ConnectorError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(|source| ConnectorError::transport(SERVICE, source))?;

        let status = response.status();
        let wait = retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|source| ConnectorError::transport(SERVICE, source))?;

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            || (status == StatusCode::BAD_REQUEST && body.contains("API_KEY_INVALID"))
        {
            return Err(ConnectorError::credentials_rejected(SERVICE, status, &body));
        }
        if !status.is_success() {
            return Err(ConnectorError::from_status(SERVICE, status, &body, wait));
        }

        let parsed: GenerateContentResponse =
            serde_json::from_str(&body).map_err(|e| ConnectorError::decode(SERVICE, e))?;
        response_text(parsed)
    }
}

/// Concatenated text of the first candidate that has any.
fn response_text(response: GenerateContentResponse) -> Result<String, ConnectorError> {
    let mut finish_reason = None;
    for candidate in response.candidates.unwrap_or_default() {
        let text: String = candidate
            .content
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect();
        if !text.trim().is_empty() {
            return Ok(text);
        }
        finish_reason = finish_reason.or(candidate.finish_reason);
    }

    let reason = response
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason)
        .map(|reason| format!("prompt blocked: {reason}"))
        .or_else(|| finish_reason.map(|reason| format!("finish reason {reason}")))
        .unwrap_or_else(|| "no candidates".to_string());
    Err(ConnectorError::decode(SERVICE, format!("empty response ({reason})")))
}

#[async_trait(?Send)]
impl LlmClient for GeminiClient {
    async fn generate(&self, payload: &PromptPayload) -> Result<String, ConnectorError> {
        let request = GenerateContentRequest {
            contents: vec![Content::text(Some("user"), &payload.user_prompt)],
            system_instruction: Content::text(None, &payload.system_instruction),
            generation_config: GenerationConfig {
                temperature: 0.0,
                response_mime_type: "application/json",
            },
        };

        debug!(model = %self.config.model, prompt_chars = payload.user_prompt.len(), "calling gemini");
        with_retry(&self.retry, "gemini generateContent", || self.generate_once(&request)).await
    }
}
