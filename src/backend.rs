//! Generative backend abstraction.
//!
//! The pipeline treats the backend as an opaque, possibly slow, possibly
//! non-deterministic collaborator: request = {prompt, context}, response =
//! {content, token usage, model} or a classified error. An OpenAI-compatible
//! HTTP client is provided; anything implementing [`GenerativeBackend`] can
//! stand in (tests use scripted backends).

use crate::error::PipelineError;
use crate::section::TokenUsage;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const BACKEND_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BACKEND_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Full prompt text assembled by the content generator.
    pub prompt: String,
    /// Structured section context shipped alongside the prompt.
    pub context: Value,
}

/// Raw backend reply before candidate normalization.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<BackendResponse, PipelineError>;

    fn backend_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

/// Connection settings for the HTTP backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// OpenAI-compatible endpoint base, e.g. `https://api.example.com/v1`.
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1".to_string(),
            model: "markup-synth".to_string(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

// OpenAI-compatible wire structures.
#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

fn map_http_error(error: reqwest::Error) -> PipelineError {
    if error.is_timeout() {
        PipelineError::BackendRequestFailed(format!("request timeout: {error}"))
    } else if error.is_connect() {
        PipelineError::BackendRequestFailed(format!("connection error: {error}"))
    } else {
        PipelineError::BackendRequestFailed(format!("http error: {error}"))
    }
}

fn map_status_error(status: u16, body: String) -> PipelineError {
    match status {
        401 | 403 => PipelineError::BackendAuthFailed(body),
        429 => PipelineError::BackendRateLimit(body),
        // Invalid-request rejections will not improve on retry.
        400 | 404 | 413 | 422 => {
            PipelineError::GenerationFatal(format!("backend rejected request ({status}): {body}"))
        }
        _ => PipelineError::BackendRequestFailed(format!("status {status}: {body}")),
    }
}

/// OpenAI-compatible HTTP backend.
pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
    name: String,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .connect_timeout(BACKEND_HTTP_CONNECT_TIMEOUT)
            .timeout(BACKEND_HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            name: "http".to_string(),
        })
    }
}

#[async_trait]
impl GenerativeBackend for HttpBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<BackendResponse, PipelineError> {
        let wire_request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                WireMessage {
                    role: "system".to_string(),
                    content: request.context.to_string(),
                },
                WireMessage {
                    role: "user".to_string(),
                    content: request.prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let url = format!("{}/chat/completions", self.config.endpoint);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(api_key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = builder
            .json(&wire_request)
            .send()
            .await
            .map_err(map_http_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(map_status_error(status, body));
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            PipelineError::GenerationFatal(format!("failed to parse backend response: {e}"))
        })?;

        let choice = completion.choices.into_iter().next().ok_or_else(|| {
            PipelineError::GenerationFatal("no choices in backend response".to_string())
        })?;

        let usage = completion
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(BackendResponse {
            content: choice.message.content,
            model: completion.model,
            usage,
        })
    }

    fn backend_name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
pub struct ScriptedBackend {
    replies: parking_lot::Mutex<std::collections::VecDeque<String>>,
    model: String,
}

#[cfg(test)]
impl ScriptedBackend {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: parking_lot::Mutex::new(replies.into()),
            model: "scripted".to_string(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    async fn generate(&self, _request: GenerateRequest) -> Result<BackendResponse, PipelineError> {
        let content = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| "<div>scripted</div>".to_string());
        Ok(BackendResponse {
            content,
            model: self.model.clone(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            },
        })
    }

    fn backend_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_mapping_classifies_errors() {
        assert!(matches!(
            map_status_error(401, "no".into()),
            PipelineError::BackendAuthFailed(_)
        ));
        assert!(matches!(
            map_status_error(429, "slow down".into()),
            PipelineError::BackendRateLimit(_)
        ));
        assert!(matches!(
            map_status_error(400, "bad prompt".into()),
            PipelineError::GenerationFatal(_)
        ));
        assert!(matches!(
            map_status_error(503, "overloaded".into()),
            PipelineError::BackendRequestFailed(_)
        ));
    }

    #[test]
    fn rate_limit_and_5xx_are_retryable_but_rejections_are_not() {
        assert!(map_status_error(429, String::new()).is_retryable());
        assert!(map_status_error(502, String::new()).is_retryable());
        assert!(!map_status_error(422, String::new()).is_retryable());
        assert!(!map_status_error(401, String::new()).is_retryable());
    }

    #[test]
    fn backend_config_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.max_tokens, 4096);
        assert!(config.api_key.is_none());
    }

    #[tokio::test]
    async fn scripted_backend_replays_in_order() {
        let backend = ScriptedBackend::new(vec!["one".to_string(), "two".to_string()]);
        let request = GenerateRequest {
            prompt: "p".to_string(),
            context: json!({}),
        };
        let first = backend.generate(request.clone()).await.unwrap();
        let second = backend.generate(request).await.unwrap();
        assert_eq!(first.content, "one");
        assert_eq!(second.content, "two");
        assert_eq!(first.usage.total_tokens, 30);
    }
}
