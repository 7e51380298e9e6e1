//! LLM chat completion collaborator.
//!
//! The conversation layer only depends on [`ChatApi`]; the bundled
//! [`OpenAiChat`] implementation targets any server exposing the
//! OpenAI chat completions API.

use crate::config::LlmConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

/// Message role on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a chat completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }
}

/// Token usage reported by the provider, when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// Result of one chat completion call.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    /// Assistant reply text.
    pub content: String,
    /// Usage payload; absent when the provider omits it. An absent
    /// payload is a no-op for cost accounting.
    pub usage: Option<TokenUsage>,
}

/// Chat completion provider interface.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Send the message list and return the assistant's reply.
    ///
    /// # Errors
    ///
    /// `VoiceError::Config` when configuration prevents the call from
    /// being attempted; `VoiceError::ResponseFailed` for auth, rate
    /// limit, and network failures. No automatic retry.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatCompletion>;
}

/// Chat completion client for OpenAI-compatible servers.
pub struct OpenAiChat {
    config: LlmConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<TokenUsage>,
}

impl OpenAiChat {
    /// Create a new client from config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {e}")))?;

        info!("chat API configured: {} model={}", config.api_url, config.model);

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn completions_url(&self) -> String {
        let base = self
            .config
            .api_url
            .strip_suffix("/v1")
            .unwrap_or(&self.config.api_url);
        let base = base.trim_end_matches('/');
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait]
impl ChatApi for OpenAiChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatCompletion> {
        if self.config.api_key.trim().is_empty() {
            return Err(VoiceError::Config(
                "LLM API key is not configured".to_owned(),
            ));
        }

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let start = Instant::now();
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::ResponseFailed(format!("network error: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(VoiceError::ResponseFailed(
                "authentication rejected by provider".to_owned(),
            ));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(VoiceError::ResponseFailed(
                "rate limited by provider".to_owned(),
            ));
        }
        if !status.is_success() {
            return Err(VoiceError::ResponseFailed(format!(
                "provider returned status {status}"
            )));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::ResponseFailed(format!("malformed response: {e}")))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| {
                VoiceError::ResponseFailed("response contained no choices".to_owned())
            })?;

        info!(
            "chat completion in {:.0}ms ({} chars)",
            start.elapsed().as_millis(),
            content.len()
        );

        Ok(ChatCompletion {
            content,
            usage: parsed.usage,
        })
    }
}
