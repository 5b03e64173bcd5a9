use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Chat-completions client for any OpenAI-compatible endpoint.
///
/// `api_url` is the full completions URL, not the API root.
pub struct RemoteLlmProvider {
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    max_tokens: usize,
    temperature: f32,
    client: Client,
}

impl RemoteLlmProvider {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        // Per-request timeouts are applied in `generate`
        let client = Client::builder()
            .user_agent(concat!("newsbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: Duration::from_secs(30),
            max_tokens: 250,
            temperature: 0.3,
            client,
        })
    }

    pub fn with_defaults(mut self, timeout_secs: u64, max_tokens: usize, temperature: f32) -> Self {
        self.timeout = Duration::from_secs(timeout_secs);
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Provider for the `[llm.remote]` section. Errors when the key variable is
    /// unset; the caller then runs the analyzer without a model.
    pub fn from_config(cfg: &common::RemoteLlmConfig) -> Result<Self> {
        let key_env = cfg
            .api_key_env
            .as_deref()
            .context("Missing api_key_env in remote LLM config")?;
        let api_key = common::Config::secret_from_env(Some(key_env))
            .with_context(|| format!("LLM API key env var '{}' not set", key_env))?;

        Ok(Self::new(
            cfg.api_url.as_deref().unwrap_or(DEFAULT_API_URL),
            api_key,
            cfg.model.as_deref().unwrap_or(DEFAULT_MODEL),
        )?
        .with_defaults(
            cfg.timeout_seconds.unwrap_or(30),
            cfg.max_tokens.unwrap_or(250),
            0.3,
        ))
    }

    fn chat_body(&self, request: LlmRequest) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt,
        });

        ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            temperature: request.temperature.unwrap_or(self.temperature),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for RemoteLlmProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let timeout = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);
        let body = self.chat_body(request);

        // The deadline covers both the request and reading the body.
        let call = async {
            let response = self
                .client
                .post(&self.api_url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .context("LLM HTTP request failed")?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ErrorBody>(&text)
                    .map(|e| e.error.message)
                    .unwrap_or(text);
                anyhow::bail!("LLM API error {}: {}", status, message);
            }

            let completion: ChatResponse =
                response.json().await.context("Failed to parse LLM response")?;
            Ok::<_, anyhow::Error>(completion)
        };

        let completion = tokio::time::timeout(timeout, call)
            .await
            .context("LLM request timed out")??;

        let usage = completion.usage.map(UsageMetadata::from).unwrap_or_default();
        let choice = completion
            .choices
            .into_iter()
            .next()
            .context("LLM response has no choices")?;
        debug!(model = %self.model, total_tokens = usage.total_tokens, "LLM completion received");

        Ok(LlmResponse {
            content: choice.message.content.trim().to_string(),
            usage,
            model: completion.model.unwrap_or_else(|| self.model.clone()),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

impl From<ChatUsage> for UsageMetadata {
    fn from(u: ChatUsage) -> Self {
        UsageMetadata {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// `{"error": {"message": ...}}`
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}
