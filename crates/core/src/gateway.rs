//! AI generation and speech-to-text collaborator.
//!
//! The `AiGateway` trait is the seam between the runtime and the
//! provider APIs. The credential resolver drives it with one concrete
//! credential per attempt; tests replace it with a mock so cascade
//! behavior can be asserted without network calls.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::providers::Provider;

/// Default bound on one generation call. Cascade fallback is the
/// retry mechanism, so a hung call must not stall the whole pass.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Transcription models tried after the configured one when the
/// provider rejects it as unknown or unsupported.
const TRANSCRIBE_MODEL_FALLBACKS: [&str; 2] = ["whisper-1", "gpt-4o-mini-transcribe"];

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub provider: Provider,
    pub model: String,
    pub prompt: String,
    pub system_instruction: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub api_key: SecretString,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    pub api_key: SecretString,
    pub base_url: Option<String>,
    pub model: String,
    pub language: Option<String>,
    pub mime_type: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AiGateway: Send + Sync {
    /// One generation attempt against one concrete credential.
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateOutcome>;

    /// Transcribe an audio buffer, falling back through alternate
    /// models when the provider rejects the configured one.
    async fn transcribe(&self, audio: Vec<u8>, options: TranscribeOptions) -> Result<String>;
}

// Response shapes for the OpenAI-compatible chat completions API.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Status codes that mean "this transcription model is not available
/// here"; anything else is a real failure and aborts the fallback.
pub fn transcribe_model_rejected(status: u16) -> bool {
    matches!(status, 400 | 404 | 422 | 501)
}

/// HTTP implementation speaking the OpenAI-compatible surface every
/// supported provider exposes. Anthropic differs only in auth headers.
pub struct HttpAiGateway {
    client: reqwest::Client,
}

impl HttpAiGateway {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn resolve_base_url(provider: Provider, base_url: Option<&str>) -> Result<String> {
        match base_url {
            Some(url) if !url.is_empty() => Ok(url.trim_end_matches('/').to_string()),
            _ if provider == Provider::Custom => {
                Err(anyhow!("custom provider requires a base URL"))
            }
            _ => Ok(provider.default_base_url().to_string()),
        }
    }

    fn authorize(
        provider: Provider,
        builder: reqwest::RequestBuilder,
        api_key: &SecretString,
    ) -> reqwest::RequestBuilder {
        match provider {
            Provider::Anthropic => builder
                .header("x-api-key", api_key.expose_secret())
                .header("anthropic-version", "2023-06-01"),
            _ => builder.bearer_auth(api_key.expose_secret()),
        }
    }
}

impl Default for HttpAiGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiGateway for HttpAiGateway {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateOutcome> {
        let base = Self::resolve_base_url(request.provider, request.base_url.as_deref())?;
        let body = serde_json::json!({
            "model": request.model,
            "messages": [
                { "role": "system", "content": request.system_instruction },
                { "role": "user", "content": request.prompt }
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let builder = self
            .client
            .post(format!("{base}/chat/completions"))
            .timeout(GENERATE_TIMEOUT)
            .json(&body);
        let response = Self::authorize(request.provider, builder, &request.api_key)
            .send()
            .await
            .context("generation request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!(
                "{} returned status {}",
                request.provider.as_str(),
                status.as_u16()
            ));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("failed to decode generation response")?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("provider returned no choices"))?;

        Ok(GenerateOutcome {
            text: choice.message.content,
            usage: parsed.usage,
        })
    }

    async fn transcribe(&self, audio: Vec<u8>, options: TranscribeOptions) -> Result<String> {
        let base = options
            .base_url
            .clone()
            .unwrap_or_else(|| Provider::OpenAi.default_base_url().to_string());
        let base = base.trim_end_matches('/').to_string();

        // The configured model first, then the fixed fallbacks, each
        // tried at most once.
        let mut models: Vec<&str> = vec![options.model.as_str()];
        for fallback in TRANSCRIBE_MODEL_FALLBACKS {
            if !models.contains(&fallback) {
                models.push(fallback);
            }
        }

        let mut last_rejection = None;
        for model in models {
            let file_part = reqwest::multipart::Part::bytes(audio.clone())
                .file_name("audio")
                .mime_str(&options.mime_type)
                .context("invalid audio mime type")?;
            let mut form = reqwest::multipart::Form::new()
                .part("file", file_part)
                .text("model", model.to_string());
            if let Some(language) = &options.language {
                form = form.text("language", language.clone());
            }

            let response = self
                .client
                .post(format!("{base}/audio/transcriptions"))
                .timeout(GENERATE_TIMEOUT)
                .bearer_auth(options.api_key.expose_secret())
                .multipart(form)
                .send()
                .await
                .context("transcription request failed")?;

            let status = response.status().as_u16();
            if transcribe_model_rejected(status) {
                tracing::debug!(model, status, "transcription model rejected, trying next");
                last_rejection = Some(status);
                continue;
            }
            if !response.status().is_success() {
                return Err(anyhow!("transcription returned status {status}"));
            }

            let parsed: TranscriptionResponse = response
                .json()
                .await
                .context("failed to decode transcription response")?;
            return Ok(parsed.text);
        }

        Err(anyhow!(
            "no transcription model accepted the request (last status {})",
            last_rejection.unwrap_or(0)
        ))
    }
}
