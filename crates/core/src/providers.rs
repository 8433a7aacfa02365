//! Provider catalogue and credential model.
//!
//! A `CredentialCandidate` is a value object describing one way to
//! authenticate against one AI provider. Candidates come from four
//! sources with different priorities; the resolver deduplicates them
//! by fingerprint before attempting any network call. Key material is
//! held in `SecretString` so it is redacted from `Debug` output and
//! never reaches the logs.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// The AI providers the runtime can talk to, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Google,
    Anthropic,
    Deepseek,
    Alibaba,
    Custom,
}

/// Fixed default priority used when cascading away from the desired
/// provider.
pub const FALLBACK_ORDER: [Provider; 6] = [
    Provider::OpenAi,
    Provider::Google,
    Provider::Anthropic,
    Provider::Deepseek,
    Provider::Alibaba,
    Provider::Custom,
];

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Google => "google",
            Provider::Anthropic => "anthropic",
            Provider::Deepseek => "deepseek",
            Provider::Alibaba => "alibaba",
            Provider::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "google" | "gemini" => Some(Provider::Google),
            "anthropic" | "claude" => Some(Provider::Anthropic),
            "deepseek" => Some(Provider::Deepseek),
            "alibaba" | "qwen" => Some(Provider::Alibaba),
            "custom" => Some(Provider::Custom),
            _ => None,
        }
    }

    /// The model used when this provider is reached through the
    /// fallback cascade rather than requested directly.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o",
            Provider::Google => "gemini-2.0-flash",
            Provider::Anthropic => "claude-3-5-sonnet-20241022",
            Provider::Deepseek => "deepseek-chat",
            Provider::Alibaba => "qwen-plus",
            Provider::Custom => "gpt-4o",
        }
    }

    /// OpenAI-compatible API root for each provider. `Custom` has no
    /// default; a candidate for it must carry its own base URL.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Google => "https://generativelanguage.googleapis.com/v1beta/openai",
            Provider::Anthropic => "https://api.anthropic.com/v1",
            Provider::Deepseek => "https://api.deepseek.com/v1",
            Provider::Alibaba => "https://dashscope.aliyuncs.com/compatible-mode/v1",
            Provider::Custom => "",
        }
    }

    /// Provider order for one resolution pass: the desired provider
    /// first, then the fixed priority order with the desired provider
    /// removed from its original position.
    pub fn ordered_from(desired: Provider) -> Vec<Provider> {
        let mut order = vec![desired];
        order.extend(FALLBACK_ORDER.iter().copied().filter(|p| *p != desired));
        order
    }
}

/// Where a credential candidate came from. The wire names match the
/// `used.source` values reported back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    RuntimePrimary,
    ApiKey,
    CodexOauth,
    Env,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::RuntimePrimary => "runtime_primary",
            CredentialSource::ApiKey => "api_key",
            CredentialSource::CodexOauth => "codex_oauth",
            CredentialSource::Env => "env",
        }
    }
}

/// One way to authenticate a call. Each variant carries only the
/// fields that exist for that source.
#[derive(Debug, Clone)]
pub enum CredentialCandidate {
    /// Explicit override supplied by the caller for this resolution
    /// pass only. Applies to the originally desired provider.
    RuntimePrimary {
        key_name: String,
        api_key: SecretString,
        base_url: Option<String>,
    },
    /// A key the company has connected and stored.
    StoredKey {
        id: String,
        key_name: String,
        api_key: SecretString,
        base_url: Option<String>,
    },
    /// OAuth-style credential; only ever applicable to OpenAI.
    Oauth { id: String, access_token: SecretString },
    /// Environment-level default, gated by `allow_env_fallback`.
    Env {
        key_name: String,
        api_key: SecretString,
        base_url: Option<String>,
    },
}

impl CredentialCandidate {
    pub fn source(&self) -> CredentialSource {
        match self {
            CredentialCandidate::RuntimePrimary { .. } => CredentialSource::RuntimePrimary,
            CredentialCandidate::StoredKey { .. } => CredentialSource::ApiKey,
            CredentialCandidate::Oauth { .. } => CredentialSource::CodexOauth,
            CredentialCandidate::Env { .. } => CredentialSource::Env,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            CredentialCandidate::StoredKey { id, .. } | CredentialCandidate::Oauth { id, .. } => {
                Some(id)
            }
            _ => None,
        }
    }

    /// Human-readable key name used in attempt logs and aggregate
    /// error messages. Never the secret itself.
    pub fn key_name(&self) -> &str {
        match self {
            CredentialCandidate::RuntimePrimary { key_name, .. }
            | CredentialCandidate::StoredKey { key_name, .. }
            | CredentialCandidate::Env { key_name, .. } => key_name,
            CredentialCandidate::Oauth { .. } => "oauth",
        }
    }

    pub fn api_key(&self) -> &SecretString {
        match self {
            CredentialCandidate::RuntimePrimary { api_key, .. }
            | CredentialCandidate::StoredKey { api_key, .. }
            | CredentialCandidate::Env { api_key, .. } => api_key,
            CredentialCandidate::Oauth { access_token, .. } => access_token,
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        match self {
            CredentialCandidate::RuntimePrimary { base_url, .. }
            | CredentialCandidate::StoredKey { base_url, .. }
            | CredentialCandidate::Env { base_url, .. } => base_url.as_deref(),
            CredentialCandidate::Oauth { .. } => None,
        }
    }

    /// Deduplication key: SHA-256 over `(source, id, key_name,
    /// base_url, api_key)`. The raw secret never leaves this function.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source().as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.id().unwrap_or("").as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.key_name().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.base_url().unwrap_or("").as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.api_key().expose_secret().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Stable reference for cache keys and logs: the stored id or key
    /// name when one exists, otherwise a truncated fingerprint.
    pub fn reference(&self) -> String {
        if let Some(id) = self.id() {
            return id.to_string();
        }
        let name = self.key_name();
        if !name.is_empty() && name != "oauth" {
            return name.to_string();
        }
        self.fingerprint()[..16].to_string()
    }
}

/// Metadata about the credential a successful resolution used.
/// Carries no secret material, so it is safe to log and serialize.
#[derive(Debug, Clone, Serialize)]
pub struct UsedCredential {
    pub source: CredentialSource,
    pub key_name: String,
    pub id: Option<String>,
}

impl From<&CredentialCandidate> for UsedCredential {
    fn from(candidate: &CredentialCandidate) -> Self {
        Self {
            source: candidate.source(),
            key_name: candidate.key_name().to_string(),
            id: candidate.id().map(str::to_string),
        }
    }
}

/// A stored key as the credential directory reports it, including the
/// freshness metadata the resolver sorts on.
#[derive(Debug, Clone)]
pub struct StoredKeyRecord {
    pub id: String,
    pub key_name: String,
    pub api_key: SecretString,
    pub base_url: Option<String>,
    pub is_active: bool,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// OAuth credential record for the designated provider.
#[derive(Debug, Clone)]
pub struct OauthCredential {
    pub id: String,
    pub access_token: SecretString,
}

/// Read-only view of a company's connected credentials. Persistence
/// of keys lives with an external service; the runtime only lists.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialDirectory: Send + Sync {
    /// Connected (usable) stored keys for one provider. Disconnected
    /// keys are not returned.
    async fn connected_keys(
        &self,
        company_id: &str,
        provider: Provider,
    ) -> Result<Vec<StoredKeyRecord>>;

    /// The company's OAuth credential, if one is linked.
    async fn oauth_credential(&self, company_id: &str) -> Result<Option<OauthCredential>>;
}
