//! HTTP-backed collaborators.
//!
//! The gateway keeps no database of its own. Interview context,
//! transcript persistence, and the company's connected AI keys all
//! live behind the backend service configured by `BACKEND_BASE_URL`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::SecretString;
use serde::Deserialize;

use parley_core::context::{ConversationMessage, InterviewContext, InterviewStore};
use parley_core::providers::{CredentialDirectory, OauthCredential, Provider, StoredKeyRecord};

#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl InterviewStore for BackendClient {
    async fn load_interview_context(&self, interview_id: &str) -> Result<InterviewContext> {
        let response = self
            .http
            .get(self.url(&format!("/internal/interviews/{interview_id}/context")))
            .send()
            .await
            .context("Failed to reach backend for interview context")?
            .error_for_status()
            .context("Backend rejected interview context request")?;
        response
            .json::<InterviewContext>()
            .await
            .context("Failed to parse interview context")
    }

    async fn append_conversation_message(
        &self,
        session_id: &str,
        message: ConversationMessage,
    ) -> Result<()> {
        self.http
            .post(self.url(&format!("/internal/sessions/{session_id}/messages")))
            .json(&message)
            .send()
            .await
            .context("Failed to reach backend for transcript append")?
            .error_for_status()
            .context("Backend rejected transcript append")?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct WireStoredKey {
    id: String,
    key_name: String,
    api_key: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    last_tested_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct WireOauthCredential {
    id: String,
    access_token: String,
}

#[async_trait]
impl CredentialDirectory for BackendClient {
    async fn connected_keys(
        &self,
        company_id: &str,
        provider: Provider,
    ) -> Result<Vec<StoredKeyRecord>> {
        let response = self
            .http
            .get(self.url(&format!("/internal/companies/{company_id}/ai-keys")))
            .query(&[("provider", provider.as_str())])
            .send()
            .await
            .context("Failed to reach backend for connected keys")?
            .error_for_status()
            .context("Backend rejected connected keys request")?;
        let keys = response
            .json::<Vec<WireStoredKey>>()
            .await
            .context("Failed to parse connected keys")?;
        Ok(keys
            .into_iter()
            .map(|key| StoredKeyRecord {
                id: key.id,
                key_name: key.key_name,
                api_key: SecretString::from(key.api_key),
                base_url: key.base_url,
                is_active: key.is_active,
                last_tested_at: key.last_tested_at,
                updated_at: key.updated_at,
            })
            .collect())
    }

    async fn oauth_credential(&self, company_id: &str) -> Result<Option<OauthCredential>> {
        let response = self
            .http
            .get(self.url(&format!("/internal/companies/{company_id}/oauth-credential")))
            .send()
            .await
            .context("Failed to reach backend for OAuth credential")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .context("Backend rejected OAuth credential request")?;
        let credential = response
            .json::<Option<WireOauthCredential>>()
            .await
            .context("Failed to parse OAuth credential")?;
        Ok(credential.map(|credential| OauthCredential {
            id: credential.id,
            access_token: SecretString::from(credential.access_token),
        }))
    }
}
