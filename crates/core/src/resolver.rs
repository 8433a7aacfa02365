//! Multi-provider credential fallback resolver.
//!
//! Given a company and a desired provider/model, builds an ordered,
//! deduplicated cascade of credential candidates across providers and
//! drives the AI gateway through it until one attempt succeeds. The
//! cascade is the retry mechanism: individual failures are recorded,
//! never retried in place, and only the aggregate surfaces.

use std::collections::HashSet;
use std::sync::Arc;

use secrecy::SecretString;
use thiserror::Error;

use crate::gateway::{AiGateway, GenerateOutcome, GenerateRequest};
use crate::providers::{
    CredentialCandidate, CredentialDirectory, Provider, StoredKeyRecord, UsedCredential,
};

/// At most this many attempt failures are carried into the aggregate
/// error message.
const MAX_REPORTED_FAILURES: usize = 6;

/// Caller-supplied override credential, tried first and only for the
/// originally desired provider.
#[derive(Debug, Clone)]
pub struct RuntimePrimary {
    pub key_name: String,
    pub api_key: SecretString,
    pub base_url: Option<String>,
}

/// Environment-level default credential, applicable to one provider
/// and gated by `allow_env_fallback`.
#[derive(Debug, Clone)]
pub struct EnvFallback {
    pub provider: Provider,
    pub api_key: SecretString,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub company_id: String,
    pub provider: Provider,
    pub model: String,
    pub preferred_key_id: Option<String>,
    pub runtime_primary: Option<RuntimePrimary>,
    pub allow_key_fallback: bool,
    pub allow_env_fallback: bool,
    pub prompt: String,
    pub system_instruction: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Successful resolution: the generated response plus which provider
/// and credential produced it.
#[derive(Debug)]
pub struct Resolution {
    pub response: GenerateOutcome,
    pub provider: Provider,
    pub used: UsedCredential,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// No candidate existed anywhere in the cascade. Session-start
    /// paths treat this as a configuration problem.
    #[error("no AI credentials are configured for this company")]
    NoCandidates,
    /// Every candidate was attempted and failed.
    #[error("all AI credentials failed ({attempts} attempted): {summary}")]
    Exhausted { attempts: usize, summary: String },
}

pub struct CredentialResolver {
    directory: Arc<dyn CredentialDirectory>,
    gateway: Arc<dyn AiGateway>,
    env_fallback: Option<EnvFallback>,
}

impl CredentialResolver {
    pub fn new(
        directory: Arc<dyn CredentialDirectory>,
        gateway: Arc<dyn AiGateway>,
        env_fallback: Option<EnvFallback>,
    ) -> Self {
        Self {
            directory,
            gateway,
            env_fallback,
        }
    }

    pub fn gateway(&self) -> Arc<dyn AiGateway> {
        self.gateway.clone()
    }

    /// Drives the fallback cascade until one attempt succeeds.
    pub async fn resolve(&self, request: ResolveRequest) -> Result<Resolution, ResolveError> {
        let mut seen = HashSet::new();
        let mut failures: Vec<String> = Vec::new();
        let mut attempts = 0usize;

        for provider in Provider::ordered_from(request.provider) {
            // The desired model only applies to the desired provider;
            // every other provider is tried with its own default.
            let model = if provider == request.provider {
                request.model.clone()
            } else {
                provider.default_model().to_string()
            };

            for candidate in self.candidates_for(&request, provider).await {
                if !seen.insert(candidate.fingerprint()) {
                    continue;
                }
                attempts += 1;

                tracing::debug!(
                    provider = provider.as_str(),
                    source = candidate.source().as_str(),
                    key = candidate.key_name(),
                    "attempting AI generation"
                );

                let generate = GenerateRequest {
                    provider,
                    model: model.clone(),
                    prompt: request.prompt.clone(),
                    system_instruction: request.system_instruction.clone(),
                    temperature: request.temperature,
                    max_tokens: request.max_tokens,
                    api_key: candidate.api_key().clone(),
                    base_url: candidate.base_url().map(str::to_string),
                };

                match self.gateway.generate(generate).await {
                    Ok(response) => {
                        return Ok(Resolution {
                            response,
                            provider,
                            used: UsedCredential::from(&candidate),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            provider = provider.as_str(),
                            key = candidate.key_name(),
                            error = %err,
                            "generation attempt failed, cascading"
                        );
                        failures.push(format!(
                            "{}/{}: {err}",
                            provider.as_str(),
                            candidate.key_name()
                        ));
                    }
                }
            }
        }

        if attempts == 0 {
            return Err(ResolveError::NoCandidates);
        }
        Err(ResolveError::Exhausted {
            attempts,
            summary: failures
                .iter()
                .take(MAX_REPORTED_FAILURES)
                .cloned()
                .collect::<Vec<_>>()
                .join("; "),
        })
    }

    /// Deduplicated candidates in cascade order, each paired with the
    /// provider it would be tried against, without attempting any of
    /// them. Session-start readiness checks walk this list.
    pub async fn ordered_candidates(
        &self,
        request: &ResolveRequest,
    ) -> Vec<(Provider, CredentialCandidate)> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for provider in Provider::ordered_from(request.provider) {
            for candidate in self.candidates_for(request, provider).await {
                if seen.insert(candidate.fingerprint()) {
                    candidates.push((provider, candidate));
                }
            }
        }
        candidates
    }

    /// Total deduplicated candidates across all providers.
    /// Session-start paths use this to tell "never configured" apart
    /// from "configured but failing".
    pub async fn candidate_count(&self, request: &ResolveRequest) -> usize {
        self.ordered_candidates(request).await.len()
    }

    /// Candidate list for one provider, in attempt priority order:
    /// runtime primary (desired provider only), the preferred stored
    /// key, remaining connected keys by freshness, the OAuth
    /// credential (OpenAI only), then the env default.
    async fn candidates_for(
        &self,
        request: &ResolveRequest,
        provider: Provider,
    ) -> Vec<CredentialCandidate> {
        let mut candidates = Vec::new();

        if provider == request.provider {
            if let Some(primary) = &request.runtime_primary {
                candidates.push(CredentialCandidate::RuntimePrimary {
                    key_name: primary.key_name.clone(),
                    api_key: primary.api_key.clone(),
                    base_url: primary.base_url.clone(),
                });
            }
        }

        let mut keys = match self
            .directory
            .connected_keys(&request.company_id, provider)
            .await
        {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(
                    provider = provider.as_str(),
                    error = %err,
                    "credential directory lookup failed; treating as no keys"
                );
                Vec::new()
            }
        };

        if let Some(preferred_id) = &request.preferred_key_id {
            if let Some(position) = keys.iter().position(|key| &key.id == preferred_id) {
                let preferred = keys.remove(position);
                candidates.push(stored_candidate(preferred));
            }
        }

        if request.allow_key_fallback {
            // Active and recently verified keys first.
            keys.sort_by(|a, b| {
                b.is_active
                    .cmp(&a.is_active)
                    .then(b.last_tested_at.cmp(&a.last_tested_at))
                    .then(b.updated_at.cmp(&a.updated_at))
            });
            candidates.extend(keys.into_iter().map(stored_candidate));
        }

        // OAuth credentials only ever apply to the designated provider.
        if provider == Provider::OpenAi {
            match self.directory.oauth_credential(&request.company_id).await {
                Ok(Some(oauth)) => candidates.push(CredentialCandidate::Oauth {
                    id: oauth.id,
                    access_token: oauth.access_token,
                }),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "oauth credential lookup failed; skipping");
                }
            }
        }

        if request.allow_env_fallback {
            if let Some(env) = &self.env_fallback {
                if env.provider == provider {
                    candidates.push(CredentialCandidate::Env {
                        key_name: "env".to_string(),
                        api_key: env.api_key.clone(),
                        base_url: env.base_url.clone(),
                    });
                }
            }
        }

        candidates
    }
}

fn stored_candidate(record: StoredKeyRecord) -> CredentialCandidate {
    CredentialCandidate::StoredKey {
        id: record.id,
        key_name: record.key_name,
        api_key: record.api_key,
        base_url: record.base_url,
    }
}
