//! Runtime health cache.
//!
//! Answers "is this credential currently reachable" with asymmetric
//! TTLs: a broken credential is re-checked sooner than a working one.
//! Concurrent callers asking about the same credential share a single
//! in-flight probe instead of each issuing a network call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
#[cfg(test)]
use mockall::automock;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::providers::Provider;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(7);
pub const MIN_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Time source for TTL arithmetic. Injectable so tests can advance
/// time without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// What to probe: one provider plus the credential under test.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub provider: Provider,
    pub credential_id: Option<String>,
    pub key_name: Option<String>,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthSource {
    Probe,
    Cache,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeHealthResult {
    pub ready: bool,
    pub reason: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub source: HealthSource,
}

impl RuntimeHealthResult {
    fn ready_now() -> Self {
        Self {
            ready: true,
            reason: None,
            checked_at: Utc::now(),
            source: HealthSource::Probe,
        }
    }

    fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
            checked_at: Utc::now(),
            source: HealthSource::Probe,
        }
    }
}

/// Raw outcome of one reachability probe, before classification.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Status(u16),
    TimedOut,
    TransportError(String),
}

#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub provider: Provider,
    pub api_key: SecretString,
    pub base_url: String,
    pub timeout: Duration,
}

/// Network seam for the reachability call, mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: ProbeTarget) -> ProbeOutcome;
}

/// Lightweight reachability probe against each provider's model
/// listing endpoint.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, target: ProbeTarget) -> ProbeOutcome {
        let url = format!("{}/models", target.base_url.trim_end_matches('/'));
        let builder = self.client.get(url).timeout(target.timeout);
        let builder = match target.provider {
            Provider::Anthropic => builder
                .header("x-api-key", target.api_key.expose_secret())
                .header("anthropic-version", "2023-06-01"),
            _ => builder.bearer_auth(target.api_key.expose_secret()),
        };
        match builder.send().await {
            Ok(response) => ProbeOutcome::Status(response.status().as_u16()),
            Err(err) if err.is_timeout() => ProbeOutcome::TimedOut,
            Err(err) => ProbeOutcome::TransportError(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthCacheConfig {
    pub success_ttl: Duration,
    pub failure_ttl: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthCacheConfig {
    fn default() -> Self {
        Self {
            success_ttl: Duration::from_secs(300),
            failure_ttl: Duration::from_secs(30),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl HealthCacheConfig {
    /// Applies the documented bounds: the probe timeout is clamped to
    /// 2..=20 seconds and the failure TTL never exceeds the success
    /// TTL, so broken credentials always recover detection faster.
    pub fn clamped(mut self) -> Self {
        self.probe_timeout = self.probe_timeout.clamp(MIN_PROBE_TIMEOUT, MAX_PROBE_TIMEOUT);
        if self.failure_ttl > self.success_ttl {
            self.failure_ttl = self.success_ttl;
        }
        self
    }
}

struct CacheEntry {
    result: RuntimeHealthResult,
    expires_at: Instant,
}

/// Removes the in-flight marker on every exit path, including panics
/// and cancellation.
struct InflightGuard<'a> {
    inflight: &'a DashMap<String, watch::Receiver<Option<RuntimeHealthResult>>>,
    key: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(self.key);
    }
}

/// Process-wide health cache, keyed per credential fingerprint.
pub struct RuntimeHealthCache {
    entries: DashMap<String, CacheEntry>,
    inflight: DashMap<String, watch::Receiver<Option<RuntimeHealthResult>>>,
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    config: HealthCacheConfig,
}

impl RuntimeHealthCache {
    pub fn new(probe: Arc<dyn HealthProbe>, clock: Arc<dyn Clock>, config: HealthCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            probe,
            clock,
            config: config.clamped(),
        }
    }

    /// Cache key: `company :: provider :: credentialRef :: baseUrl`.
    /// The credential reference prefers a stable id or name and falls
    /// back to a redacted digest of the key material, never the raw
    /// secret.
    pub fn cache_key(company_id: &str, check: &HealthCheck) -> String {
        let credential_ref = check
            .credential_id
            .clone()
            .or_else(|| check.key_name.clone())
            .or_else(|| {
                check.api_key.as_ref().map(|key| {
                    let digest = Sha256::digest(key.expose_secret().as_bytes());
                    hex::encode(&digest[..8])
                })
            })
            .unwrap_or_else(|| "unconfigured".to_string());
        format!(
            "{company_id}::{}::{credential_ref}::{}",
            check.provider.as_str(),
            check.base_url.as_deref().unwrap_or("")
        )
    }

    pub async fn check(&self, company_id: &str, check: &HealthCheck) -> RuntimeHealthResult {
        let key = Self::cache_key(company_id, check);

        if let Some(entry) = self.entries.get(&key) {
            if entry.expires_at > self.clock.now() {
                let mut result = entry.result.clone();
                result.source = HealthSource::Cache;
                return result;
            }
        }

        loop {
            // Join an existing probe for the same key if one is
            // running; otherwise claim the slot and probe ourselves.
            let existing = self.inflight.get(&key).map(|entry| entry.clone());
            if let Some(mut rx) = existing {
                loop {
                    if let Some(result) = rx.borrow().clone() {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        // The probing task went away without
                        // publishing; take over the probe.
                        break;
                    }
                }
                continue;
            }

            let (tx, rx) = watch::channel(None);
            match self.inflight.entry(key.clone()) {
                Entry::Occupied(_) => continue, // lost the race, join theirs
                Entry::Vacant(slot) => {
                    slot.insert(rx);
                }
            }

            let guard = InflightGuard {
                inflight: &self.inflight,
                key: &key,
            };
            let result = self.run_probe(check).await;
            self.store(&key, &result);
            let _ = tx.send(Some(result.clone()));
            drop(guard);
            return result;
        }
    }

    async fn run_probe(&self, check: &HealthCheck) -> RuntimeHealthResult {
        let Some(api_key) = check.api_key.clone() else {
            // No credential material: configuration problem, not a
            // network one. No call is made.
            return RuntimeHealthResult::not_ready(
                "no API credential is configured; connect an AI key",
            );
        };

        let base_url = match check.base_url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => check.provider.default_base_url().to_string(),
        };

        let outcome = self
            .probe
            .probe(ProbeTarget {
                provider: check.provider,
                api_key,
                base_url,
                timeout: self.config.probe_timeout,
            })
            .await;

        match outcome {
            ProbeOutcome::Status(status) if (200..300).contains(&status) => {
                RuntimeHealthResult::ready_now()
            }
            ProbeOutcome::Status(status) => RuntimeHealthResult::not_ready(format!(
                "{} health check returned status {status}",
                check.provider.as_str()
            )),
            ProbeOutcome::TimedOut => RuntimeHealthResult::not_ready("health check timed out"),
            ProbeOutcome::TransportError(detail) => {
                tracing::debug!(%detail, "health probe transport error");
                RuntimeHealthResult::not_ready("health check failed; please retry shortly")
            }
        }
    }

    fn store(&self, key: &str, result: &RuntimeHealthResult) {
        let ttl = if result.ready {
            self.config.success_ttl
        } else {
            self.config.failure_ttl
        };
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                result: result.clone(),
                expires_at: self.clock.now() + ttl,
            },
        );
    }
}

/// Loads the TTL/timeout knobs from the environment with documented
/// defaults, then applies the clamps.
pub fn health_config_from_env() -> Result<HealthCacheConfig> {
    fn secs(var: &str, default: Duration) -> Result<Duration> {
        match std::env::var(var) {
            Ok(raw) => {
                let parsed: u64 = raw
                    .parse()
                    .with_context(|| format!("{var} must be an integer number of seconds"))?;
                Ok(Duration::from_secs(parsed))
            }
            Err(_) => Ok(default),
        }
    }

    let defaults = HealthCacheConfig::default();
    Ok(HealthCacheConfig {
        success_ttl: secs("HEALTH_SUCCESS_TTL_SECS", defaults.success_ttl)?,
        failure_ttl: secs("HEALTH_FAILURE_TTL_SECS", defaults.failure_ttl)?,
        probe_timeout: secs("HEALTH_PROBE_TIMEOUT_SECS", defaults.probe_timeout)?,
    }
    .clamped())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Manual clock so TTL expiry is deterministic in tests.
    struct TestClock {
        now: Mutex<Instant>,
    }

    impl TestClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    /// Probe stub that counts calls and returns a fixed outcome after
    /// an optional delay (for coalescing tests).
    struct CountingProbe {
        calls: AtomicUsize,
        outcome: ProbeOutcome,
        delay: Duration,
    }

    impl CountingProbe {
        fn new(outcome: ProbeOutcome) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome,
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn probe(&self, _target: ProbeTarget) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.clone()
        }
    }

    fn check_with_key() -> HealthCheck {
        HealthCheck {
            provider: Provider::OpenAi,
            credential_id: Some("key_1".to_string()),
            key_name: Some("primary".to_string()),
            api_key: Some(SecretString::from("sk-test".to_string())),
            base_url: None,
        }
    }

    fn cache_with(
        probe: Arc<dyn HealthProbe>,
        clock: Arc<dyn Clock>,
    ) -> RuntimeHealthCache {
        RuntimeHealthCache::new(
            probe,
            clock,
            HealthCacheConfig {
                success_ttl: Duration::from_secs(300),
                failure_ttl: Duration::from_secs(30),
                probe_timeout: Duration::from_secs(7),
            },
        )
    }

    #[tokio::test]
    async fn fresh_result_is_served_from_cache() {
        let probe = Arc::new(CountingProbe::new(ProbeOutcome::Status(200)));
        let clock = Arc::new(TestClock::new());
        let cache = cache_with(probe.clone(), clock.clone());
        let check = check_with_key();

        let first = cache.check("co_1", &check).await;
        assert!(first.ready);
        assert_eq!(first.source, HealthSource::Probe);

        let second = cache.check("co_1", &check).await;
        assert!(second.ready);
        assert_eq!(second.source, HealthSource::Cache);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_expires_before_success_would() {
        let probe = Arc::new(CountingProbe::new(ProbeOutcome::Status(503)));
        let clock = Arc::new(TestClock::new());
        let cache = cache_with(probe.clone(), clock.clone());
        let check = check_with_key();

        let first = cache.check("co_1", &check).await;
        assert!(!first.ready);
        assert!(first.reason.as_deref().unwrap().contains("503"));

        // Within the failure TTL: cached.
        clock.advance(Duration::from_secs(10));
        let cached = cache.check("co_1", &check).await;
        assert_eq!(cached.source, HealthSource::Cache);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        // Past the failure TTL (but well inside what a success TTL
        // would have been): re-probed.
        clock.advance(Duration::from_secs(25));
        let reprobed = cache.check("co_1", &check).await;
        assert_eq!(reprobed.source, HealthSource::Probe);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_checks_share_one_probe() {
        let probe = Arc::new(
            CountingProbe::new(ProbeOutcome::Status(200))
                .with_delay(Duration::from_millis(50)),
        );
        let clock = Arc::new(TestClock::new());
        let cache = Arc::new(cache_with(probe.clone(), clock));
        let check = check_with_key();

        let a = {
            let cache = cache.clone();
            let check = check.clone();
            tokio::spawn(async move { cache.check("co_1", &check).await })
        };
        let b = {
            let cache = cache.clone();
            let check = check.clone();
            tokio::spawn(async move { cache.check("co_1", &check).await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.ready && b.ready);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        // Marker cleared: a later check after expiry probes again.
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn missing_credential_fails_without_probing() {
        let probe = Arc::new(CountingProbe::new(ProbeOutcome::Status(200)));
        let clock = Arc::new(TestClock::new());
        let cache = cache_with(probe.clone(), clock);
        let check = HealthCheck {
            provider: Provider::Google,
            credential_id: None,
            key_name: None,
            api_key: None,
            base_url: None,
        };

        let result = cache.check("co_1", &check).await;
        assert!(!result.ready);
        assert!(result.reason.as_deref().unwrap().contains("connect an AI key"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_is_reported_with_a_stable_reason() {
        let probe = Arc::new(CountingProbe::new(ProbeOutcome::TimedOut));
        let clock = Arc::new(TestClock::new());
        let cache = cache_with(probe, clock);

        let result = cache.check("co_1", &check_with_key()).await;
        assert!(!result.ready);
        assert_eq!(result.reason.as_deref(), Some("health check timed out"));
    }

    #[test]
    fn cache_key_prefers_id_and_never_contains_the_secret() {
        let check = check_with_key();
        let key = RuntimeHealthCache::cache_key("co_9", &check);
        assert_eq!(key, "co_9::openai::key_1::");

        let anonymous = HealthCheck {
            provider: Provider::OpenAi,
            credential_id: None,
            key_name: None,
            api_key: Some(SecretString::from("sk-super-secret".to_string())),
            base_url: Some("https://proxy.example.com/v1".to_string()),
        };
        let key = RuntimeHealthCache::cache_key("co_9", &anonymous);
        assert!(!key.contains("sk-super-secret"));
        assert!(key.ends_with("::https://proxy.example.com/v1"));
    }

    #[test]
    fn config_clamps_are_applied() {
        let config = HealthCacheConfig {
            success_ttl: Duration::from_secs(60),
            failure_ttl: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(90),
        }
        .clamped();
        assert_eq!(config.probe_timeout, MAX_PROBE_TIMEOUT);
        assert_eq!(config.failure_ttl, config.success_ttl);

        let config = HealthCacheConfig {
            probe_timeout: Duration::from_millis(100),
            ..HealthCacheConfig::default()
        }
        .clamped();
        assert_eq!(config.probe_timeout, MIN_PROBE_TIMEOUT);
    }
}
