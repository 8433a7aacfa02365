//! Service configuration.
//!
//! Loads settings from environment variables into one shareable
//! struct. A `.env` file is honored for local development.

use std::env;

use secrecy::SecretString;
use tracing::Level;

use parley_core::Provider;
use parley_core::health::{HealthCacheConfig, health_config_from_env};
use parley_core::resolver::EnvFallback;

/// Default cap on simultaneous monitor connections per session. The
/// screen-share fan-out is one peer connection per monitor, so the
/// cap bounds the candidate's upload as well.
pub const DEFAULT_MONITOR_CAP: usize = 8;

/// Default turn floor when an interview does not specify one.
pub const DEFAULT_MIN_USER_TURNS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidVar(String, String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

/// Holds all configuration loaded from the environment.
///
/// *   `BIND_ADDR`: listen address. Defaults to `0.0.0.0:3000`.
/// *   `BACKEND_BASE_URL`: base URL of the persistence/credentials
///     backend. Required.
/// *   `FALLBACK_PROVIDER` / `FALLBACK_API_KEY` / `FALLBACK_BASE_URL`:
///     optional environment-level default credential for the
///     resolver's env fallback.
/// *   `STT_API_KEY` / `STT_BASE_URL` / `STT_MODEL` / `STT_LANGUAGE`:
///     speech-to-text credential and model. Transcription is disabled
///     when no key is set.
/// *   `MAX_MONITORS_PER_SESSION`: monitor fan-out cap. Defaults to 8.
/// *   `MIN_USER_TURNS_BEFORE_WRAP`: default turn floor. Defaults to 5.
/// *   `HEALTH_SUCCESS_TTL_SECS` / `HEALTH_FAILURE_TTL_SECS` /
///     `HEALTH_PROBE_TIMEOUT_SECS`: health cache knobs, clamped as
///     documented in `parley_core::health`.
/// *   `RUST_LOG`: logging level. Defaults to `INFO`.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub backend_base_url: String,
    pub env_fallback: Option<EnvFallback>,
    pub stt: Option<SttConfig>,
    pub monitor_cap: usize,
    pub default_min_user_turns: u32,
    pub health: HealthCacheConfig,
    pub generation_temperature: f32,
    pub generation_max_tokens: u32,
    pub log_level: Level,
}

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub api_key: SecretString,
    pub base_url: Option<String>,
    pub model: String,
    pub language: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let backend_base_url = env::var("BACKEND_BASE_URL")
            .map_err(|_| ConfigError::MissingVar("BACKEND_BASE_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let env_fallback = match env::var("FALLBACK_API_KEY") {
            Ok(key) if !key.is_empty() => {
                let provider_raw =
                    env::var("FALLBACK_PROVIDER").unwrap_or_else(|_| "openai".to_string());
                let provider = Provider::parse(&provider_raw).ok_or_else(|| {
                    ConfigError::InvalidVar("FALLBACK_PROVIDER".to_string(), provider_raw)
                })?;
                Some(EnvFallback {
                    provider,
                    api_key: SecretString::from(key),
                    base_url: env::var("FALLBACK_BASE_URL").ok(),
                })
            }
            _ => None,
        };

        let stt = match env::var("STT_API_KEY") {
            Ok(key) if !key.is_empty() => Some(SttConfig {
                api_key: SecretString::from(key),
                base_url: env::var("STT_BASE_URL").ok(),
                model: env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string()),
                language: env::var("STT_LANGUAGE").ok(),
            }),
            _ => None,
        };

        let monitor_cap = parse_or("MAX_MONITORS_PER_SESSION", DEFAULT_MONITOR_CAP)?;
        let default_min_user_turns = parse_or("MIN_USER_TURNS_BEFORE_WRAP", DEFAULT_MIN_USER_TURNS)?;
        let generation_temperature = parse_or("GENERATION_TEMPERATURE", 0.7f32)?;
        let generation_max_tokens = parse_or("GENERATION_MAX_TOKENS", 512u32)?;

        let health = health_config_from_env().map_err(|err| {
            ConfigError::InvalidVar("HEALTH_*".to_string(), err.to_string())
        })?;

        let log_level_str = env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            bind_addr,
            backend_base_url,
            env_fallback,
            stt,
            monitor_cap,
            default_min_user_turns,
            health,
            generation_temperature,
            generation_max_tokens,
            log_level,
        })
    }
}

fn parse_or<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidVar(var.to_string(), raw)),
        Err(_) => Ok(default),
    }
}
