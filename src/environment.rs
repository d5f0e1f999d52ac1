use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::EnrichError;

pub const DEFAULT_DATABASE_PATH: &str = "papers.db";
pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";

/// Upper bound on institutions per inference request.
pub const MAX_BATCH_SIZE: usize = 50;

/// Settings for talking to the inference API.
#[derive(Clone, Debug)]
pub struct InferenceSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

/// Settings that govern how unique entities are batched and retried.
#[derive(Clone, Debug)]
pub struct ResolverSettings {
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_jitter: f64,
    pub min_request_interval: Duration,
    pub default_retry_after: Duration,
    pub max_rate_limit_waits: u32,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_retries: 3,
            backoff_base: Duration::from_millis(2000),
            backoff_jitter: 0.25,
            min_request_interval: Duration::from_millis(500),
            default_retry_after: Duration::from_secs(30),
            max_rate_limit_waits: 20,
        }
    }
}

/// Settings for the continuous queue workers.
#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub claim_size: i64,
    pub idle_min: Duration,
    pub idle_max: Duration,
    pub lease_timeout: Duration,
    /// How long a record whose entity was quarantined waits before it can be claimed again.
    pub quarantine_retry_delay: Duration,
    pub workers: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            claim_size: 500,
            idle_min: Duration::from_secs(15),
            idle_max: Duration::from_secs(45),
            lease_timeout: Duration::from_secs(1800),
            quarantine_retry_delay: Duration::from_secs(900),
            workers: 1,
        }
    }
}

/// Process-wide configuration, read once at start-up and passed down by reference.
#[derive(Clone, Debug)]
pub struct EnrichmentConfig {
    pub database_path: String,
    pub inference: InferenceSettings,
    pub resolver: ResolverSettings,
    pub queue: QueueSettings,
}

impl EnrichmentConfig {
    pub fn from_env() -> Result<Self, EnrichError> {
        let resolver_defaults = ResolverSettings::default();
        let queue_defaults = QueueSettings::default();

        let batch_size: usize = env_or("ENRICH_BATCH_SIZE", resolver_defaults.batch_size)?;
        let jitter: f64 = env_or("ENRICH_BACKOFF_JITTER", resolver_defaults.backoff_jitter)?;

        let idle_min = Duration::from_secs(env_or("QUEUE_IDLE_MIN_SECS", 15u64)?);
        let idle_max = Duration::from_secs(env_or("QUEUE_IDLE_MAX_SECS", 45u64)?);
        if idle_max < idle_min {
            return Err(EnrichError::Config(format!(
                "QUEUE_IDLE_MAX_SECS ({:?}) is smaller than QUEUE_IDLE_MIN_SECS ({:?})",
                idle_max, idle_min
            )));
        }

        Ok(Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string()),
            inference: InferenceSettings {
                api_url: env::var("INFERENCE_API_URL")
                    .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
                api_key: env::var("INFERENCE_API_KEY")
                    .ok()
                    .filter(|key| !key.trim().is_empty()),
                model: env::var("INFERENCE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
                max_tokens: env_or("INFERENCE_MAX_TOKENS", 4096u32)?,
                request_timeout: Duration::from_secs(env_or("INFERENCE_TIMEOUT_SECS", 120u64)?),
            },
            resolver: ResolverSettings {
                batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
                max_retries: env_or("ENRICH_MAX_RETRIES", resolver_defaults.max_retries)?,
                backoff_base: Duration::from_millis(env_or("ENRICH_BACKOFF_BASE_MS", 2000u64)?),
                backoff_jitter: jitter.clamp(0.0, 1.0),
                min_request_interval: Duration::from_millis(env_or(
                    "ENRICH_MIN_REQUEST_INTERVAL_MS",
                    500u64,
                )?),
                default_retry_after: Duration::from_secs(env_or(
                    "ENRICH_DEFAULT_RETRY_AFTER_SECS",
                    30u64,
                )?),
                max_rate_limit_waits: env_or(
                    "ENRICH_MAX_RATE_LIMIT_WAITS",
                    resolver_defaults.max_rate_limit_waits,
                )?,
            },
            queue: QueueSettings {
                claim_size: env_or("QUEUE_CLAIM_SIZE", queue_defaults.claim_size)?.max(1),
                idle_min,
                idle_max,
                lease_timeout: Duration::from_secs(env_or("QUEUE_LEASE_TIMEOUT_SECS", 1800u64)?),
                quarantine_retry_delay: Duration::from_secs(env_or(
                    "QUEUE_QUARANTINE_RETRY_SECS",
                    900u64,
                )?),
                workers: env_or("QUEUE_WORKERS", queue_defaults.workers)?.max(1),
            },
        })
    }

    /// The API key, or an error for commands that must call the inference API.
    pub fn require_api_key(&self) -> Result<&str, EnrichError> {
        self.inference
            .api_key
            .as_deref()
            .ok_or_else(|| EnrichError::Config("INFERENCE_API_KEY is not set".to_string()))
    }
}

/// Reads `var` and parses it, falling back to `default` when unset or blank.
pub fn env_or<T: FromStr>(var: &str, default: T) -> Result<T, EnrichError> {
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => parse_setting(var, &raw),
        _ => Ok(default),
    }
}

fn parse_setting<T: FromStr>(var: &str, raw: &str) -> Result<T, EnrichError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| EnrichError::Config(format!("{} has an invalid value '{}'", var, raw)))
}
