use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy for an enrichment run.
///
/// Only [`EnrichError::Database`] and [`EnrichError::SnapshotInconsistency`] are
/// fatal to a run. The remaining variants describe per-batch or per-entity
/// problems that end in quarantine.
#[derive(Debug, Error)]
pub enum EnrichError {
    /// Response body could not be turned into the expected JSON array.
    #[error("unparsable inference response: {0}")]
    Parse(String),

    /// HTTP 429 from the inference API.
    #[error("rate limited by inference API (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure or timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-429 HTTP failure.
    #[error("inference API returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// A response value outside the fixed category enum.
    #[error("invalid category value '{0}'")]
    Validation(String),

    /// Entity absent from an otherwise valid response.
    #[error("entity '{0}' missing from inference response")]
    MissingEntity(String),

    #[error("snapshot inconsistent: counted {expected} target records but fetched {fetched}")]
    SnapshotInconsistency { expected: i64, fetched: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl EnrichError {
    /// Whether a failed request is worth sending again after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            EnrichError::Transport(_) | EnrichError::Parse(_) => true,
            EnrichError::Api { status, .. } => *status == 408 || (500..=599).contains(status),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EnrichError::Database(_) | EnrichError::SnapshotInconsistency { .. }
        )
    }
}

impl From<reqwest::Error> for EnrichError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => EnrichError::Api {
                status: status.as_u16(),
                message: err.without_url().to_string(),
            },
            None => EnrichError::Transport(err.without_url().to_string()),
        }
    }
}
