use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::environment::InferenceSettings;
use crate::error::EnrichError;
use crate::prompts;
use crate::{TARGET_LLM_REQUEST, TARGET_WEB_REQUEST};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One batch of institution names headed for the inference API.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub institutions: Vec<String>,
    pub prompt: String,
}

impl InferenceRequest {
    pub fn for_institutions(institutions: Vec<String>) -> Self {
        let prompt = prompts::institution_country_prompt(&institutions);
        Self {
            institutions,
            prompt,
        }
    }
}

/// A reply that reached the client. Rate limiting is a wait state, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceReply {
    /// Model text, still possibly wrapped in a code fence.
    Text(String),
    RateLimited { retry_after: Option<Duration> },
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceReply, EnrichError>;

    /// Short description for log lines.
    fn describe(&self) -> String;
}

/// Messages-API client over reqwest.
pub struct HttpInferenceClient {
    client: reqwest::Client,
    settings: InferenceSettings,
    api_key: String,
}

impl HttpInferenceClient {
    pub fn new(settings: &InferenceSettings, api_key: &str) -> Result<Self, EnrichError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .gzip(true)
            .build()
            .map_err(|e| EnrichError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            settings: settings.clone(),
            api_key: api_key.to_string(),
        })
    }

    fn body(&self, request: &InferenceRequest) -> Value {
        json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": 0.0,
            "messages": [
                {"role": "user", "content": request.prompt}
            ]
        })
    }
}

#[async_trait]
impl InferenceBackend for HttpInferenceClient {
    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceReply, EnrichError> {
        debug!(target: TARGET_LLM_REQUEST, "Sending {} institutions to {}", request.institutions.len(), self.settings.api_url);

        let response = self
            .client
            .post(&self.settings.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                let e = e.without_url();
                warn!(target: TARGET_WEB_REQUEST, "POST {} failed: {}", self.settings.api_url, e);
                EnrichError::from(e)
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers(), Utc::now());
            warn!(target: TARGET_LLM_REQUEST, "Inference API rate limited the request (retry-after {:?})", retry_after);
            return Ok(InferenceReply::RateLimited { retry_after });
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EnrichError::Api {
                status: status.as_u16(),
                message: message.chars().take(500).collect(),
            });
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| EnrichError::Parse(format!("response envelope is not JSON: {}", e)))?;
        let text = extract_message_text(&envelope)?;
        debug!(target: TARGET_LLM_REQUEST, "Inference response received ({} chars)", text.len());
        Ok(InferenceReply::Text(text))
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.settings.api_url, self.settings.model)
    }
}

/// Pulls the assistant text out of a Messages-style or Chat-Completions-style envelope.
pub fn extract_message_text(envelope: &Value) -> Result<String, EnrichError> {
    if let Some(blocks) = envelope.get("content").and_then(Value::as_array) {
        let text = blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str).unwrap_or("text") == "text")
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("");
        if !text.is_empty() {
            return Ok(text);
        }
    }

    if let Some(text) = envelope
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return Ok(text.to_string());
    }

    Err(EnrichError::Parse(
        "no text content in response envelope".to_string(),
    ))
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = raw.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some(Duration::from_secs_f64(seconds));
        }
        return None;
    }

    let when = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (when - now).to_std().ok().or(Some(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(
            parse_retry_after(&headers_with("2"), now),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            parse_retry_after(&headers_with(" 1.5 "), now),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_retry_after(&headers_with("-3"), now), None);
        assert_eq!(parse_retry_after(&HeaderMap::new(), now), None);
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            parse_retry_after(&headers_with("Fri, 01 Mar 2024 12:00:10 GMT"), now),
            Some(Duration::from_secs(10))
        );
        // A date in the past means retry now
        assert_eq!(
            parse_retry_after(&headers_with("Fri, 01 Mar 2024 11:00:00 GMT"), now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after(&headers_with("whenever"), now), None);
    }

    #[test]
    fn test_extract_message_text() {
        let messages = json!({
            "content": [{"type": "text", "text": "[{\"institution\": \"MIT\"}]"}]
        });
        assert_eq!(
            extract_message_text(&messages).unwrap(),
            "[{\"institution\": \"MIT\"}]"
        );

        let chat = json!({"choices": [{"message": {"content": "[]"}}]});
        assert_eq!(extract_message_text(&chat).unwrap(), "[]");

        assert!(matches!(
            extract_message_text(&json!({"id": "x"})),
            Err(EnrichError::Parse(_))
        ));
    }

    #[test]
    fn test_request_carries_prompt() {
        let request =
            InferenceRequest::for_institutions(vec!["MIT".to_string(), "Unknown University".to_string()]);
        assert!(request.prompt.contains("MIT\nUnknown University"));
        assert_eq!(request.institutions.len(), 2);
    }
}
