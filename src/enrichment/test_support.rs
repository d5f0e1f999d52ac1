//! Scripted inference backend and fixtures shared by the unit tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::types::{CandidateSource, ResolutionCandidate, TargetRecord};
use crate::error::EnrichError;
use crate::llm::{InferenceBackend, InferenceReply, InferenceRequest};

/// Replays queued replies in order, then falls back to echoing every institution with a
/// fixed country (if configured) or failing with a transport error.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<InferenceReply, EnrichError>>>,
    echo: Option<(String, String)>,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, step: Result<InferenceReply, EnrichError>) -> Self {
        self.script
            .lock()
            .expect("script lock")
            .push_back(step);
        self
    }

    pub fn reply_text(self, text: &str) -> Self {
        self.push(Ok(InferenceReply::Text(text.to_string())))
    }

    pub fn rate_limited(self, retry_after: Option<Duration>) -> Self {
        self.push(Ok(InferenceReply::RateLimited { retry_after }))
    }

    pub fn fail(self, error: EnrichError) -> Self {
        self.push(Err(error))
    }

    pub fn echo_country(mut self, country: &str, category: &str) -> Self {
        self.echo = Some((country.to_string(), category.to_string()));
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceReply, EnrichError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());

        let next = self.script.lock().expect("script lock").pop_front();
        match next {
            Some(reply) => reply,
            None => match &self.echo {
                Some((country, category)) => {
                    let body: Vec<Value> = request
                        .institutions
                        .iter()
                        .map(|name| json!({"institution": name, "country": country, "uschina": category}))
                        .collect();
                    Ok(InferenceReply::Text(Value::Array(body).to_string()))
                }
                None => Err(EnrichError::Transport("script exhausted".to_string())),
            },
        }
    }

    fn describe(&self) -> String {
        "scripted backend".to_string()
    }
}

pub fn name_candidate(record_id: &str, name: &str) -> ResolutionCandidate {
    ResolutionCandidate {
        record_id: record_id.to_string(),
        author_position: Some(0),
        source: CandidateSource::InstitutionNameOnly {
            name: name.to_string(),
        },
    }
}

/// A record whose only signal is an institution name without a country code.
pub fn institution_record(id: &str, institution: &str) -> TargetRecord {
    TargetRecord::new(
        id,
        json!({"authorships": [{"institutions": [{"display_name": institution}]}]}),
    )
}

pub fn country_record(id: &str, code: &str) -> TargetRecord {
    TargetRecord::new(id, json!({"authorships": [{"countries": [code]}]}))
}

pub fn empty_record(id: &str) -> TargetRecord {
    TargetRecord::new(id, json!({"authorships": []}))
}
