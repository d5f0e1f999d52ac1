pub mod db;
pub mod enrichment;
pub mod environment;
pub mod error;
pub mod llm;
pub mod logging;
pub mod prompts;
pub mod util;
pub mod workers;

pub const TARGET_WEB_REQUEST: &str = "web_request";
pub const TARGET_LLM_REQUEST: &str = "llm_request";
pub const TARGET_DB: &str = "db_query";
pub const TARGET_ENRICH: &str = "enrichment";

/// Identifies the process doing the work, for log lines and queue claims.
#[derive(Clone, Debug)]
pub struct WorkerDetail {
    pub name: String,
    pub id: i16,
    pub model: String,
    pub connection_info: String,
}

impl WorkerDetail {
    /// Name recorded against claimed queue rows.
    pub fn claim_tag(&self) -> String {
        format!("{}-{}", self.name.replace(' ', "_"), self.id)
    }
}
