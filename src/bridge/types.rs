use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{JobDescriptor, JobOutcome};

pub const SEARCH_PATH: &str = "/api/jobs/search";
pub const ANALYZE_PATH: &str = "/api/analysis/resume";
pub const COMPOSE_PATH: &str = "/api/apply/compose";
pub const SUBMIT_PATH: &str = "/api/apply/single";
pub const RECORDS_PATH: &str = "/api/records";

/// Worker-driven batch endpoints. They all speak the same frame protocol.
pub const STREAM_PATHS: &[&str] = &[
    "/api/apply/ws/apply",
    "/api/apply/ws/boss-apply",
    "/api/smart-apply/ws/smart-apply",
    "/api/apply/ws",
];

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    #[serde(default = "default_success")]
    pub success: bool,

    #[serde(default)]
    pub jobs: Vec<JobDescriptor>,

    #[serde(default)]
    pub total: Option<usize>,

    #[serde(default)]
    pub message: String,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct AnalyzeRequest<'a> {
    pub resume_text: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeResponse {
    pub analysis: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ComposeRequest<'a> {
    pub job: &'a JobDescriptor,
    pub resume_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ComposeResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitRequest<'a> {
    pub job_id: &'a str,
    pub greeting: &'a str,
}

/// Worker's answer to a submission. `success: false` is a job failure, not a
/// transport one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Application history entry stored by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub session_id: Uuid,
    pub requester: String,
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub greeting: String,
    pub success: bool,
    pub message: String,
    pub applied_at: DateTime<Utc>,
}

impl ApplicationRecord {
    pub fn from_outcome(
        session_id: Uuid,
        requester: &str,
        outcome: &JobOutcome,
        greeting: &str,
    ) -> Self {
        Self {
            session_id,
            requester: requester.to_string(),
            job_id: outcome.target_id.clone(),
            title: outcome.title.clone(),
            company: outcome.company.clone(),
            greeting: greeting.to_string(),
            success: outcome.success,
            message: outcome.message.clone(),
            applied_at: outcome.finished_at,
        }
    }
}
