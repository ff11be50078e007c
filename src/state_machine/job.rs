use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AbortReason, PipelineError};

/// One target to apply to. Everything beyond the id is passed through to the
/// worker untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(alias = "job_id")]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,

    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl JobDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            company: None,
            params: serde_json::Map::new(),
        }
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }

    pub fn display_company(&self) -> &str {
        self.company.as_deref().unwrap_or("")
    }
}

/// Query the worker runs to find targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub keywords: String,

    #[serde(default)]
    pub location: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary_min: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Where a session's targets come from.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSource {
    Explicit(Vec<JobDescriptor>),
    Search(SearchCriteria),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Upper bound on targets taken from the source.
    #[serde(default)]
    pub max_jobs: Option<usize>,

    /// Ask the worker to write a message per target instead of the default greeting.
    #[serde(default = "default_true")]
    pub compose_message: bool,

    /// Run one resume analysis before dispatching and feed it to composition.
    #[serde(default)]
    pub analyze_resume: bool,

    /// Store an application record on the worker after each submission.
    #[serde(default)]
    pub record_outcomes: bool,

    /// Skip targets already applied to successfully.
    #[serde(default = "default_true")]
    pub skip_applied: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_jobs: None,
            compose_message: true,
            analyze_resume: false,
            record_outcomes: false,
            skip_applied: true,
        }
    }
}

/// Session file contents (`.toml` or `.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRequest {
    pub requester: String,

    #[serde(default)]
    pub resume_text: String,

    #[serde(default)]
    pub targets: Vec<JobDescriptor>,

    #[serde(default)]
    pub search: Option<SearchCriteria>,

    #[serde(default)]
    pub options: PipelineOptions,
}

impl SessionRequest {
    /// Reads a request, choosing the format from the file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading session file {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let request = if is_json {
            serde_json::from_str(&contents)
                .with_context(|| format!("parsing session file {}", path.display()))?
        } else {
            toml::from_str(&contents)
                .with_context(|| format!("parsing session file {}", path.display()))?
        };
        Ok(request)
    }
}

/// One caller-initiated batch request. Immutable once created.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub requester: String,
    pub source: TargetSource,
    pub resume_text: String,
    pub options: PipelineOptions,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        requester: impl Into<String>,
        source: TargetSource,
        resume_text: impl Into<String>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester: requester.into(),
            source,
            resume_text: resume_text.into(),
            options,
            created_at: Utc::now(),
        }
    }

    pub fn from_request(request: SessionRequest) -> Result<Self, PipelineError> {
        if request.requester.trim().is_empty() {
            return Err(PipelineError::Validation(
                "requester must not be empty".into(),
            ));
        }
        let source = match request.search {
            Some(_) if !request.targets.is_empty() => {
                return Err(PipelineError::Validation(
                    "a session takes either explicit targets or a search, not both".into(),
                ));
            }
            Some(criteria) => TargetSource::Search(criteria),
            None => TargetSource::Explicit(request.targets),
        };
        Ok(Self::new(
            request.requester,
            source,
            request.resume_text,
            request.options,
        ))
    }
}

/// Furthest stage a job reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Match,
    Compose,
    Submit,
    Record,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStage::Match => write!(f, "match"),
            JobStage::Compose => write!(f, "compose"),
            JobStage::Submit => write!(f, "submit"),
            JobStage::Record => write!(f, "record"),
        }
    }
}

/// Result of one target. Never mutated once appended to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub target_id: String,
    pub title: String,
    pub company: String,
    pub stage: JobStage,
    pub success: bool,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn succeeded(job: &JobDescriptor, stage: JobStage, message: impl Into<String>) -> Self {
        Self::build(job, stage, true, message.into())
    }

    pub fn failed(job: &JobDescriptor, stage: JobStage, message: impl Into<String>) -> Self {
        Self::build(job, stage, false, message.into())
    }

    fn build(job: &JobDescriptor, stage: JobStage, success: bool, message: String) -> Self {
        Self {
            target_id: job.id.clone(),
            title: job.display_title().to_string(),
            company: job.display_company().to_string(),
            stage,
            success,
            message,
            finished_at: Utc::now(),
        }
    }
}

/// Final tally of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub dispatched: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// Set when dispatching stopped before the end of the target list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted: Option<AbortReason>,
    pub message: String,
}

impl BatchSummary {
    pub fn from_outcomes(
        total: usize,
        dispatched: usize,
        outcomes: &[JobOutcome],
        halted: Option<AbortReason>,
    ) -> Self {
        let success_count = outcomes.iter().filter(|o| o.success).count();
        let failed_count = outcomes.len() - success_count;
        let mut message =
            format!("Batch finished: {success_count} succeeded, {failed_count} failed");
        if let Some(reason) = &halted {
            message.push_str(&format!(" (stopped early: {})", reason.message));
        }
        Self {
            total,
            dispatched,
            success_count,
            failed_count,
            halted,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn descriptor_accepts_worker_field_names() {
        let json = r#"{"job_id": "j-42", "title": "Rust Engineer", "company": "Acme", "salary": "30k"}"#;
        let job: JobDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(job.id, "j-42");
        assert_eq!(job.display_title(), "Rust Engineer");
        assert_eq!(job.display_company(), "Acme");
        assert_eq!(job.params["salary"], "30k");
    }

    #[test]
    fn descriptor_display_falls_back_to_id() {
        let job = JobDescriptor::new("j-1");
        assert_eq!(job.display_title(), "j-1");
        assert_eq!(job.display_company(), "");
    }

    #[test]
    fn session_from_toml_request() {
        let request: SessionRequest = toml::from_str(
            r#"
            requester = "alice"
            resume_text = "ten years of systems work"

            [options]
            max_jobs = 2
            compose_message = false

            [[targets]]
            id = "a"

            [[targets]]
            id = "b"
            title = "Backend"
            "#,
        )
        .unwrap();

        let session = Session::from_request(request).unwrap();
        assert_eq!(session.requester, "alice");
        assert_eq!(session.options.max_jobs, Some(2));
        assert!(!session.options.compose_message);
        assert!(session.options.skip_applied);
        match session.source {
            TargetSource::Explicit(targets) => {
                let ids: Vec<_> = targets.iter().map(|t| t.id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("expected explicit targets, got {other:?}"),
        }
    }

    #[test]
    fn session_rejects_targets_and_search_together() {
        let request = SessionRequest {
            requester: "alice".into(),
            resume_text: String::new(),
            targets: vec![JobDescriptor::new("a")],
            search: Some(SearchCriteria {
                keywords: "rust".into(),
                location: String::new(),
                salary_min: None,
                limit: None,
            }),
            options: PipelineOptions::default(),
        };
        let err = Session::from_request(request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn session_request_loads_json_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"requester": "bob", "search": {{"keywords": "rust", "location": "Berlin"}}}}"#
        )
        .unwrap();

        let request = SessionRequest::load(file.path()).unwrap();
        let session = Session::from_request(request).unwrap();
        assert!(matches!(session.source, TargetSource::Search(ref c) if c.location == "Berlin"));
    }

    #[test]
    fn summary_counts_and_message() {
        let job = JobDescriptor::new("x");
        let outcomes = vec![
            JobOutcome::succeeded(&job, JobStage::Submit, "ok"),
            JobOutcome::failed(&job, JobStage::Compose, "no"),
            JobOutcome::succeeded(&job, JobStage::Record, "ok"),
        ];
        let summary = BatchSummary::from_outcomes(3, 3, &outcomes, None);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.message, "Batch finished: 2 succeeded, 1 failed");

        let halted = BatchSummary::from_outcomes(
            5,
            2,
            &outcomes[..2],
            Some(AbortReason::quota_exhausted(2, 5)),
        );
        assert_eq!(
            halted.message,
            "Batch finished: 1 succeeded, 1 failed (stopped early: quota exhausted after 2 of 5 targets)"
        );
    }

    #[test]
    fn job_stage_display() {
        assert_eq!(JobStage::Match.to_string(), "match");
        assert_eq!(JobStage::Record.to_string(), "record");
    }
}
