//! Decoding of worker stream frames into [`ProgressEvent`]s.
//!
//! Workers either send tagged events (`{"type": "stage", ...}`) or one of the
//! older untagged shapes, which are normalised here:
//!
//! | frame                                   | events                  |
//! |-----------------------------------------|-------------------------|
//! | `{error: true, message}`                | `Failed`                |
//! | `{completed: true, ...}`                | `Completed`             |
//! | `{stage: "completed", ...}`             | `Completed`             |
//! | `{job, success, message, progress?}`    | `JobResult`, `Stage`    |
//! | `{stage, progress?}`                    | `Stage`                 |

use serde_json::{Map, Value};

use super::BridgeError;
use crate::error::{AbortReason, ErrorKind};
use crate::progress::ProgressEvent;
use crate::state_machine::{BatchSummary, JobDescriptor, JobOutcome, JobStage};

pub fn decode_frame(text: &str) -> Result<Vec<ProgressEvent>, BridgeError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(frame) = value else {
        return Ok(Vec::new());
    };

    if frame.contains_key("type") {
        let event = serde_json::from_value(Value::Object(frame))?;
        return Ok(vec![event]);
    }

    Ok(decode_legacy(&frame))
}

fn decode_legacy(frame: &Map<String, Value>) -> Vec<ProgressEvent> {
    let message = str_field(frame, "message").unwrap_or_default();
    let stage = str_field(frame, "stage");
    let progress = frame.get("progress").and_then(Value::as_f64);

    if bool_field(frame, "error") {
        return vec![ProgressEvent::Failed {
            error: AbortReason::new(ErrorKind::Upstream, message),
        }];
    }

    if bool_field(frame, "completed") || stage.as_deref() == Some("completed") {
        let success_count = count_field(frame, "success_count");
        let failed_count = count_field(frame, "failed_count");
        let total = frame
            .get("total")
            .and_then(Value::as_u64)
            .map_or(success_count + failed_count, |t| t as usize);
        let summary = BatchSummary {
            total,
            dispatched: success_count + failed_count,
            success_count,
            failed_count,
            halted: None,
            message,
        };
        return vec![ProgressEvent::Completed { summary }];
    }

    if let Some(success) = frame.get("success").and_then(Value::as_bool) {
        let mut job = JobDescriptor::new(job_id(frame));
        job.title = str_field(frame, "job");
        job.company = str_field(frame, "company");
        let outcome = if success {
            JobOutcome::succeeded(&job, JobStage::Submit, message)
        } else {
            JobOutcome::failed(&job, JobStage::Submit, message)
        };

        let mut events = vec![ProgressEvent::JobResult { outcome }];
        if let Some(fraction) = progress {
            events.push(ProgressEvent::stage(
                stage.unwrap_or_else(|| "applying".into()),
                fraction,
            ));
        }
        return events;
    }

    if let Some(name) = stage {
        return vec![ProgressEvent::stage(name, progress.unwrap_or(0.0))];
    }

    tracing::debug!(?frame, "ignoring unrecognised worker frame");
    Vec::new()
}

fn str_field(frame: &Map<String, Value>, key: &str) -> Option<String> {
    frame.get(key).and_then(Value::as_str).map(str::to_string)
}

fn bool_field(frame: &Map<String, Value>, key: &str) -> bool {
    frame.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn count_field(frame: &Map<String, Value>, key: &str) -> usize {
    frame.get(key).and_then(Value::as_u64).unwrap_or(0) as usize
}

fn job_id(frame: &Map<String, Value>) -> String {
    for key in ["job_id", "job"] {
        if let Some(id) = str_field(frame, key) {
            return id;
        }
    }
    match frame.get("current").and_then(Value::as_u64) {
        Some(n) => n.to_string(),
        None => String::new(),
    }
}
