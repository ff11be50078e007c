//! Client side of the worker protocol.
//!
//! [`BridgeClient`] makes unary JSON calls and opens progress streams against
//! whichever worker the supervisor currently publishes. The batch pipeline
//! only sees the [`WorkerApi`] trait, so tests can swap in a double.

mod client;
mod error;
mod frames;
mod stream;
mod types;

use serde_json::Value;

use crate::state_machine::{JobDescriptor, SearchCriteria};

pub use client::BridgeClient;
pub use error::BridgeError;
pub use stream::WorkerStream;
pub use types::{ApplicationRecord, STREAM_PATHS, SubmitReceipt};

/// Per-stage worker calls used by the batch pipeline.
#[allow(async_fn_in_trait)]
pub trait WorkerApi {
    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<JobDescriptor>, BridgeError>;

    async fn analyze_resume(&self, resume_text: &str) -> Result<Value, BridgeError>;

    async fn compose(
        &self,
        job: &JobDescriptor,
        resume_text: &str,
        analysis: Option<&Value>,
    ) -> Result<String, BridgeError>;

    async fn submit(&self, job_id: &str, greeting: &str) -> Result<SubmitReceipt, BridgeError>;

    async fn record(&self, record: &ApplicationRecord) -> Result<(), BridgeError>;
}
