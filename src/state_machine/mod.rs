mod job;
mod state;

pub use job::{
    BatchSummary, JobDescriptor, JobOutcome, JobStage, PipelineOptions, SearchCriteria, Session,
    SessionRequest, TargetSource,
};
pub use state::{BatchRun, InvalidTransition, PipelineState, Signal, StateMachine, Transition};
