mod job;
mod state;
mod step;

pub use job::{
    AuditRecord, FailureKind, Job, JobData, JobId, JobLogEntry, JobStatus, NewLogEntry,
    StepFailure, StepOutcome, StepResult, VerificationStatus,
};
pub use state::{StateMachine, Transition};
pub use step::Step;
