//! The step executor contract and its implementations.
//!
//! A [`StepExecutor`] hands out one [`StepSession`] per job attempt (for a
//! browser driver: one browser session). The runner owns the session
//! exclusively and always closes it before giving its worker slot back.

pub mod error;
pub mod http;
pub mod simulated;
pub mod types;

#[cfg(test)]
pub(crate) mod scripted;

use std::future::Future;

use crate::state_machine::{Job, JobData, Step, StepFailure, StepOutcome};

pub use error::ExecutorError;
pub use http::HttpStepExecutor;
pub use simulated::SimulatedExecutor;

/// Factory for per-attempt executor sessions.
pub trait StepExecutor: Send + Sync + 'static {
    type Session: StepSession;

    /// Acquire a fresh session for `job`. A failure here counts as a failure
    /// of the step the runner was about to execute.
    fn open_session(
        &self,
        job: &Job,
    ) -> impl Future<Output = Result<Self::Session, StepFailure>> + Send;
}

/// One exclusively-owned executor session.
pub trait StepSession: Send {
    /// Perform one workflow step. `resume_input` is only set when resuming a
    /// suspended step with the operator's input.
    fn execute(
        &mut self,
        data: &JobData,
        step: Step,
        resume_input: Option<&str>,
    ) -> impl Future<Output = StepOutcome> + Send;

    /// Release everything the session holds. Never fails; problems are logged.
    fn close(self) -> impl Future<Output = ()> + Send;
}
