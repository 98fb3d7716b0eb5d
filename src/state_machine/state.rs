use super::job::{JobStatus, StepFailure, StepOutcome};
use super::step::Step;

/// What the runner does after a step reports its outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the next step.
    Next(Step),
    /// The last step succeeded; the job is complete.
    Complete,
    /// Park the job at this step until operator input arrives.
    Suspend(Step),
    /// Abort the attempt and hand the job to the retry policy.
    Fail { step: Step, failure: StepFailure },
}

/// Step sequencing plus the job-status transition table.
pub struct StateMachine;

impl StateMachine {
    /// Compute the transition for a step outcome.
    ///
    /// A `Suspended` outcome from a step that cannot suspend is treated as a
    /// fatal failure of that step.
    pub fn next(step: Step, outcome: &StepOutcome) -> Transition {
        match outcome {
            StepOutcome::Success(_) => match step.next() {
                Some(next) => Transition::Next(next),
                None => Transition::Complete,
            },
            StepOutcome::Failure(failure) => Transition::Fail {
                step,
                failure: failure.clone(),
            },
            StepOutcome::Suspended if step.can_suspend() => Transition::Suspend(step),
            StepOutcome::Suspended => Transition::Fail {
                step,
                failure: StepFailure::fatal(format!("step '{step}' cannot wait for external input")),
            },
        }
    }

    /// Whether the store may move a job from `from` to `to`.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (from, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Suspended)
                | (Running, Retry)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, FailedRecovered)
                | (Suspended, Running)
                | (Suspended, Retry)
                | (Suspended, Failed)
                | (Suspended, Cancelled)
                | (Suspended, FailedRecovered)
                | (Retry, Pending)
                | (Retry, Failed)
        )
    }
}
