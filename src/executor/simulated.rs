use std::time::Duration;

use tokio::time::sleep;

use super::{StepExecutor, StepSession};
use crate::state_machine::{Job, JobData, JobId, Step, StepFailure, StepOutcome};

/// Deterministic in-process executor: every step succeeds after `step_delay`.
///
/// With `suspend_for_otp` the OTP step parks the job until input arrives;
/// an empty code is rejected as a transient failure.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    pub verification: String,
    pub suspend_for_otp: bool,
    pub step_delay: Duration,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self {
            verification: "VERIFIED".to_string(),
            suspend_for_otp: false,
            step_delay: Duration::from_millis(150),
        }
    }
}

impl StepExecutor for SimulatedExecutor {
    type Session = SimulatedSession;

    async fn open_session(&self, job: &Job) -> Result<SimulatedSession, StepFailure> {
        Ok(SimulatedSession {
            job_id: job.id,
            config: self.clone(),
        })
    }
}

pub struct SimulatedSession {
    job_id: JobId,
    config: SimulatedExecutor,
}

impl SimulatedSession {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl StepSession for SimulatedSession {
    async fn execute(
        &mut self,
        _data: &JobData,
        step: Step,
        resume_input: Option<&str>,
    ) -> StepOutcome {
        sleep(self.config.step_delay).await;
        match step {
            Step::OtpSubmitted if self.config.suspend_for_otp => match resume_input {
                None => StepOutcome::Suspended,
                Some(code) if code.trim().is_empty() => {
                    StepOutcome::Failure(StepFailure::transient("empty one-time code"))
                }
                Some(_) => StepOutcome::Success(None),
            },
            Step::StatusExtracted => StepOutcome::Success(Some(self.config.verification.clone())),
            _ => StepOutcome::Success(None),
        }
    }

    async fn close(self) {}
}
