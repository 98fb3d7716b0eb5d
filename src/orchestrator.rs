use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::executor::{StepExecutor, StepSession};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state_machine::{
    Job, JobStatus, NewLogEntry, StateMachine, Step, StepFailure, StepOutcome, Transition,
    VerificationStatus,
};
use crate::store::Store;
use crate::suspension::{SuspensionRegistry, SuspensionTicket};

/// Operator input for a suspended step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInput {
    pub step: Step,
    pub input: String,
}

/// How one run of a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(VerificationStatus),
    Suspended(SuspensionTicket),
    /// Back in RETRY; runnable again after `delay`.
    Requeued { retry_count: u32, delay: Duration },
    Failed { error: String },
}

/// Result of walking the step sequence, before it is persisted.
enum Attempt {
    Completed(VerificationStatus),
    Suspended(Step),
    Failed { step: Step, failure: StepFailure },
}

/// Drives a single job through the step sequence and persists every transition.
///
/// Step failures never escape as errors: they become log rows and a status
/// change. Only store failures are returned as `Err`.
pub struct JobRunner<E: StepExecutor> {
    store: Store,
    executor: Arc<E>,
    suspensions: Arc<SuspensionRegistry>,
    policy: RetryPolicy,
}

impl<E: StepExecutor> JobRunner<E> {
    pub fn new(
        store: Store,
        executor: Arc<E>,
        suspensions: Arc<SuspensionRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            executor,
            suspensions,
            policy,
        }
    }

    /// Run a job the caller has already moved to RUNNING.
    ///
    /// A fresh attempt starts at the first step; a resume starts at the
    /// suspended step and feeds it the operator's input. The executor
    /// session is closed before this returns, on every path.
    pub async fn run(&self, job: Job, resume: Option<ResumeInput>) -> Result<RunOutcome, EngineError> {
        let (start, input) = match resume {
            Some(r) => (r.step, Some(r.input)),
            None => (Step::first(), None),
        };
        debug!(job_id = %job.id, step = %start, resumed = input.is_some(), "job run starting");

        let mut session = match self.executor.open_session(&job).await {
            Ok(session) => session,
            Err(failure) => {
                self.store.begin_step(&job.id, start).await?;
                self.store
                    .append_log(&job.id, NewLogEntry::failure(start, 0, failure.message.clone()))
                    .await?;
                return self.route_failure(&job, JobStatus::Running, start, &failure).await;
            }
        };

        let attempt = self.run_steps(&job, &mut session, start, input).await;
        session.close().await;

        match attempt? {
            Attempt::Completed(verification) => {
                self.store.complete(&job.id, verification).await?;
                info!(job_id = %job.id, %verification, "job completed");
                Ok(RunOutcome::Completed(verification))
            }
            Attempt::Suspended(step) => {
                self.store.suspend(&job.id, step).await?;
                let ticket = self.suspensions.open_default(job.id, step)?;
                info!(job_id = %job.id, %step, deadline = %ticket.deadline, "job waiting for operator input");
                Ok(RunOutcome::Suspended(ticket))
            }
            Attempt::Failed { step, failure } => {
                self.route_failure(&job, JobStatus::Running, step, &failure).await
            }
        }
    }

    async fn run_steps(
        &self,
        job: &Job,
        session: &mut E::Session,
        start: Step,
        mut input: Option<String>,
    ) -> Result<Attempt, EngineError> {
        let mut step = start;
        let mut verification = None;

        loop {
            self.store.begin_step(&job.id, step).await?;
            let started = Instant::now();
            let outcome = session.execute(&job.data, step, input.take().as_deref()).await;
            let elapsed = started.elapsed().as_millis() as i64;

            let transition = StateMachine::next(step, &outcome);
            let entry = match &transition {
                Transition::Fail { failure, .. } => {
                    NewLogEntry::failure(step, elapsed, failure.message.clone())
                }
                Transition::Suspend(_) => NewLogEntry::suspended(step, elapsed),
                Transition::Next(_) | Transition::Complete => {
                    let result = match &outcome {
                        StepOutcome::Success(result) => result.clone(),
                        _ => None,
                    };
                    if step.yields_verification() {
                        verification = Some(VerificationStatus::from_extracted(result.as_deref()));
                    }
                    NewLogEntry::success(step, elapsed, result)
                }
            };
            self.store.append_log(&job.id, entry).await?;

            match transition {
                Transition::Next(next) => {
                    self.store.clear_error(&job.id).await?;
                    step = next;
                }
                Transition::Complete => {
                    return Ok(Attempt::Completed(
                        verification.unwrap_or(VerificationStatus::Error),
                    ));
                }
                Transition::Suspend(step) => return Ok(Attempt::Suspended(step)),
                Transition::Fail { step, failure } => return Ok(Attempt::Failed { step, failure }),
            }
        }
    }

    /// Apply the retry policy to a failed attempt of `job`, moving it out of `from`.
    pub async fn route_failure(
        &self,
        job: &Job,
        from: JobStatus,
        step: Step,
        failure: &StepFailure,
    ) -> Result<RunOutcome, EngineError> {
        let error = format!("{step}: {failure}");
        match self.policy.decide(job.retry_count) {
            RetryDecision::Requeue { retry_count, delay } => {
                let due = RetryPolicy::due_at(Utc::now(), delay);
                self.store
                    .schedule_retry(&job.id, from, retry_count, due, &error, Some(step))
                    .await?;
                warn!(
                    job_id = %job.id,
                    %step,
                    retry_count,
                    max_retries = self.policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "step failed, job scheduled for retry"
                );
                Ok(RunOutcome::Requeued { retry_count, delay })
            }
            RetryDecision::Exhausted => {
                self.store
                    .fail(&job.id, from, JobStatus::Failed, &error, Some(step))
                    .await?;
                warn!(job_id = %job.id, %step, retry_count = job.retry_count, error = %failure, "job failed, retries exhausted");
                Ok(RunOutcome::Failed { error })
            }
        }
    }
}
