//! Startup scan for jobs a previous process left mid-flight.
//!
//! A job found RUNNING or SUSPENDED at startup has no owner: the worker that
//! held it died with the old process, and suspension tickets live in memory
//! only. Each one is either terminated as FAILED_RECOVERED or, when
//! `requeue_interrupted` is set and retries remain, sent back through RETRY.

use chrono::Utc;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state_machine::{JobId, JobStatus, NewLogEntry};
use crate::store::Store;

pub const INTERRUPTED: &str = "interrupted by restart";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs moved to FAILED_RECOVERED.
    pub recovered: Vec<JobId>,
    /// Jobs sent back through RETRY.
    pub requeued: Vec<JobId>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.recovered.len() + self.requeued.len()
    }
}

pub struct RecoveryScanner<'a> {
    store: &'a Store,
    policy: RetryPolicy,
    requeue_interrupted: bool,
}

impl<'a> RecoveryScanner<'a> {
    pub fn new(store: &'a Store, policy: RetryPolicy, requeue_interrupted: bool) -> Self {
        Self {
            store,
            policy,
            requeue_interrupted,
        }
    }

    /// Must run before any worker starts, or a live job could be mistaken
    /// for an orphan.
    pub async fn scan(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();

        for status in [JobStatus::Running, JobStatus::Suspended] {
            for job in self.store.jobs_with_status(status).await? {
                if let Some(step) = job.current_step {
                    self.store
                        .append_log(&job.id, NewLogEntry::failure(step, 0, INTERRUPTED))
                        .await?;
                }

                if self.requeue_interrupted
                    && let RetryDecision::Requeue { retry_count, delay } =
                        self.policy.decide(job.retry_count)
                {
                    let due = RetryPolicy::due_at(Utc::now(), delay);
                    self.store
                        .schedule_retry(&job.id, status, retry_count, due, INTERRUPTED, job.current_step)
                        .await?;
                    warn!(job_id = %job.id, from = %status, retry_count, "interrupted job requeued");
                    report.requeued.push(job.id);
                    continue;
                }

                self.store
                    .fail(&job.id, status, JobStatus::FailedRecovered, INTERRUPTED, job.current_step)
                    .await?;
                warn!(job_id = %job.id, from = %status, "interrupted job marked FAILED_RECOVERED");
                report.recovered.push(job.id);
            }
        }

        if report.total() > 0 {
            info!(
                recovered = report.recovered.len(),
                requeued = report.requeued.len(),
                "crash recovery finished"
            );
        }
        Ok(report)
    }
}
