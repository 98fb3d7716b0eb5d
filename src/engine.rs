//! The engine ties the store, queue, worker pool and suspension registry
//! together and exposes the operator-facing operations.
//!
//! Lifecycle: [`Engine::start`] runs crash recovery once, hydrates the queue
//! from PENDING rows, then spawns three background loops:
//!
//! - the dispatcher, which hands queued job ids to at most `workers`
//!   concurrent runs (a semaphore permit per run),
//! - the sweeper, which converts expired suspension tickets into failures,
//! - the poller, which promotes due retries and picks up jobs submitted by
//!   other processes.
//!
//! A store failure inside any of these stops the engine; [`EngineHandle::wait`]
//! then returns that error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::StepExecutor;
use crate::orchestrator::{JobRunner, ResumeInput, RunOutcome};
use crate::queue::JobQueue;
use crate::recovery::{RecoveryReport, RecoveryScanner};
use crate::state_machine::{
    AuditRecord, Job, JobData, JobId, JobLogEntry, JobStatus, NewLogEntry, StepFailure,
};
use crate::store::Store;
use crate::suspension::{SuspensionRegistry, SuspensionTicket};

struct Inner<E: StepExecutor> {
    config: EngineConfig,
    store: Store,
    queue: JobQueue,
    suspensions: Arc<SuspensionRegistry>,
    runner: JobRunner<E>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
    fatal: Mutex<Option<EngineError>>,
}

/// Cheap to clone; every clone drives the same engine.
pub struct Engine<E: StepExecutor> {
    inner: Arc<Inner<E>>,
}

impl<E: StepExecutor> Clone for Engine<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: StepExecutor> Engine<E> {
    /// Connect to `config.database_url` and build an engine around `executor`.
    pub async fn open(config: EngineConfig, executor: E) -> Result<Self, EngineError> {
        config.validate()?;
        let store = Store::connect(&config.database_url).await?;
        Ok(Self::new(config, store, executor))
    }

    pub fn new(config: EngineConfig, store: Store, executor: E) -> Self {
        let suspensions = Arc::new(SuspensionRegistry::new(config.otp_timeout()));
        let runner = JobRunner::new(
            store.clone(),
            Arc::new(executor),
            Arc::clone(&suspensions),
            config.retry_policy(),
        );
        let slots = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                queue: JobQueue::new(),
                suspensions,
                runner,
                slots,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                started: AtomicBool::new(false),
                fatal: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Resolves once the engine has been told to stop, by shutdown or by a
    /// store failure.
    pub async fn stopped(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Recover orphaned jobs, hydrate the queue and start the background loops.
    /// An engine can be started once.
    pub async fn start(&self) -> Result<EngineHandle<E>, EngineError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Config("engine already started".into()));
        }

        let recovery = RecoveryScanner::new(
            &self.inner.store,
            self.inner.config.retry_policy(),
            self.inner.config.requeue_interrupted,
        )
        .scan()
        .await?;
        let hydrated = self.inner.queue.hydrate(&self.inner.store).await?;

        self.inner.tasks.spawn(self.clone().dispatch());
        self.inner.tasks.spawn(self.clone().sweep_loop());
        self.inner.tasks.spawn(self.clone().poll_loop());

        info!(
            workers = self.inner.config.workers,
            hydrated,
            recovered = recovery.recovered.len(),
            requeued = recovery.requeued.len(),
            "engine started"
        );
        Ok(EngineHandle {
            engine: self.clone(),
            recovery,
        })
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Persist a new PENDING job and queue it.
    pub async fn submit_job(&self, data: JobData) -> Result<JobId, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        let job = Job::new(data);
        self.inner.store.insert_job(&job).await?;
        self.inner.queue.enqueue(job.id);
        info!(job_id = %job.id, source = %job.data.source_file, "job submitted");
        Ok(job.id)
    }

    /// Deliver operator input to a suspended job and continue it from the
    /// suspended step. Returns once the job is RUNNING again; the rest of the
    /// run happens in the worker pool.
    pub async fn resume_job(&self, id: JobId, input: impl Into<String>) -> Result<(), EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        let ticket = self.inner.suspensions.redeem(&id, Utc::now())?;
        let job = self.inner.store.resume_claim(&id).await?;
        info!(job_id = %id, step = %ticket.step, "job resumed");

        let resume = ResumeInput {
            step: ticket.step,
            input: input.into(),
        };
        let engine = self.clone();
        let slots = Arc::clone(&self.inner.slots);
        self.inner.tasks.spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            engine.drive(job, Some(resume)).await;
        });
        Ok(())
    }

    pub async fn get_job_status(&self, id: JobId) -> Result<Job, EngineError> {
        self.inner.store.require_job(&id).await
    }

    pub async fn list_job_logs(&self, id: JobId) -> Result<Vec<JobLogEntry>, EngineError> {
        self.inner.store.require_job(&id).await?;
        self.inner.store.list_logs(&id).await
    }

    /// Cancel a PENDING or SUSPENDED job. Returns the status it was in.
    pub async fn cancel_job(&self, id: JobId) -> Result<JobStatus, EngineError> {
        let previous = self.inner.store.cancel(&id).await?;
        self.inner.suspensions.close(&id);
        info!(job_id = %id, from = %previous, "job cancelled");
        Ok(previous)
    }

    pub async fn audit(&self, id: JobId) -> Result<AuditRecord, EngineError> {
        let job = self.inner.store.require_job(&id).await?;
        let logs = self.inner.store.list_logs(&id).await?;
        Ok(AuditRecord::from_job(&job, &logs))
    }

    /// Jobs currently waiting for operator input, oldest first.
    pub fn open_tickets(&self) -> Vec<SuspensionTicket> {
        self.inner.suspensions.open_tickets()
    }

    /// Convert every suspension past its deadline into a step failure.
    pub async fn expire_sweep(&self) -> Result<usize, EngineError> {
        self.expire_at(Utc::now()).await
    }

    /// [`Engine::expire_sweep`] against an explicit clock reading.
    pub async fn expire_at(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut converted = 0;
        for ticket in self.inner.suspensions.take_expired(now) {
            match self.expire_ticket(&ticket, now).await {
                Ok(true) => converted += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(job_id = %ticket.job_id, error = %e, "could not expire suspension"),
            }
        }
        Ok(converted)
    }

    async fn expire_ticket(&self, ticket: &SuspensionTicket, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let Some(job) = self.inner.store.get_job(&ticket.job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Suspended {
            debug!(job_id = %job.id, status = %job.status, "stale suspension ticket dropped");
            return Ok(false);
        }

        let failure = StepFailure::transient(format!(
            "no input received within {}s",
            self.inner.config.otp_timeout().as_secs()
        ));
        let waited = (now - ticket.opened_at).num_milliseconds().max(0);
        self.inner
            .store
            .append_log(&job.id, NewLogEntry::failure(ticket.step, waited, failure.message.clone()))
            .await?;
        warn!(job_id = %job.id, step = %ticket.step, "suspension timed out");

        let outcome = self
            .inner
            .runner
            .route_failure(&job, JobStatus::Suspended, ticket.step, &failure)
            .await?;
        if let RunOutcome::Requeued { delay, .. } = outcome {
            self.schedule_wakeup(job.id, delay);
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Worker pool
    // -----------------------------------------------------------------------

    /// Waits for a job first and only then for a slot, so an idle dispatcher
    /// never holds a permit a resumed job needs.
    async fn dispatch(self) {
        let inner = &self.inner;
        loop {
            let id = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                id = inner.queue.dequeue() => match id {
                    Some(id) => id,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                permit = Arc::clone(&inner.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let engine = self.clone();
            inner.tasks.spawn(async move {
                engine.claim_and_run(id).await;
                drop(permit);
            });
        }
        debug!("dispatcher stopped");
    }

    async fn claim_and_run(&self, id: JobId) {
        let job = match self.inner.store.claim(&id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %id, "job no longer pending, skipping");
                return;
            }
            Err(e) => {
                self.record_error(e);
                return;
            }
        };
        info!(job_id = %id, retry_count = job.retry_count, "job claimed");
        self.drive(job, None).await;
    }

    async fn drive(&self, job: Job, resume: Option<ResumeInput>) {
        let id = job.id;
        match self.inner.runner.run(job, resume).await {
            Ok(RunOutcome::Requeued { delay, .. }) => self.schedule_wakeup(id, delay),
            Ok(_) => {}
            Err(e) => self.record_error(e),
        }
    }

    /// Promote a RETRY job back to PENDING once its backoff has elapsed.
    /// The poller covers the same ground if this task is lost.
    fn schedule_wakeup(&self, id: JobId, delay: Duration) {
        let engine = self.clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = engine.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match engine.inner.store.promote_retry(&id).await {
                Ok(true) => {
                    debug!(job_id = %id, "retry due, job requeued");
                    engine.inner.queue.enqueue(id);
                }
                Ok(false) => {}
                Err(e) => engine.record_error(e),
            }
        });
    }

    async fn sweep_loop(self) {
        let mut ticker = interval(self.inner.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.expire_sweep().await {
                self.record_error(e);
            }
        }
    }

    async fn poll_loop(self) {
        let mut ticker = interval(self.inner.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.poll_once().await {
                self.record_error(e);
            }
        }
    }

    async fn poll_once(&self) -> Result<(), EngineError> {
        let promoted = self.inner.store.promote_due_retries(Utc::now()).await?;
        if !promoted.is_empty() {
            debug!(count = promoted.len(), "due retries promoted");
        }
        self.inner.queue.hydrate(&self.inner.store).await?;
        Ok(())
    }

    /// Store failures stop the engine; anything else only aborts one job.
    fn record_error(&self, e: EngineError) {
        if !e.is_fatal() {
            warn!(error = %e, "job run aborted");
            return;
        }
        error!(error = %e, "store failure, stopping engine");
        {
            let mut fatal = self
                .inner
                .fatal
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if fatal.is_none() {
                *fatal = Some(e);
            }
        }
        self.inner.shutdown.cancel();
    }
}

/// Returned by [`Engine::start`]; owns the engine's shutdown.
pub struct EngineHandle<E: StepExecutor> {
    engine: Engine<E>,
    recovery: RecoveryReport,
}

impl<E: StepExecutor> EngineHandle<E> {
    pub fn engine(&self) -> &Engine<E> {
        &self.engine
    }

    /// What crash recovery found at startup.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Stop taking new work and wait for in-flight runs to finish.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        info!("engine shutting down");
        self.engine.inner.shutdown.cancel();
        self.wait().await
    }

    /// Wait until the engine stops. Returns the store error that stopped it, if any.
    pub async fn wait(self) -> Result<(), EngineError> {
        let inner = &self.engine.inner;
        inner.shutdown.cancelled().await;
        inner.queue.close();
        inner.tasks.close();
        inner.tasks.wait().await;

        let fatal = inner
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match fatal {
            Some(e) => Err(e),
            None => {
                info!("engine stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::executor::scripted::ScriptedExecutor;
    use crate::state_machine::{Step, StepOutcome, StepResult, VerificationStatus};

    fn test_config(workers: usize) -> EngineConfig {
        EngineConfig {
            database_url: "sqlite::memory:".into(),
            workers,
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 10,
            otp_timeout_secs: 300,
            sweep_interval_ms: 20,
            poll_interval_ms: 20,
            requeue_interrupted: false,
            executor_url: None,
        }
    }

    async fn engine(workers: usize, executor: &ScriptedExecutor) -> Engine<ScriptedExecutor> {
        let store = Store::in_memory().await.unwrap();
        Engine::new(test_config(workers), store, executor.clone())
    }

    async fn wait_for(
        engine: &Engine<ScriptedExecutor>,
        id: JobId,
        status: JobStatus,
    ) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = engine.get_job_status(id).await.unwrap();
            if job.status == status {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} stuck in {} waiting for {status}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn submitted_job_runs_to_completion() {
        let executor = ScriptedExecutor::new();
        let engine = engine(2, &executor).await;
        let handle = engine.start().await.unwrap();

        let id = engine.submit_job(JobData::new("a.json")).await.unwrap();
        let job = wait_for(&engine, id, JobStatus::Completed).await;
        assert_eq!(job.verification_status, Some(VerificationStatus::Verified));
        assert!(job.started_at.is_some() && job.completed_at.is_some());

        let logs = engine.list_job_logs(id).await.unwrap();
        assert_eq!(logs.len(), 12);
        assert!(logs.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(logs.windows(2).all(|w| w[0].step.ordinal() < w[1].step.ordinal()));

        handle.shutdown().await.unwrap();
        assert_eq!(executor.live_sessions(), 0);
    }

    #[tokio::test]
    async fn persistent_step_failure_exhausts_retries() {
        let executor = ScriptedExecutor::new();
        executor.always(
            Step::RegistrationStep,
            StepOutcome::Failure(StepFailure::transient("registration rejected")),
        );
        let engine = engine(1, &executor).await;
        let handle = engine.start().await.unwrap();

        let id = engine.submit_job(JobData::new("a.json")).await.unwrap();
        let job = wait_for(&engine, id, JobStatus::Failed).await;
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.last_error_step, Some(Step::RegistrationStep));
        assert!(job.error_message.unwrap().contains("registration rejected"));

        // Initial attempt plus three retries, each restarting from step one.
        let logs = engine.list_job_logs(id).await.unwrap();
        let failures: Vec<_> = logs.iter().filter(|e| e.result == StepResult::Failure).collect();
        assert_eq!(failures.len(), 4);
        assert!(failures.iter().all(|e| e.step == Step::RegistrationStep));
        assert!(failures.iter().all(|e| e.step.ordinal() == 5));
        let successes = logs.iter().filter(|e| e.result == StepResult::Success).count();
        assert_eq!(successes, 16);
        assert!(logs.iter().all(|e| e.step.ordinal() <= 5));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let executor = ScriptedExecutor::new();
        executor.push(
            Step::TermsAccepted,
            StepOutcome::Failure(StepFailure::transient("captcha")),
        );
        let engine = engine(1, &executor).await;
        let handle = engine.start().await.unwrap();

        let id = engine.submit_job(JobData::new("a.json")).await.unwrap();
        let job = wait_for(&engine, id, JobStatus::Completed).await;
        assert_eq!(job.retry_count, 1);
        assert!(job.error_message.is_none());
        assert_eq!(job.last_error_step, Some(Step::TermsAccepted));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_run_each_job_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("race.db").display());
        let store = Store::connect(&url).await.unwrap();
        let executor = ScriptedExecutor::new();
        executor.with_step_delay(Duration::from_millis(1));
        let engine = Engine::new(test_config(8), store, executor.clone());
        let handle = engine.start().await.unwrap();

        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(engine.submit_job(JobData::new(format!("{i}.json"))).await.unwrap());
        }
        // The same ids again, as a second process hydrating the queue would.
        for id in &ids {
            engine.inner.queue.enqueue(*id);
        }
        for id in &ids {
            wait_for(&engine, *id, JobStatus::Completed).await;
        }

        for id in &ids {
            let logs = engine.list_job_logs(*id).await.unwrap();
            assert_eq!(logs.len(), 12, "job {id} ran more than once");
        }
        assert_eq!(executor.sessions_opened(), 20);
        let seen: HashSet<JobId> = executor.calls().iter().map(|c| c.job_id).collect();
        assert_eq!(seen.len(), 20);
        assert!(executor.peak_sessions() <= 8);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_claims_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("claims.db").display());
        let store = Store::connect(&url).await.unwrap();
        let job = Job::new(JobData::new("a.json"));
        store.insert_job(&job).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = job.id;
            handles.push(tokio::spawn(async move { store.claim(&id).await.unwrap() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn pool_never_exceeds_worker_count() {
        let executor = ScriptedExecutor::new();
        executor.with_step_delay(Duration::from_millis(2));
        let engine = engine(2, &executor).await;
        let handle = engine.start().await.unwrap();

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(engine.submit_job(JobData::new(format!("{i}.json"))).await.unwrap());
        }
        for id in ids {
            wait_for(&engine, id, JobStatus::Completed).await;
        }
        assert!(executor.peak_sessions() <= 2);
        assert_eq!(executor.sessions_opened(), 6);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn single_worker_resume_with_idle_queue_completes() {
        let executor = ScriptedExecutor::new();
        executor.push(Step::OtpSubmitted, StepOutcome::Suspended);
        let engine = engine(1, &executor).await;
        let handle = engine.start().await.unwrap();

        let id = engine.submit_job(JobData::new("otp.json")).await.unwrap();
        wait_for(&engine, id, JobStatus::Suspended).await;
        assert!(engine.inner.queue.is_empty());
        // Nothing queued: the dispatcher must not be sitting on the only slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.inner.slots.available_permits(), 1);

        engine.resume_job(id, "123456").await.unwrap();
        let job = wait_for(&engine, id, JobStatus::Completed).await;
        assert_eq!(job.verification_status, Some(VerificationStatus::Verified));
        assert_eq!(executor.calls_for(Step::OtpSubmitted), 2);
        assert_eq!(executor.live_sessions(), 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn suspended_job_frees_its_slot_and_resumes() {
        let executor = ScriptedExecutor::new();
        executor.push(Step::OtpSubmitted, StepOutcome::Suspended);
        let engine = engine(1, &executor).await;
        let handle = engine.start().await.unwrap();

        let parked = engine.submit_job(JobData::new("otp.json")).await.unwrap();
        wait_for(&engine, parked, JobStatus::Suspended).await;
        assert_eq!(engine.open_tickets().len(), 1);

        // One worker, and it is free for other jobs while the first waits.
        let other = engine.submit_job(JobData::new("other.json")).await.unwrap();
        wait_for(&engine, other, JobStatus::Completed).await;

        engine.resume_job(parked, "123456").await.unwrap();
        let job = wait_for(&engine, parked, JobStatus::Completed).await;
        assert_eq!(job.verification_status, Some(VerificationStatus::Verified));

        let err = engine.resume_job(parked, "123456").await.unwrap_err();
        assert!(matches!(err, EngineError::NoOpenTicket(_)));

        let results: Vec<StepResult> = engine
            .list_job_logs(parked)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.step == Step::OtpSubmitted)
            .map(|e| e.result)
            .collect();
        assert_eq!(results, vec![StepResult::Suspended, StepResult::Success]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn expired_suspension_fails_step_and_retries() {
        let executor = ScriptedExecutor::new();
        executor.push(Step::OtpSubmitted, StepOutcome::Suspended);
        let engine = engine(1, &executor).await;
        let handle = engine.start().await.unwrap();

        let id = engine.submit_job(JobData::new("otp.json")).await.unwrap();
        wait_for(&engine, id, JobStatus::Suspended).await;

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(engine.expire_at(later).await.unwrap(), 1);
        assert!(engine.open_tickets().is_empty());

        // The retry runs from step one and the scripted OTP step now succeeds.
        let job = wait_for(&engine, id, JobStatus::Completed).await;
        assert_eq!(job.retry_count, 1);

        let logs = engine.list_job_logs(id).await.unwrap();
        let parked = logs
            .iter()
            .position(|e| e.result == StepResult::Suspended)
            .unwrap();
        let timeout = &logs[parked + 1];
        assert_eq!(timeout.step, Step::OtpSubmitted);
        assert_eq!(timeout.result, StepResult::Failure);
        assert!(timeout.error_message.as_deref().unwrap().contains("no input"));
        assert_eq!(logs[parked + 2].step, Step::JobCreated);

        let err = engine.resume_job(id, "123456").await.unwrap_err();
        assert!(matches!(err, EngineError::NoOpenTicket(_)));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn expiry_with_no_retries_left_fails_job() {
        let executor = ScriptedExecutor::new();
        executor.push(Step::OtpSubmitted, StepOutcome::Suspended);
        let store = Store::in_memory().await.unwrap();
        let config = EngineConfig {
            max_retries: 0,
            ..test_config(1)
        };
        let engine = Engine::new(config, store, executor.clone());
        let handle = engine.start().await.unwrap();

        let id = engine.submit_job(JobData::new("otp.json")).await.unwrap();
        wait_for(&engine, id, JobStatus::Suspended).await;
        engine.expire_at(Utc::now() + chrono::Duration::hours(1)).await.unwrap();

        let job = engine.get_job_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error_step, Some(Step::OtpSubmitted));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_pending_job() {
        let executor = ScriptedExecutor::new();
        let engine = engine(1, &executor).await;

        let id = engine.submit_job(JobData::new("a.json")).await.unwrap();
        assert_eq!(engine.cancel_job(id).await.unwrap(), JobStatus::Pending);
        assert_eq!(engine.get_job_status(id).await.unwrap().status, JobStatus::Cancelled);

        // A stale queue entry for a cancelled job is skipped.
        let handle = engine.start().await.unwrap();
        let other = engine.submit_job(JobData::new("b.json")).await.unwrap();
        wait_for(&engine, other, JobStatus::Completed).await;
        assert_eq!(engine.get_job_status(id).await.unwrap().status, JobStatus::Cancelled);
        assert_eq!(executor.sessions_opened(), 1);

        let err = engine.cancel_job(other).await.unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_suspended_job_closes_ticket() {
        let executor = ScriptedExecutor::new();
        executor.push(Step::OtpSubmitted, StepOutcome::Suspended);
        let engine = engine(1, &executor).await;
        let handle = engine.start().await.unwrap();

        let id = engine.submit_job(JobData::new("otp.json")).await.unwrap();
        wait_for(&engine, id, JobStatus::Suspended).await;

        assert_eq!(engine.cancel_job(id).await.unwrap(), JobStatus::Suspended);
        assert!(engine.open_tickets().is_empty());
        let err = engine.resume_job(id, "123456").await.unwrap_err();
        assert!(matches!(err, EngineError::NoOpenTicket(_)));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restart_recovers_orphaned_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("crash.db").display());

        let orphan = {
            let store = Store::connect(&url).await.unwrap();
            let job = Job::new(JobData::new("crash.json"));
            store.insert_job(&job).await.unwrap();
            store.claim(&job.id).await.unwrap().unwrap();
            store.begin_step(&job.id, Step::DataProcessed).await.unwrap();
            job.id
        };

        let store = Store::connect(&url).await.unwrap();
        let executor = ScriptedExecutor::new();
        let engine = Engine::new(test_config(1), store, executor.clone());
        let handle = engine.start().await.unwrap();
        assert_eq!(handle.recovery().recovered, vec![orphan]);

        let job = engine.get_job_status(orphan).await.unwrap();
        assert_eq!(job.status, JobStatus::FailedRecovered);
        assert!(
            engine
                .store()
                .jobs_with_status(JobStatus::Running)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(executor.sessions_opened(), 0);

        assert!(engine.start().await.is_err());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pending_jobs_from_a_previous_run_are_picked_up() {
        let executor = ScriptedExecutor::new();
        let store = Store::in_memory().await.unwrap();
        let job = Job::new(JobData::new("old.json"));
        store.insert_job(&job).await.unwrap();

        let engine = Engine::new(test_config(1), store, executor);
        let handle = engine.start().await.unwrap();
        wait_for(&engine, job.id, JobStatus::Completed).await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let engine = engine(1, &ScriptedExecutor::new()).await;
        let id = uuid::Uuid::new_v4();
        assert!(matches!(
            engine.list_job_logs(id).await.unwrap_err(),
            EngineError::JobNotFound(_)
        ));
        assert!(matches!(
            engine.get_job_status(id).await.unwrap_err(),
            EngineError::JobNotFound(_)
        ));
        assert!(matches!(
            engine.cancel_job(id).await.unwrap_err(),
            EngineError::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn submissions_rejected_after_shutdown() {
        let engine = engine(1, &ScriptedExecutor::new()).await;
        let handle = engine.start().await.unwrap();
        handle.shutdown().await.unwrap();
        assert!(matches!(
            engine.submit_job(JobData::new("late.json")).await.unwrap_err(),
            EngineError::ShuttingDown
        ));
    }

    #[tokio::test]
    async fn audit_summarises_job_and_logs() {
        let executor = ScriptedExecutor::new();
        let engine = engine(1, &executor).await;
        let handle = engine.start().await.unwrap();
        let id = engine.submit_job(JobData::new("a.json")).await.unwrap();
        wait_for(&engine, id, JobStatus::Completed).await;

        let record = engine.audit(id).await.unwrap();
        assert_eq!(record.steps_succeeded, 12);
        assert_eq!(record.steps_failed, 0);
        assert_eq!(record.status, JobStatus::Completed);
        handle.shutdown().await.unwrap();
    }
}
