//! Test executor that replays pre-programmed outcomes and records every call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{StepExecutor, StepSession};
use crate::state_machine::{Job, JobData, JobId, Step, StepFailure, StepOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub job_id: JobId,
    pub step: Step,
    pub resume_input: Option<String>,
}

#[derive(Default)]
struct Inner {
    /// One-shot outcomes, consumed in order per step.
    queued: Mutex<HashMap<Step, VecDeque<StepOutcome>>>,
    /// Outcome returned every time once the queue for a step is empty.
    fixed: Mutex<HashMap<Step, StepOutcome>>,
    open_failures: Mutex<VecDeque<StepFailure>>,
    calls: Mutex<Vec<Call>>,
    live: AtomicUsize,
    opened: AtomicUsize,
    peak: AtomicUsize,
    step_delay: Mutex<Duration>,
}

/// Steps succeed unless scripted otherwise; the status step reports VERIFIED.
#[derive(Clone, Default)]
pub(crate) struct ScriptedExecutor {
    inner: Arc<Inner>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: Step, outcome: StepOutcome) -> &Self {
        self.inner
            .queued
            .lock()
            .unwrap()
            .entry(step)
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn always(&self, step: Step, outcome: StepOutcome) -> &Self {
        self.inner.fixed.lock().unwrap().insert(step, outcome);
        self
    }

    pub fn fail_next_open(&self, failure: StepFailure) -> &Self {
        self.inner.open_failures.lock().unwrap().push_back(failure);
        self
    }

    pub fn with_step_delay(&self, delay: Duration) -> &Self {
        *self.inner.step_delay.lock().unwrap() = delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, step: Step) -> usize {
        self.calls().iter().filter(|c| c.step == step).count()
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn peak_sessions(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, step: Step) -> StepOutcome {
        if let Some(outcome) = self
            .inner
            .queued
            .lock()
            .unwrap()
            .get_mut(&step)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }
        if let Some(outcome) = self.inner.fixed.lock().unwrap().get(&step) {
            return outcome.clone();
        }
        match step {
            Step::StatusExtracted => StepOutcome::Success(Some("VERIFIED".into())),
            _ => StepOutcome::Success(None),
        }
    }
}

impl StepExecutor for ScriptedExecutor {
    type Session = ScriptedSession;

    async fn open_session(&self, job: &Job) -> Result<ScriptedSession, StepFailure> {
        if let Some(failure) = self.inner.open_failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(live, Ordering::SeqCst);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedSession {
            job_id: job.id,
            executor: self.clone(),
        })
    }
}

pub(crate) struct ScriptedSession {
    job_id: JobId,
    executor: ScriptedExecutor,
}

impl StepSession for ScriptedSession {
    async fn execute(
        &mut self,
        _data: &JobData,
        step: Step,
        resume_input: Option<&str>,
    ) -> StepOutcome {
        self.executor.inner.calls.lock().unwrap().push(Call {
            job_id: self.job_id,
            step,
            resume_input: resume_input.map(str::to_string),
        });
        let delay = *self.executor.inner.step_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.executor.next_outcome(step)
    }

    async fn close(self) {
        self.executor.inner.live.fetch_sub(1, Ordering::SeqCst);
    }
}
