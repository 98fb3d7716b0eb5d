//! In-memory FIFO hand-off of runnable job ids to the worker pool.
//!
//! The queue is a hint, not the record of truth: a job's PENDING row in the
//! store is what makes it runnable. Enqueuing an id that is already waiting
//! is a no-op, and a worker that dequeues a job someone else already claimed
//! just skips it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::state_machine::{JobId, JobStatus};
use crate::store::Store;

#[derive(Default)]
struct QueueState {
    order: VecDeque<JobId>,
    queued: HashSet<JobId>,
    closed: bool,
}

#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a job id to the back of the queue. Returns `false` (and logs) when
    /// the id is already waiting or the queue is closed.
    pub fn enqueue(&self, id: JobId) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                debug!(job_id = %id, "queue closed, dropping enqueue");
                return false;
            }
            if !state.queued.insert(id) {
                warn!(job_id = %id, "job already queued, ignoring duplicate enqueue");
                return false;
            }
            state.order.push_back(id);
        }
        self.notify.notify_one();
        true
    }

    #[cfg(test)]
    fn try_dequeue(&self) -> Option<JobId> {
        let mut state = self.lock();
        let id = state.order.pop_front()?;
        state.queued.remove(&id);
        Some(id)
    }

    /// Wait for the next job id. Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<JobId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(id) = state.order.pop_front() {
                    state.queued.remove(&id);
                    return Some(id);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.lock().queued.contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiter and refuse further work.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Enqueue every PENDING job in the store, oldest first.
    pub async fn hydrate(&self, store: &Store) -> Result<usize, EngineError> {
        let pending = store.jobs_with_status(JobStatus::Pending).await?;
        let added = pending
            .iter()
            .filter(|job| !self.contains(&job.id) && self.enqueue(job.id))
            .count();
        if added > 0 {
            debug!(added, "queue hydrated from store");
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    use crate::state_machine::{Job, JobData};

    #[test]
    fn fifo_order() {
        let queue = JobQueue::new();
        let ids: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            assert!(queue.enqueue(*id));
        }
        let drained: Vec<JobId> = std::iter::from_fn(|| queue.try_dequeue()).collect();
        assert_eq!(drained, ids);
    }

    #[test]
    fn duplicate_enqueue_is_ignored() {
        let queue = JobQueue::new();
        let id = Uuid::new_v4();
        assert!(queue.enqueue(id));
        assert!(!queue.enqueue(id));
        assert_eq!(queue.len(), 1);
        queue.try_dequeue();
        // Once dequeued it may be queued again.
        assert!(queue.enqueue(id));
    }

    #[tokio::test]
    async fn dequeue_waits_for_enqueue() {
        let queue = Arc::new(JobQueue::new());
        let id = Uuid::new_v4();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(id);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(id));
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);
        assert!(!queue.enqueue(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn hydrate_loads_pending_jobs_only() {
        let store = Store::in_memory().await.unwrap();
        let first = Job::new(JobData::new("a.json"));
        let second = Job::new(JobData::new("b.json"));
        store.insert_job(&first).await.unwrap();
        store.insert_job(&second).await.unwrap();
        store.claim(&second.id).await.unwrap();

        let queue = JobQueue::new();
        assert_eq!(queue.hydrate(&store).await.unwrap(), 1);
        assert!(queue.contains(&first.id));
        assert!(!queue.contains(&second.id));
        // Hydrating twice does not duplicate.
        assert_eq!(queue.hydrate(&store).await.unwrap(), 0);
    }
}
