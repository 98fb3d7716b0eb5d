//! Jobs parked waiting for operator input.
//!
//! One ticket per job, keyed by job id, so any number of jobs can wait at
//! once. A ticket is redeemed exactly once: the first valid `redeem` removes
//! it, and any later attempt finds nothing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::EngineError;
use crate::retry::RetryPolicy;
use crate::state_machine::{JobId, Step};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspensionTicket {
    pub job_id: JobId,
    pub step: Step,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl SuspensionTicket {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

pub struct SuspensionRegistry {
    tickets: DashMap<JobId, SuspensionTicket>,
    default_timeout: Duration,
}

impl SuspensionRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tickets: DashMap::new(),
            default_timeout,
        }
    }

    /// Open a ticket expiring at `deadline`.
    pub fn open(
        &self,
        job_id: JobId,
        step: Step,
        deadline: DateTime<Utc>,
    ) -> Result<SuspensionTicket, EngineError> {
        match self.tickets.entry(job_id) {
            Entry::Occupied(_) => Err(EngineError::TicketAlreadyOpen(job_id)),
            Entry::Vacant(slot) => {
                let ticket = SuspensionTicket {
                    job_id,
                    step,
                    opened_at: Utc::now(),
                    deadline,
                };
                slot.insert(ticket.clone());
                Ok(ticket)
            }
        }
    }

    /// Open a ticket with the registry's default timeout.
    pub fn open_default(&self, job_id: JobId, step: Step) -> Result<SuspensionTicket, EngineError> {
        let deadline = RetryPolicy::due_at(Utc::now(), self.default_timeout);
        self.open(job_id, step, deadline)
    }

    /// Remove and return the job's ticket if it is still valid at `now`.
    /// An expired ticket stays in place for the sweeper to convert.
    pub fn redeem(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<SuspensionTicket, EngineError> {
        if let Some((_, ticket)) = self.tickets.remove_if(job_id, |_, t| !t.is_expired(now)) {
            return Ok(ticket);
        }
        if self.tickets.contains_key(job_id) {
            Err(EngineError::TicketExpired(*job_id))
        } else {
            Err(EngineError::NoOpenTicket(*job_id))
        }
    }

    /// Drop a ticket regardless of its deadline (cancellation).
    pub fn close(&self, job_id: &JobId) -> Option<SuspensionTicket> {
        self.tickets.remove(job_id).map(|(_, ticket)| ticket)
    }

    /// Remove and return every ticket past its deadline at `now`.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<SuspensionTicket> {
        let expired: Vec<JobId> = self
            .tickets
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.tickets.remove_if(&id, |_, t| t.is_expired(now)))
            .map(|(_, ticket)| ticket)
            .collect()
    }

    pub fn get(&self, job_id: &JobId) -> Option<SuspensionTicket> {
        self.tickets.get(job_id).map(|entry| entry.value().clone())
    }

    pub fn open_tickets(&self) -> Vec<SuspensionTicket> {
        let mut tickets: Vec<SuspensionTicket> =
            self.tickets.iter().map(|entry| entry.value().clone()).collect();
        tickets.sort_by_key(|t| t.opened_at);
        tickets
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}
