//! SQLite-backed persistent store for jobs and their step logs.
//!
//! The `jobs` table is the source of truth for every job's lifecycle. Each
//! status change is one status-guarded `UPDATE ... WHERE status = ?`
//! (compare-and-swap on `status`), so two workers can never both move the
//! same job out of PENDING. Writes go through a single-connection writer
//! pool; reads use a separate reader pool.

mod schema;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tracing::debug;
use uuid::Uuid;

use crate::error::EngineError;
use crate::state_machine::{
    Job, JobData, JobId, JobLogEntry, JobStatus, NewLogEntry, StateMachine, Step, StepResult,
    VerificationStatus,
};

use schema::SCHEMA;

/// Handle to the job database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    reader: SqlitePool,
    writer: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `database_url` and apply the schema.
    ///
    /// File databases use WAL mode with a 5-second busy timeout. In-memory
    /// URLs are routed to [`Store::in_memory`].
    pub async fn connect(database_url: &str) -> Result<Self, EngineError> {
        if is_memory_url(database_url) {
            return Self::in_memory().await;
        }

        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;

        // Schema goes in before the read-only pool opens.
        sqlx::raw_sql(SCHEMA).execute(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(base_opts.read_only(true))
            .await?;

        Ok(Self { reader, writer })
    }

    /// A private in-memory database. One connection that never expires,
    /// since the data lives only as long as that connection.
    pub async fn in_memory() -> Result<Self, EngineError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            reader: pool.clone(),
            writer: pool,
        })
    }

    // -----------------------------------------------------------------------
    // Jobs: reads
    // -----------------------------------------------------------------------

    pub async fn insert_job(&self, job: &Job) -> Result<(), EngineError> {
        let data = serde_json::to_string(&job.data)?;
        sqlx::query(
            r#"INSERT INTO jobs
               (id, data, status, current_step, retry_count, created_at, started_at,
                completed_at, next_attempt_at, error_message, last_error_step, verification_status)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(&data)
        .bind(job.status.as_str())
        .bind(job.current_step.map(|s| s.ordinal() as i64))
        .bind(job.retry_count as i64)
        .bind(format_ts(&job.created_at))
        .bind(job.started_at.as_ref().map(format_ts))
        .bind(job.completed_at.as_ref().map(format_ts))
        .bind(job.next_attempt_at.as_ref().map(format_ts))
        .bind(&job.error_message)
        .bind(job.last_error_step.map(|s| s.ordinal() as i64))
        .bind(job.verification_status.map(|v| v.as_str()))
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, EngineError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.reader)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn require_job(&self, id: &JobId) -> Result<Job, EngineError> {
        self.get_job(id).await?.ok_or(EngineError::JobNotFound(*id))
    }

    /// Newest first, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: u32,
    ) -> Result<Vec<Job>, EngineError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC LIMIT ?")
                    .bind(status.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.reader)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.reader)
                    .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    /// Oldest first; used by recovery and queue hydration.
    pub async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, EngineError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY created_at ASC")
            .bind(status.as_str())
            .fetch_all(&self.reader)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, EngineError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.reader)
            .await?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.push((parse_status(&status)?, n));
        }
        counts.sort_by_key(|(status, _)| JobStatus::ALL.iter().position(|s| s == status));
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Jobs: status-guarded transitions
    // -----------------------------------------------------------------------

    /// PENDING -> RUNNING. Returns `None` when another worker got there first
    /// or the job is no longer pending; the caller simply skips it.
    pub async fn claim(&self, id: &JobId) -> Result<Option<Job>, EngineError> {
        ensure_allowed(JobStatus::Pending, JobStatus::Running)?;
        let now = format_ts(&Utc::now());
        let row = sqlx::query(
            r#"UPDATE jobs
               SET status = 'RUNNING',
                   started_at = COALESCE(started_at, ?),
                   current_step = NULL,
                   next_attempt_at = NULL
               WHERE id = ? AND status = 'PENDING'
               RETURNING *"#,
        )
        .bind(&now)
        .bind(id.to_string())
        .fetch_optional(&self.writer)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// SUSPENDED -> RUNNING, for a job whose ticket was just redeemed.
    pub async fn resume_claim(&self, id: &JobId) -> Result<Job, EngineError> {
        ensure_allowed(JobStatus::Suspended, JobStatus::Running)?;
        let row = sqlx::query(
            "UPDATE jobs SET status = 'RUNNING' WHERE id = ? AND status = 'SUSPENDED' RETURNING *",
        )
        .bind(id.to_string())
        .fetch_optional(&self.writer)
        .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.conflict(id, JobStatus::Suspended.as_str()).await),
        }
    }

    /// Record the step about to be attempted.
    pub async fn begin_step(&self, id: &JobId, step: Step) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE jobs SET current_step = ? WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(step.ordinal() as i64)
        .bind(id.to_string())
        .execute(&self.writer)
        .await?;
        self.expect_one(id, result.rows_affected(), JobStatus::Running).await
    }

    /// A step succeeded: the last error no longer describes the job.
    pub async fn clear_error(&self, id: &JobId) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE jobs SET error_message = NULL WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(id.to_string())
        .execute(&self.writer)
        .await?;
        self.expect_one(id, result.rows_affected(), JobStatus::Running).await
    }

    /// RUNNING -> SUSPENDED.
    pub async fn suspend(&self, id: &JobId, step: Step) -> Result<(), EngineError> {
        ensure_allowed(JobStatus::Running, JobStatus::Suspended)?;
        let result = sqlx::query(
            "UPDATE jobs SET status = 'SUSPENDED', current_step = ? WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(step.ordinal() as i64)
        .bind(id.to_string())
        .execute(&self.writer)
        .await?;
        self.expect_one(id, result.rows_affected(), JobStatus::Running).await
    }

    /// RUNNING -> COMPLETED.
    pub async fn complete(
        &self,
        id: &JobId,
        verification: VerificationStatus,
    ) -> Result<(), EngineError> {
        ensure_allowed(JobStatus::Running, JobStatus::Completed)?;
        let now = format_ts(&Utc::now());
        let result = sqlx::query(
            r#"UPDATE jobs
               SET status = 'COMPLETED',
                   completed_at = COALESCE(completed_at, ?),
                   verification_status = ?,
                   error_message = NULL
               WHERE id = ? AND status = 'RUNNING'"#,
        )
        .bind(&now)
        .bind(verification.as_str())
        .bind(id.to_string())
        .execute(&self.writer)
        .await?;
        self.expect_one(id, result.rows_affected(), JobStatus::Running).await
    }

    /// `from` -> RETRY with the new retry count and the time it becomes runnable.
    ///
    /// Guarded on both status and the previous retry count, so a stale
    /// decision can never bump the count twice.
    pub async fn schedule_retry(
        &self,
        id: &JobId,
        from: JobStatus,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        step: Option<Step>,
    ) -> Result<(), EngineError> {
        ensure_allowed(from, JobStatus::Retry)?;
        let previous = retry_count.checked_sub(1).ok_or_else(|| {
            EngineError::InvalidStoredValue("retry count must advance from a lower value".into())
        })?;
        let result = sqlx::query(
            r#"UPDATE jobs
               SET status = 'RETRY',
                   retry_count = ?,
                   next_attempt_at = ?,
                   error_message = ?,
                   last_error_step = COALESCE(?, last_error_step)
               WHERE id = ? AND status = ? AND retry_count = ?"#,
        )
        .bind(retry_count as i64)
        .bind(format_ts(&next_attempt_at))
        .bind(error)
        .bind(step.map(|s| s.ordinal() as i64))
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(previous as i64)
        .execute(&self.writer)
        .await?;
        self.expect_one(id, result.rows_affected(), from).await
    }

    /// RETRY -> PENDING for one job. Returns whether the row moved.
    pub async fn promote_retry(&self, id: &JobId) -> Result<bool, EngineError> {
        ensure_allowed(JobStatus::Retry, JobStatus::Pending)?;
        let result = sqlx::query(
            "UPDATE jobs SET status = 'PENDING', next_attempt_at = NULL WHERE id = ? AND status = 'RETRY'",
        )
        .bind(id.to_string())
        .execute(&self.writer)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// RETRY -> PENDING for every job whose backoff has elapsed.
    pub async fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, EngineError> {
        let rows = sqlx::query(
            r#"UPDATE jobs
               SET status = 'PENDING', next_attempt_at = NULL
               WHERE status = 'RETRY' AND next_attempt_at <= ?
               RETURNING id"#,
        )
        .bind(format_ts(&now))
        .fetch_all(&self.writer)
        .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                parse_uuid(&id)
            })
            .collect()
    }

    /// `from` -> FAILED or FAILED_RECOVERED, keeping the error for post-mortem.
    pub async fn fail(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
        error: &str,
        step: Option<Step>,
    ) -> Result<(), EngineError> {
        if !matches!(to, JobStatus::Failed | JobStatus::FailedRecovered) {
            return Err(EngineError::IllegalTransition { from, to });
        }
        ensure_allowed(from, to)?;
        let now = format_ts(&Utc::now());
        let result = sqlx::query(
            r#"UPDATE jobs
               SET status = ?,
                   completed_at = COALESCE(completed_at, ?),
                   next_attempt_at = NULL,
                   error_message = ?,
                   last_error_step = COALESCE(?, last_error_step)
               WHERE id = ? AND status = ?"#,
        )
        .bind(to.as_str())
        .bind(&now)
        .bind(error)
        .bind(step.map(|s| s.ordinal() as i64))
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.writer)
        .await?;
        self.expect_one(id, result.rows_affected(), from).await
    }

    /// PENDING or SUSPENDED -> CANCELLED. Returns the status the job was in.
    pub async fn cancel(&self, id: &JobId) -> Result<JobStatus, EngineError> {
        let job = self.require_job(id).await?;
        ensure_allowed(job.status, JobStatus::Cancelled)?;
        let now = format_ts(&Utc::now());
        let result = sqlx::query(
            r#"UPDATE jobs
               SET status = 'CANCELLED',
                   completed_at = COALESCE(completed_at, ?),
                   next_attempt_at = NULL,
                   error_message = COALESCE(error_message, 'cancelled by operator')
               WHERE id = ? AND status = ?"#,
        )
        .bind(&now)
        .bind(id.to_string())
        .bind(job.status.as_str())
        .execute(&self.writer)
        .await?;
        self.expect_one(id, result.rows_affected(), job.status).await?;
        Ok(job.status)
    }

    // -----------------------------------------------------------------------
    // Step logs
    // -----------------------------------------------------------------------

    /// Append one log row. Timestamps are forced strictly increasing per job,
    /// so ordering by time and by insertion always agree.
    pub async fn append_log(
        &self,
        job_id: &JobId,
        entry: NewLogEntry,
    ) -> Result<JobLogEntry, EngineError> {
        let last: Option<String> = sqlx::query_scalar(
            "SELECT timestamp FROM job_logs WHERE job_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.writer)
        .await?;

        let mut timestamp = truncate_micros(Utc::now());
        if let Some(last) = last.as_deref().map(parse_ts).transpose()?
            && timestamp <= last
        {
            timestamp = last + chrono::Duration::microseconds(1);
        }

        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO job_logs
               (job_id, step_number, step_name, result, timestamp, duration_ms, error_message, detail)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               RETURNING id"#,
        )
        .bind(job_id.to_string())
        .bind(entry.step.ordinal() as i64)
        .bind(entry.step.label())
        .bind(entry.result.as_str())
        .bind(format_ts(&timestamp))
        .bind(entry.duration_ms)
        .bind(&entry.error_message)
        .bind(&entry.detail)
        .fetch_one(&self.writer)
        .await?;

        debug!(%job_id, step = %entry.step, result = %entry.result, "step logged");

        Ok(JobLogEntry {
            id,
            job_id: *job_id,
            step: entry.step,
            result: entry.result,
            timestamp,
            duration_ms: entry.duration_ms,
            error_message: entry.error_message,
            detail: entry.detail,
        })
    }

    pub async fn list_logs(&self, job_id: &JobId) -> Result<Vec<JobLogEntry>, EngineError> {
        let rows = sqlx::query("SELECT * FROM job_logs WHERE job_id = ? ORDER BY id ASC")
            .bind(job_id.to_string())
            .fetch_all(&self.reader)
            .await?;
        rows.iter().map(log_from_row).collect()
    }

    /// The latest `limit` log rows across all jobs, newest first.
    pub async fn recent_logs(&self, limit: u32) -> Result<Vec<JobLogEntry>, EngineError> {
        let rows = sqlx::query("SELECT * FROM job_logs ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.reader)
            .await?;
        rows.iter().map(log_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn expect_one(
        &self,
        id: &JobId,
        rows_affected: u64,
        expected: JobStatus,
    ) -> Result<(), EngineError> {
        if rows_affected == 1 {
            Ok(())
        } else {
            Err(self.conflict(id, expected.as_str()).await)
        }
    }

    /// Explain why a guarded update matched nothing.
    async fn conflict(&self, id: &JobId, expected: &str) -> EngineError {
        match self.get_job(id).await {
            Ok(Some(job)) => EngineError::StatusConflict {
                job_id: *id,
                expected: expected.to_string(),
                actual: job.status,
            },
            Ok(None) => EngineError::JobNotFound(*id),
            Err(e) => e,
        }
    }
}

fn ensure_allowed(from: JobStatus, to: JobStatus) -> Result<(), EngineError> {
    if StateMachine::can_transition(from, to) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition { from, to })
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

fn job_from_row(row: &SqliteRow) -> Result<Job, EngineError> {
    let id: String = row.try_get("id")?;
    let data: String = row.try_get("data")?;
    let status: String = row.try_get("status")?;
    let current_step: Option<i64> = row.try_get("current_step")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let created_at: String = row.try_get("created_at")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let next_attempt_at: Option<String> = row.try_get("next_attempt_at")?;
    let error_message: Option<String> = row.try_get("error_message")?;
    let last_error_step: Option<i64> = row.try_get("last_error_step")?;
    let verification_status: Option<String> = row.try_get("verification_status")?;

    Ok(Job {
        id: parse_uuid(&id)?,
        data: serde_json::from_str::<JobData>(&data)
            .map_err(|e| EngineError::InvalidStoredValue(format!("job data: {e}")))?,
        status: parse_status(&status)?,
        current_step: current_step.map(parse_step).transpose()?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| EngineError::InvalidStoredValue(format!("retry_count {retry_count}")))?,
        created_at: parse_ts(&created_at)?,
        started_at: started_at.as_deref().map(parse_ts).transpose()?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        next_attempt_at: next_attempt_at.as_deref().map(parse_ts).transpose()?,
        error_message,
        last_error_step: last_error_step.map(parse_step).transpose()?,
        verification_status: verification_status
            .as_deref()
            .map(|s| s.parse::<VerificationStatus>().map_err(EngineError::InvalidStoredValue))
            .transpose()?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<JobLogEntry, EngineError> {
    let job_id: String = row.try_get("job_id")?;
    let step_number: i64 = row.try_get("step_number")?;
    let result: String = row.try_get("result")?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(JobLogEntry {
        id: row.try_get("id")?,
        job_id: parse_uuid(&job_id)?,
        step: parse_step(step_number)?,
        result: result
            .parse::<StepResult>()
            .map_err(EngineError::InvalidStoredValue)?,
        timestamp: parse_ts(&timestamp)?,
        duration_ms: row.try_get("duration_ms")?,
        error_message: row.try_get("error_message")?,
        detail: row.try_get("detail")?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid, EngineError> {
    s.parse::<Uuid>()
        .map_err(|e| EngineError::InvalidStoredValue(format!("invalid UUID: {e}")))
}

fn parse_status(s: &str) -> Result<JobStatus, EngineError> {
    s.parse::<JobStatus>().map_err(EngineError::InvalidStoredValue)
}

fn parse_step(ordinal: i64) -> Result<Step, EngineError> {
    u8::try_from(ordinal)
        .ok()
        .and_then(Step::from_ordinal)
        .ok_or_else(|| EngineError::InvalidStoredValue(format!("step ordinal {ordinal}")))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::InvalidStoredValue(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps, so string comparison in SQL orders correctly.
fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn truncate_micros(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(dt.timestamp_micros()).unwrap_or(dt)
}
