use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::Step;

pub type JobId = Uuid;

/// Distinguishes failures worth another attempt from deterministic rejections.
/// Both go through the retry policy; fatal ones are expected to exhaust it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Network timeout, element not ready, executor unavailable.
    Transient,
    /// Target-side rejection that will not change on retry.
    Fatal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

/// What a step executor reports back for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// The step finished; `result` is the executor's optional result text.
    Success(Option<String>),
    Failure(StepFailure),
    /// The step needs operator input before it can finish.
    Suspended,
}

/// Lifecycle status of a job as persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Suspended,
    Retry,
    Completed,
    Failed,
    FailedRecovered,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Suspended,
        JobStatus::Retry,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::FailedRecovered,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Suspended => "SUSPENDED",
            JobStatus::Retry => "RETRY",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::FailedRecovered => "FAILED_RECOVERED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::FailedRecovered
                | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Verification outcome extracted by the status step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Verified,
    Pending,
    Submitted,
    Rejected,
    Error,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Verified => "VERIFIED",
            VerificationStatus::Pending => "PENDING",
            VerificationStatus::Submitted => "SUBMITTED",
            VerificationStatus::Rejected => "REJECTED",
            VerificationStatus::Error => "ERROR",
        }
    }

    /// Maps whatever the status step extracted onto the closed set.
    /// Anything unrecognised (or missing) becomes `Error` instead of failing the job.
    pub fn from_extracted(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_uppercase()).as_deref() {
            Some("VERIFIED") => VerificationStatus::Verified,
            Some("PENDING") => VerificationStatus::Pending,
            Some("SUBMITTED") => VerificationStatus::Submitted,
            Some("REJECTED") => VerificationStatus::Rejected,
            _ => VerificationStatus::Error,
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    /// Strict parse used when reading the store; unlike `from_extracted` it never coerces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VERIFIED" => Ok(VerificationStatus::Verified),
            "PENDING" => Ok(VerificationStatus::Pending),
            "SUBMITTED" => Ok(VerificationStatus::Submitted),
            "REJECTED" => Ok(VerificationStatus::Rejected),
            "ERROR" => Ok(VerificationStatus::Error),
            other => Err(format!("unknown verification status: {other}")),
        }
    }
}

/// The ingested record a job works on. Validated before it reaches the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobData {
    /// File the record was ingested from.
    pub source_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl JobData {
    pub fn new(source_file: impl Into<String>) -> Self {
        Self {
            source_file: source_file.into(),
            ..Default::default()
        }
    }
}

/// A single unit of work in the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub data: JobData,
    pub status: JobStatus,
    /// Last attempted step; `None` before the first step of an attempt.
    pub current_step: Option<Step>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a job in RETRY may go back to PENDING.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub last_error_step: Option<Step>,
    pub verification_status: Option<VerificationStatus>,
}

impl Job {
    pub fn new(data: JobData) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            status: JobStatus::Pending,
            current_step: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            error_message: None,
            last_error_step: None,
            verification_status: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Outcome recorded for one step execution in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepResult {
    Success,
    Failure,
    Suspended,
}

impl StepResult {
    pub fn as_str(self) -> &'static str {
        match self {
            StepResult::Success => "SUCCESS",
            StepResult::Failure => "FAILURE",
            StepResult::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(StepResult::Success),
            "FAILURE" => Ok(StepResult::Failure),
            "SUSPENDED" => Ok(StepResult::Suspended),
            other => Err(format!("unknown step result: {other}")),
        }
    }
}

/// One append-only row of a job's step log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub job_id: JobId,
    pub step: Step,
    pub result: StepResult,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub detail: Option<String>,
}

/// A log row before the store assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogEntry {
    pub step: Step,
    pub result: StepResult,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub detail: Option<String>,
}

impl NewLogEntry {
    pub fn success(step: Step, duration_ms: i64, detail: Option<String>) -> Self {
        Self {
            step,
            result: StepResult::Success,
            duration_ms,
            error_message: None,
            detail,
        }
    }

    pub fn failure(step: Step, duration_ms: i64, error: impl Into<String>) -> Self {
        Self {
            step,
            result: StepResult::Failure,
            duration_ms,
            error_message: Some(error.into()),
            detail: None,
        }
    }

    pub fn suspended(step: Step, duration_ms: i64) -> Self {
        Self {
            step,
            result: StepResult::Suspended,
            duration_ms,
            error_message: None,
            detail: None,
        }
    }
}

/// Post-mortem summary of a job and its step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub verification_status: Option<VerificationStatus>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub last_error_step: Option<Step>,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub suspensions: usize,
}

impl AuditRecord {
    pub fn from_job(job: &Job, logs: &[JobLogEntry]) -> Self {
        let count = |result: StepResult| logs.iter().filter(|e| e.result == result).count();
        Self {
            job_id: job.id,
            status: job.status,
            verification_status: job.verification_status,
            retry_count: job.retry_count,
            started_at: job.started_at,
            completed_at: job.completed_at,
            duration_ms: job.duration_ms(),
            error_message: job.error_message.clone(),
            last_error_step: job.last_error_step,
            steps_succeeded: count(StepResult::Success),
            steps_failed: count(StepResult::Failure),
            suspensions: count(StepResult::Suspended),
        }
    }
}
