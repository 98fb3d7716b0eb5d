/// Idempotent schema applied on every connect.
///
/// `job_logs` is append-only: updates are always rejected and deletes are
/// rejected while the owning job still exists.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                  TEXT PRIMARY KEY NOT NULL,
    data                TEXT NOT NULL,
    status              TEXT NOT NULL CHECK (status IN (
                            'PENDING', 'RUNNING', 'SUSPENDED', 'RETRY',
                            'COMPLETED', 'FAILED', 'FAILED_RECOVERED', 'CANCELLED')),
    current_step        INTEGER CHECK (current_step IS NULL OR current_step BETWEEN 1 AND 12),
    retry_count         INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    completed_at        TEXT,
    next_attempt_at     TEXT,
    error_message       TEXT,
    last_error_step     INTEGER,
    verification_status TEXT CHECK (verification_status IS NULL OR verification_status IN (
                            'VERIFIED', 'PENDING', 'SUBMITTED', 'REJECTED', 'ERROR'))
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs (status, created_at);

CREATE TABLE IF NOT EXISTS job_logs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id        TEXT NOT NULL REFERENCES jobs (id),
    step_number   INTEGER NOT NULL CHECK (step_number BETWEEN 1 AND 12),
    step_name     TEXT NOT NULL,
    result        TEXT NOT NULL CHECK (result IN ('SUCCESS', 'FAILURE', 'SUSPENDED')),
    timestamp     TEXT NOT NULL,
    duration_ms   INTEGER NOT NULL,
    error_message TEXT,
    detail        TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs (job_id, id);

CREATE TRIGGER IF NOT EXISTS job_logs_no_update
BEFORE UPDATE ON job_logs
BEGIN
    SELECT RAISE(ABORT, 'job_logs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS job_logs_no_delete
BEFORE DELETE ON job_logs
WHEN EXISTS (SELECT 1 FROM jobs WHERE id = OLD.job_id)
BEGIN
    SELECT RAISE(ABORT, 'job_logs rows live as long as their job');
END;
"#;
