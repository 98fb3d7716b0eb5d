use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::error::ExecutorError;
use super::types::{OpenSessionRequest, OpenSessionResponse, StepRequest, StepResponse};
use super::{StepExecutor, StepSession};
use crate::state_machine::{Job, JobData, JobId, Step, StepFailure, StepOutcome};

/// Drives steps through an external step-driver service over HTTP.
pub struct HttpStepExecutor {
    client: Client,
    base_url: String,
}

impl HttpStepExecutor {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ExecutorError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn open(&self, job_id: JobId) -> Result<HttpSession, ExecutorError> {
        let url = format!("{}/sessions", self.base_url);
        let resp: OpenSessionResponse =
            post_json(&self.client, &url, &OpenSessionRequest { job_id }).await?;
        debug!(%job_id, session_id = %resp.session_id, "executor session opened");
        Ok(HttpSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            session_id: resp.session_id,
            job_id,
        })
    }
}

impl StepExecutor for HttpStepExecutor {
    type Session = HttpSession;

    async fn open_session(&self, job: &Job) -> Result<HttpSession, StepFailure> {
        self.open(job.id).await.map_err(ExecutorError::into_failure)
    }
}

/// One remote session, bound to a single job attempt.
pub struct HttpSession {
    client: Client,
    base_url: String,
    session_id: String,
    job_id: JobId,
}

impl HttpSession {
    async fn run_step(
        &self,
        data: &JobData,
        step: Step,
        resume_input: Option<&str>,
    ) -> Result<StepResponse, ExecutorError> {
        let url = format!("{}/sessions/{}/steps", self.base_url, self.session_id);
        let req = StepRequest {
            job_id: self.job_id,
            step,
            step_number: step.ordinal(),
            data,
            resume_input,
        };
        post_json(&self.client, &url, &req).await
    }
}

impl StepSession for HttpSession {
    async fn execute(
        &mut self,
        data: &JobData,
        step: Step,
        resume_input: Option<&str>,
    ) -> StepOutcome {
        match self.run_step(data, step, resume_input).await {
            Ok(resp) => resp.into(),
            Err(e) => StepOutcome::Failure(e.into_failure()),
        }
    }

    async fn close(self) {
        let url = format!("{}/sessions/{}", self.base_url, self.session_id);
        match self.client.delete(&url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND => {
                debug!(job_id = %self.job_id, session_id = %self.session_id, "executor session closed");
            }
            Ok(resp) => {
                warn!(job_id = %self.job_id, status = resp.status().as_u16(), "executor session close rejected");
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "executor session close failed");
            }
        }
    }
}

async fn post_json<B, R>(client: &Client, url: &str, body: &B) -> Result<R, ExecutorError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let response = client.post(url).json(body).send().await?;
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(1000);
        return Err(ExecutorError::RateLimited {
            retry_after_ms: retry_after,
        });
    }

    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(ExecutorError::ApiError {
            status: status.as_u16(),
            message,
        });
    }

    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| ExecutorError::InvalidResponse(e.to_string()))
}
