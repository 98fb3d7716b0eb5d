//! Tipos de dados trocados com o serviço executor de passos.
//!
//! Requisições derivam `Serialize` e respostas derivam `Deserialize`,
//! seguindo o contrato JSON dos endpoints `/sessions` e `/sessions/{id}/steps`.

use serde::{Deserialize, Serialize};

use crate::state_machine::{JobData, JobId, Step, StepFailure, StepOutcome};

/// Corpo de `POST /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub job_id: JobId,
}

/// Resposta de `POST /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
}

/// Corpo de `POST /sessions/{id}/steps`.
#[derive(Debug, Clone, Serialize)]
pub struct StepRequest<'a> {
    pub job_id: JobId,
    pub step: Step,
    pub step_number: u8,
    pub data: &'a JobData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_input: Option<&'a str>,
}

/// Resposta de um passo, discriminada pelo campo `outcome`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepResponse {
    Success {
        #[serde(default)]
        result: Option<String>,
    },
    Failure {
        error: String,
        /// Rejeição definitiva do alvo; o padrão é falha transitória.
        #[serde(default)]
        fatal: bool,
    },
    Suspended,
}

impl From<StepResponse> for StepOutcome {
    fn from(response: StepResponse) -> Self {
        match response {
            StepResponse::Success { result } => StepOutcome::Success(result),
            StepResponse::Failure { error, fatal: true } => {
                StepOutcome::Failure(StepFailure::fatal(error))
            }
            StepResponse::Failure { error, fatal: false } => {
                StepOutcome::Failure(StepFailure::transient(error))
            }
            StepResponse::Suspended => StepOutcome::Suspended,
        }
    }
}
