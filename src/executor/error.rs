//! Tipos de erro para o cliente HTTP do executor de passos.
//!
//! Define [`ExecutorError`] com variantes para rate limiting, erros do
//! serviço, respostas inválidas e erros de rede. Cada erro é convertido em
//! uma [`StepFailure`] transitória ou fatal para a política de retentativa.

use thiserror::Error;

use crate::state_machine::StepFailure;

/// Erros que podem ocorrer ao falar com o serviço executor de passos.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// O servidor retornou HTTP 429 (rate limit).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro retornado pelo serviço (4xx/5xx), com o corpo da resposta.
    #[error("executor error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// O corpo da resposta não segue o contrato.
    #[error("invalid executor response: {0}")]
    InvalidResponse(String),

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl ExecutorError {
    /// Rate limits, server errors and network trouble may clear up on retry;
    /// client errors and contract violations will not.
    pub fn into_failure(self) -> StepFailure {
        let transient = match &self {
            ExecutorError::RateLimited { .. } | ExecutorError::NetworkError(_) => true,
            ExecutorError::ApiError { status, .. } => *status >= 500 || *status == 408,
            ExecutorError::InvalidResponse(_) => false,
        };
        if transient {
            StepFailure::transient(self.to_string())
        } else {
            StepFailure::fatal(self.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::FailureKind;

    #[test]
    fn rate_limited_display() {
        let err = ExecutorError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn classification() {
        let server = ExecutorError::ApiError {
            status: 503,
            message: "busy".into(),
        };
        assert_eq!(server.into_failure().kind, FailureKind::Transient);

        let rejected = ExecutorError::ApiError {
            status: 422,
            message: "schema rejected".into(),
        };
        let failure = rejected.into_failure();
        assert_eq!(failure.kind, FailureKind::Fatal);
        assert_eq!(failure.message, "executor error (status 422): schema rejected");

        let garbage = ExecutorError::InvalidResponse("expected outcome".into());
        assert_eq!(garbage.into_failure().kind, FailureKind::Fatal);

        let limited = ExecutorError::RateLimited { retry_after_ms: 1 };
        assert_eq!(limited.into_failure().kind, FailureKind::Transient);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ExecutorError>();
    }
}
