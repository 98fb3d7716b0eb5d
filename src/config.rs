//! Configuração do jobflow carregada a partir de `jobflow.toml`.
//!
//! A struct [`EngineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `JOBFLOW_DATABASE_URL` e `JOBFLOW_EXECUTOR_URL`
//! têm precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// Configuração de nível superior carregada de `jobflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// URL do banco SQLite onde jobs e logs são persistidos.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Número de slots concorrentes do pool de workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Máximo de retentativas antes de marcar um job como falho.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Teto do atraso de backoff em milissegundos.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Tempo que um job suspenso espera pelo código OTP.
    #[serde(default = "default_otp_timeout_secs")]
    pub otp_timeout_secs: u64,

    /// Intervalo da varredura de tickets expirados.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Intervalo de consulta ao banco por jobs prontos.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Na recuperação, reenfileira jobs interrompidos que ainda têm retentativas.
    #[serde(default)]
    pub requeue_interrupted: bool,

    /// Endereço do serviço externo que executa os passos.
    #[serde(default)]
    pub executor_url: Option<String>,
}

// Valor padrão do banco: arquivo local no diretório atual.
fn default_database_url() -> String {
    "sqlite://jobflow.db".to_string()
}

// Um operador, um slot.
fn default_workers() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

// Valor padrão para o atraso base: 60s.
fn default_base_delay_ms() -> u64 {
    60_000
}

// Valor padrão para o teto: 1h.
fn default_max_delay_ms() -> u64 {
    3_600_000
}

// Valor padrão para a espera do OTP: 5 minutos.
fn default_otp_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            workers: default_workers(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            otp_timeout_secs: default_otp_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            requeue_interrupted: false,
            executor_url: None,
        }
    }
}

impl EngineConfig {
    /// Carrega a configuração de `jobflow.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, EngineError> {
        Self::load_from(Path::new("jobflow.toml"))
    }

    /// Carrega a configuração de um caminho explícito, com os mesmos fallbacks.
    pub fn load_from(path: &Path) -> Result<Self, EngineError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<EngineConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo.
        if let Ok(url) = std::env::var("JOBFLOW_DATABASE_URL")
            && !url.is_empty()
        {
            config.database_url = url;
        }
        if let Ok(url) = std::env::var("JOBFLOW_EXECUTOR_URL")
            && !url.is_empty()
        {
            config.executor_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        if self.otp_timeout_secs == 0 {
            return Err(EngineError::Config("otp_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn otp_timeout(&self) -> Duration {
        Duration::from_secs(self.otp_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
