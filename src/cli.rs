//! Interface de linha de comando do jobflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, submit, status,
//! logs, list, cancel, demo) e flags globais (--config, --workers,
//! --max-retries, -v).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use jobflow::state_machine::JobStatus;

/// jobflow: orquestrador durável de jobs com passos externos.
#[derive(Debug, Parser)]
#[command(name = "jobflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./jobflow.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Número de workers concorrentes; sobrepõe a configuração.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Número máximo de retentativas em caso de falha.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Aumenta o detalhamento dos logs (-v, -vv).
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Filtro de status aceito por `list`.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    Running,
    Suspended,
    Retry,
    Completed,
    Failed,
    FailedRecovered,
    Cancelled,
}

impl From<StatusArg> for JobStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => JobStatus::Pending,
            StatusArg::Running => JobStatus::Running,
            StatusArg::Suspended => JobStatus::Suspended,
            StatusArg::Retry => JobStatus::Retry,
            StatusArg::Completed => JobStatus::Completed,
            StatusArg::Failed => JobStatus::Failed,
            StatusArg::FailedRecovered => JobStatus::FailedRecovered,
            StatusArg::Cancelled => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inicia o engine: recuperação, pool de workers e prompt do operador.
    ///
    /// Linhas aceitas na entrada padrão: `otp <job_id> <código>`,
    /// `cancel <job_id>`, `status <job_id>`.
    Run,

    /// Cria um job PENDING a partir de um registro JSON.
    Submit {
        /// Arquivo JSON com os dados do job.
        file: PathBuf,
    },

    /// Mostra o status de um job.
    Status { job_id: Uuid },

    /// Mostra o log de passos de um job, em ordem.
    Logs {
        #[arg(required_unless_present = "recent")]
        job_id: Option<Uuid>,

        /// Mostra as N entradas mais recentes de todos os jobs.
        #[arg(long, conflicts_with = "job_id")]
        recent: Option<u32>,
    },

    /// Lista jobs, do mais recente para o mais antigo.
    List {
        /// Filtra por status.
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Máximo de jobs exibidos.
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },

    /// Cancela um job PENDING ou SUSPENDED.
    Cancel { job_id: Uuid },

    /// Executa a demonstração embutida com o executor simulado.
    Demo,
}
