//! Interface de terminal do jobflow: spinners e saída colorida.
//!
//! Usa `indicatif` para os spinners de progresso e `console` para cores.
//! O [`JobProgress`] acompanha um job até um status terminal; as funções
//! `print_*` formatam jobs, logs de passos e registros de auditoria.

use std::time::Duration;

use console::Style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::executor::StepExecutor;
use crate::state_machine::{AuditRecord, Job, JobId, JobLogEntry, JobStatus, Step, StepResult};

/// Cor associada a cada status de job.
pub fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::Failed | JobStatus::FailedRecovered => Style::new().red().bold(),
        JobStatus::Suspended | JobStatus::Retry => Style::new().yellow(),
        JobStatus::Running => Style::new().cyan(),
        JobStatus::Pending | JobStatus::Cancelled => Style::new().dim(),
    }
}

fn result_style(result: StepResult) -> Style {
    match result {
        StepResult::Success => Style::new().green(),
        StepResult::Failure => Style::new().red(),
        StepResult::Suspended => Style::new().yellow(),
    }
}

/// Indicador visual de progresso de um job no terminal.
pub struct JobProgress {
    pb: ProgressBar,
    label: String,
}

impl JobProgress {
    /// Inicia um spinner isolado.
    pub fn start(label: &str) -> Self {
        Self::with_bar(ProgressBar::new_spinner(), label)
    }

    /// Inicia um spinner dentro de um [`MultiProgress`], para vários jobs ao mesmo tempo.
    pub fn start_in(multi: &MultiProgress, label: &str) -> Self {
        Self::with_bar(multi.add(ProgressBar::new_spinner()), label)
    }

    fn with_bar(pb: ProgressBar, label: &str) -> Self {
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {prefix:.bold} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_prefix(label.to_string());
        pb.set_message("PENDING");
        pb.enable_steady_tick(Duration::from_millis(100));
        Self {
            pb,
            label: label.to_string(),
        }
    }

    /// Atualiza a mensagem do spinner com o status e o passo atual.
    pub fn update(&self, job: &Job) {
        let step = match job.current_step {
            Some(step) => format!(" step {}/{} {step}", step.ordinal(), Step::ALL.len()),
            None => String::new(),
        };
        let retry = if job.retry_count > 0 {
            format!(" (retry {})", job.retry_count)
        } else {
            String::new()
        };
        self.pb.set_message(format!(
            "{}{step}{retry}",
            status_style(job.status).apply_to(job.status)
        ));
    }

    /// Finaliza o spinner e imprime o resultado final do job.
    pub fn finish(&self, job: &Job) {
        let style = status_style(job.status);
        let mark = match job.status {
            JobStatus::Completed => "✓",
            JobStatus::Cancelled => "-",
            _ => "✗",
        };
        let detail = match (job.verification_status, &job.error_message) {
            (Some(v), _) => format!("verification {v}"),
            (None, Some(e)) => e.clone(),
            (None, None) => String::new(),
        };
        self.pb.finish_with_message(format!(
            "{} {} {detail}",
            style.apply_to(mark),
            style.apply_to(job.status)
        ));
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Acompanha o job até um status terminal, atualizando o spinner.
    pub async fn follow<E: StepExecutor>(
        &self,
        engine: &Engine<E>,
        id: JobId,
    ) -> Result<Job, EngineError> {
        loop {
            let job = engine.get_job_status(id).await?;
            if job.status.is_terminal() {
                self.finish(&job);
                return Ok(job);
            }
            self.update(&job);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Imprime um job em formato de ficha.
pub fn print_job(job: &Job) {
    let dim = Style::new().dim();
    println!("{} {}", dim.apply_to("job       "), job.id);
    println!(
        "{} {}",
        dim.apply_to("status    "),
        status_style(job.status).apply_to(job.status)
    );
    println!("{} {}", dim.apply_to("source    "), job.data.source_file);
    if let Some(step) = job.current_step {
        println!("{} {} ({})", dim.apply_to("step      "), step, step.ordinal());
    }
    println!("{} {}", dim.apply_to("retries   "), job.retry_count);
    if let Some(v) = job.verification_status {
        println!("{} {v}", dim.apply_to("verified  "));
    }
    if let Some(next) = job.next_attempt_at {
        println!("{} {}", dim.apply_to("next try  "), next.to_rfc3339());
    }
    if let Some(error) = &job.error_message {
        let step = job
            .last_error_step
            .map(|s| format!(" [{s}]"))
            .unwrap_or_default();
        println!("{} {}{step}", dim.apply_to("error     "), Style::new().red().apply_to(error));
    }
    if let Some(ms) = job.duration_ms() {
        println!("{} {ms} ms", dim.apply_to("duration  "));
    }
}

/// Uma linha por job, do mais recente para o mais antigo.
pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("{}", Style::new().dim().apply_to("no jobs"));
        return;
    }
    for job in jobs {
        let step = job
            .current_step
            .map(|s| format!("{:>2}/{}", s.ordinal(), Step::ALL.len()))
            .unwrap_or_else(|| "  -".to_string());
        println!(
            "{}  {:<16}  {step}  retries {}  {}",
            job.id,
            status_style(job.status).apply_to(job.status),
            job.retry_count,
            job.data.source_file
        );
    }
}

/// Imprime o log de passos em ordem de execução.
pub fn print_logs(logs: &[JobLogEntry]) {
    for entry in logs {
        println!("{}", log_line(entry));
    }
}

/// Log recente de todos os jobs, com o id do job em cada linha.
pub fn print_recent_logs(logs: &[JobLogEntry]) {
    if logs.is_empty() {
        println!("{}", Style::new().dim().apply_to("no step logs"));
        return;
    }
    for entry in logs {
        println!("{}  {}", Style::new().dim().apply_to(entry.job_id), log_line(entry));
    }
}

fn log_line(entry: &JobLogEntry) -> String {
    let error = entry
        .error_message
        .as_deref()
        .map(|e| format!("  {}", Style::new().red().apply_to(e)))
        .unwrap_or_default();
    let detail = entry
        .detail
        .as_deref()
        .map(|d| format!("  -> {d}"))
        .unwrap_or_default();
    format!(
        "{}  {:>2} {:<26} {:<9} {:>6} ms{detail}{error}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        entry.step.ordinal(),
        entry.step.label(),
        result_style(entry.result).apply_to(entry.result),
        entry.duration_ms
    )
}

pub fn print_counts(counts: &[(JobStatus, i64)]) {
    for (status, n) in counts {
        println!("{:<16} {n}", status_style(*status).apply_to(status));
    }
}

/// Imprime o registro de auditoria formatado em JSON com estilo colorido.
pub fn print_audit(record: &AuditRecord) {
    println!();
    println!(
        "{}",
        status_style(record.status).apply_to("─── Audit Record ───")
    );
    println!(
        "{}",
        serde_json::to_string_pretty(record).unwrap_or_default()
    );
}
