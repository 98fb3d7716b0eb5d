mod cli;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use console::Style;
use indicatif::MultiProgress;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cli::{Cli, Command};
use jobflow::executor::{HttpStepExecutor, SimulatedExecutor, StepExecutor};
use jobflow::state_machine::{Job, JobData};
use jobflow::store::Store;
use jobflow::ui::{self, JobProgress};
use jobflow::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info,jobflow=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    config.validate()?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Submit { file } => submit(&config, &file).await,
        Command::Status { job_id } => {
            let store = Store::connect(&config.database_url).await?;
            ui::print_job(&store.require_job(&job_id).await?);
            Ok(())
        }
        Command::Logs { job_id, recent } => {
            let store = Store::connect(&config.database_url).await?;
            match (job_id, recent) {
                (Some(job_id), _) => {
                    store.require_job(&job_id).await?;
                    ui::print_logs(&store.list_logs(&job_id).await?);
                }
                (None, Some(limit)) => ui::print_recent_logs(&store.recent_logs(limit).await?),
                (None, None) => bail!("logs needs a job id or --recent"),
            }
            Ok(())
        }
        Command::List { status, limit } => {
            let store = Store::connect(&config.database_url).await?;
            ui::print_jobs(&store.list_jobs(status.map(Into::into), limit).await?);
            println!();
            ui::print_counts(&store.count_by_status().await?);
            Ok(())
        }
        Command::Cancel { job_id } => {
            let store = Store::connect(&config.database_url).await?;
            let previous = store.cancel(&job_id).await?;
            println!("cancelled {job_id} (was {previous})");
            Ok(())
        }
        Command::Demo => demo(config).await,
    }
}

async fn run(config: EngineConfig) -> Result<()> {
    match config.executor_url.clone() {
        Some(url) => {
            info!(%url, "using HTTP step executor");
            let executor = HttpStepExecutor::new(url)?;
            serve(config, executor).await
        }
        None => {
            warn!("no executor_url configured, using the simulated executor");
            let executor = SimulatedExecutor {
                suspend_for_otp: true,
                ..SimulatedExecutor::default()
            };
            serve(config, executor).await
        }
    }
}

/// Runs the engine in the foreground and reads operator commands from stdin.
async fn serve<E: StepExecutor>(config: EngineConfig, executor: E) -> Result<()> {
    let workers = config.workers;
    let engine = Engine::open(config, executor).await?;
    let handle = engine.start().await?;

    let recovery = handle.recovery();
    if recovery.total() > 0 {
        println!(
            "{} recovered {} interrupted job(s), requeued {}",
            Style::new().yellow().apply_to("!"),
            recovery.recovered.len(),
            recovery.requeued.len()
        );
    }
    println!("jobflow running with {workers} worker(s); Ctrl-C to stop");
    println!("commands: otp <job_id> <code> | cancel <job_id> | status <job_id> | waiting");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = engine.stopped() => break,
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if let Err(e) = operator_command(&engine, &line).await {
                        eprintln!("{} {e:#}", Style::new().red().apply_to("✗"));
                    }
                }
                None => stdin_open = false,
            },
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn operator_command<E: StepExecutor>(engine: &Engine<E>, line: &str) -> Result<()> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => Ok(()),
        ["otp", id, code] => {
            let id = parse_id(id)?;
            engine.resume_job(id, *code).await?;
            println!("resumed {id}");
            Ok(())
        }
        ["cancel", id] => {
            let id = parse_id(id)?;
            let previous = engine.cancel_job(id).await?;
            println!("cancelled {id} (was {previous})");
            Ok(())
        }
        ["status", id] => {
            let job = engine.get_job_status(parse_id(id)?).await?;
            ui::print_job(&job);
            Ok(())
        }
        ["waiting"] => {
            let tickets = engine.open_tickets();
            if tickets.is_empty() {
                println!("no jobs waiting for input");
            }
            for ticket in tickets {
                println!(
                    "{}  {}  expires {}",
                    ticket.job_id,
                    ticket.step,
                    ticket.deadline.to_rfc3339()
                );
            }
            Ok(())
        }
        _ => bail!("unrecognised command: {line}"),
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("invalid job id: {raw}"))
}

/// Inserts one PENDING job. A running engine picks it up on its next poll.
async fn submit(config: &EngineConfig, file: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let mut value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    let Some(record) = value.as_object_mut() else {
        bail!("{} must contain a JSON object", file.display());
    };
    record
        .entry("source_file")
        .or_insert_with(|| file.display().to_string().into());
    let data: JobData = serde_json::from_value(value).context("invalid job data record")?;

    let store = Store::connect(&config.database_url).await?;
    let job = Job::new(data);
    store.insert_job(&job).await?;
    println!("{}", job.id);
    Ok(())
}

/// Three jobs on an in-memory store with the simulated executor. The demo
/// plays the operator and answers every OTP prompt itself.
async fn demo(config: EngineConfig) -> Result<()> {
    let config = EngineConfig {
        database_url: "sqlite::memory:".to_string(),
        workers: config.workers.max(2),
        base_delay_ms: 200,
        max_delay_ms: 2_000,
        otp_timeout_secs: 30,
        sweep_interval_ms: 200,
        poll_interval_ms: 200,
        requeue_interrupted: false,
        executor_url: None,
        ..config
    };
    let executor = SimulatedExecutor {
        suspend_for_otp: true,
        step_delay: Duration::from_millis(120),
        ..SimulatedExecutor::default()
    };
    let store = Store::in_memory().await?;
    let engine = Engine::new(config, store, executor);
    let handle = engine.start().await?;

    let multi = MultiProgress::new();
    let mut followers = Vec::new();
    for (source, name) in [
        ("alice.json", "Alice"),
        ("bob.json", "Bob"),
        ("carol.json", "Carol"),
    ] {
        let data = JobData {
            name: Some(name.to_string()),
            email: Some(format!("{}@example.com", name.to_lowercase())),
            ..JobData::new(source)
        };
        let id = engine.submit_job(data).await?;
        let progress = JobProgress::start_in(&multi, source);
        let engine = engine.clone();
        followers.push(tokio::spawn(async move { progress.follow(&engine, id).await }));
    }

    let operator = {
        let engine = engine.clone();
        tokio::spawn(async move {
            loop {
                for ticket in engine.open_tickets() {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    if let Err(e) = engine.resume_job(ticket.job_id, "424242").await {
                        warn!(job_id = %ticket.job_id, error = %e, "demo operator could not resume");
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    let mut finished = Vec::new();
    for follower in followers {
        finished.push(follower.await??);
    }
    operator.abort();
    handle.shutdown().await?;

    for job in finished {
        ui::print_audit(&engine.audit(job.id).await?);
    }
    Ok(())
}
