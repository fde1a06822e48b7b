//! taskloopd - autonomous task loop
//!
//! Main entry point for the binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Args, Parser, Subcommand};
use eyre::WrapErr;
use std::io::Write;
use std::path::PathBuf;
use taskloop_core::config::DEFAULT_CONFIG_PATH;
use taskloop_core::{Config, EngineEvent, ErrorStrategy, OutputStream};
use taskloopd::storage::Storage;
use taskloopd::Daemon;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "taskloopd", about = "Run an AI coding agent over a task backlog", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work through the backlog until it is done or a stop condition hits
    Run(RunArgs),
    /// Show the latest session for a working directory
    Status {
        /// Working directory (defaults to the current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Extra config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Extra config file, applied after .taskloop/config
    #[arg(long)]
    config: Option<PathBuf>,
    /// Working directory (defaults to the current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Iteration cap (0 = unlimited)
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Error strategy: retry, skip or abort
    #[arg(long)]
    strategy: Option<ErrorStrategy>,
    /// Model passed to the agent
    #[arg(long)]
    model: Option<String>,
    /// Task file
    #[arg(long)]
    tracker: Option<PathBuf>,
}

/// Defaults, then `<cwd>/.taskloop/config`, then `--config`.
fn load_config(cwd: Option<PathBuf>, extra: Option<&PathBuf>) -> eyre::Result<Config> {
    let cwd = match cwd {
        Some(dir) => dir,
        None => std::env::current_dir().wrap_err("failed to read current directory")?,
    };
    let cwd = cwd
        .canonicalize()
        .wrap_err_with(|| format!("invalid working directory {}", cwd.display()))?;

    let mut config = Config::default();
    let default_file = cwd.join(DEFAULT_CONFIG_PATH);
    if default_file.exists() {
        config
            .load_file(&default_file)
            .wrap_err_with(|| format!("failed to load {}", default_file.display()))?;
    }
    if let Some(path) = extra {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?;
    }
    config.cwd = cwd;
    Ok(config)
}

fn echo_event(event: &EngineEvent) {
    match event {
        EngineEvent::AgentOutput { stream, data, .. } => {
            let written = match stream {
                OutputStream::Stdout => {
                    let mut out = std::io::stdout().lock();
                    out.write_all(data.as_bytes()).and_then(|()| out.flush())
                }
                OutputStream::Stderr => std::io::stderr().lock().write_all(data.as_bytes()),
            };
            if let Err(err) = written {
                warn!(error = %err, "failed to echo agent output");
            }
        }
        EngineEvent::IterationStarted { iteration, task, .. } => {
            info!(iteration, task_id = %task.id, title = %task.title, "iteration started");
        }
        EngineEvent::IterationCompleted { result, .. } => {
            info!(
                iteration = result.iteration,
                status = result.status.as_str(),
                task_completed = result.task_completed,
                duration_ms = result.duration_ms,
                "iteration finished"
            );
        }
        EngineEvent::EngineStopped {
            reason,
            total_iterations,
            tasks_completed,
            ..
        } => {
            info!(
                reason = reason.as_str(),
                total_iterations, tasks_completed, "run finished"
            );
        }
        _ => {}
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

async fn run(args: RunArgs) -> eyre::Result<()> {
    let mut config = load_config(args.cwd, args.config.as_ref())?;
    if let Some(max) = args.max_iterations {
        config.max_iterations = max;
    }
    if let Some(strategy) = args.strategy {
        config.error_handling.strategy = strategy;
    }
    if let Some(model) = args.model {
        config.model = Some(model);
    }
    if let Some(tracker) = args.tracker {
        config.tracker_file = tracker;
    }

    let daemon = Daemon::new(config)
        .await
        .wrap_err("failed to start taskloopd")?;
    daemon.engine().subscribe(echo_event).detach();

    let run = daemon.run();
    tokio::pin!(run);

    let outcome = tokio::select! {
        result = &mut run => result,
        signal = shutdown_signal() => {
            match signal {
                Ok(name) => {
                    info!(signal = name, "received signal, stopping after the current iteration");
                    daemon.shutdown().await;
                }
                Err(err) => warn!(error = %err, "failed to register signal handlers"),
            }
            run.await
        }
    };

    outcome.wrap_err("run failed")
}

async fn status(cwd: Option<PathBuf>, extra: Option<PathBuf>) -> eyre::Result<()> {
    let config = load_config(cwd, extra.as_ref())?;
    let storage = Storage::new(&config.resolve(&config.session_db)).await?;
    storage.migrate_embedded().await?;

    let Some(session) = storage.latest_session(&config.cwd).await? else {
        println!("no sessions recorded for {}", config.cwd.display());
        return Ok(());
    };

    println!("session:         {}", session.id);
    println!("status:          {}", session.status.as_str());
    println!("iterations:      {}", session.iteration);
    println!("tasks completed: {}", session.tasks_completed);
    println!("started:         {}", session.created_at.to_rfc3339());
    println!("updated:         {}", session.updated_at.to_rfc3339());

    for record in storage.list_iterations(&session.id).await? {
        println!(
            "  #{:<3} {:<12} {:<11} {}ms{}",
            record.iteration,
            record.task_id,
            record.status,
            record.duration_ms,
            record
                .error
                .as_deref()
                .map(|e| format!("  {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        match cli.command {
            Command::Run(args) => run(args).await,
            Command::Status { cwd, config } => status(cwd, config).await,
        }
    })
}
