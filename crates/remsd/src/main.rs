//! remsd — the REMS ops daemon.
//!
//! Assembles the bootstrap procedure and the command dispatcher from
//! `rems.toml` plus the deployment environment, then either serves them over
//! HTTP or runs one of them once and exits with a status that scripts can
//! act on.
//!
//! # Usage
//!
//! ```text
//! remsd serve --config rems.toml --listen 0.0.0.0:8080
//! remsd bootstrap --config rems.toml --secret-name RemsDatabaseSecret
//! remsd run --config rems.toml --timeout 10m -- bin/rems db:migrate
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use rems_api::ApiState;
use rems_bootstrap::{BootstrapProcedure, BootstrapRequest};
use rems_core::{RemsConfig, parse_duration};
use rems_dispatch::{
    CommandDispatcher, CommandRequest, ContainerCliRunner, DispatchOutcome, DispatchTarget,
    ExecutionState, PollPolicy,
};

/// Exit status when the time budget ran out, as with coreutils `timeout`.
const EXIT_TIMED_OUT: u8 = 124;
const EXIT_SUBMIT_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "remsd", about = "REMS ops daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the bootstrap and command endpoints over HTTP.
    Serve {
        /// Path to rems.toml. Without it, defaults plus environment apply.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to listen on; overrides `[server] listen`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Ensure the service role and database exist, then exit.
    Bootstrap {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Name of the secret holding the service role's password.
        #[arg(long)]
        secret_name: String,
    },
    /// Run one admin command as an ephemeral task and wait for it.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Time budget, e.g. `90s` or `10m`; can only tighten the configured one.
        #[arg(long)]
        timeout: Option<String>,

        /// Command and arguments passed to the task.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve { config, listen } => {
            let config = load_config(config.as_deref())?;
            serve(config, listen).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Bootstrap {
            config,
            secret_name,
        } => {
            let config = load_config(config.as_deref())?;
            run_bootstrap(&config, &secret_name).await
        }
        Command::Run {
            config,
            timeout,
            command,
        } => {
            let config = load_config(config.as_deref())?;
            run_command(&config, timeout.as_deref(), command).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,remsd=debug,rems=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// File (if any), then the deployment environment on top.
fn load_config(path: Option<&Path>) -> anyhow::Result<RemsConfig> {
    let mut config = match path {
        Some(path) => RemsConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RemsConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

/// Configuration errors only; the database is not contacted until `run`.
fn build_bootstrap(config: &RemsConfig) -> anyhow::Result<BootstrapProcedure> {
    config
        .bootstrap
        .validate()
        .context("invalid [bootstrap] configuration")?;
    Ok(BootstrapProcedure::from_settings(&config.bootstrap)
        .context("failed to initialise bootstrap procedure")?)
}

fn build_dispatcher(config: &RemsConfig) -> anyhow::Result<CommandDispatcher> {
    let settings = &config.dispatch;
    let target = DispatchTarget::from_settings(settings).context("invalid [dispatch] configuration")?;
    let policy = PollPolicy::from_settings(settings).context("invalid [dispatch] configuration")?;
    let mut runner = ContainerCliRunner::new(settings.runtime_binary.clone());
    match settings.log_location() {
        Some(location) => runner = runner.with_awslogs(location),
        None => info!("no log group configured; task output stays with the container runtime"),
    }
    Ok(CommandDispatcher::new(Arc::new(runner), target, policy)?)
}

async fn serve(config: RemsConfig, listen: Option<String>) -> anyhow::Result<()> {
    info!("REMS ops daemon starting");

    // Each component is optional; a deployment may configure only one.
    let bootstrap = match build_bootstrap(&config) {
        Ok(procedure) => {
            info!(
                role = procedure.target().role_name(),
                database = procedure.target().database_name(),
                "bootstrap procedure ready"
            );
            Some(Arc::new(procedure))
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "bootstrap endpoint disabled");
            None
        }
    };
    let dispatcher = match build_dispatcher(&config) {
        Ok(dispatcher) => {
            info!(
                cluster = %dispatcher.target().cluster,
                task_definition = %dispatcher.target().task_definition,
                budget_secs = dispatcher.policy().budget.as_secs(),
                "command dispatcher ready"
            );
            Some(Arc::new(dispatcher))
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "command endpoint disabled");
            None
        }
    };
    if bootstrap.is_none() && dispatcher.is_none() {
        anyhow::bail!("neither bootstrap nor dispatch is configured; nothing to serve");
    }

    let router = rems_api::build_router(ApiState::new(bootstrap, dispatcher));
    let addr = listen.unwrap_or(config.server.listen);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("REMS ops daemon stopped");
    Ok(())
}

async fn run_bootstrap(config: &RemsConfig, secret_name: &str) -> anyhow::Result<ExitCode> {
    let procedure = build_bootstrap(config)?;
    let outcome = procedure.run(&BootstrapRequest::new(secret_name)).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.status.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_command(
    config: &RemsConfig,
    timeout: Option<&str>,
    command: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let timeout_seconds = timeout
        .map(|t| {
            parse_duration(t)
                .map(|d: Duration| d.as_secs().max(1))
                .with_context(|| format!("invalid --timeout {t:?}"))
        })
        .transpose()?;

    let dispatcher = build_dispatcher(config)?;
    let outcome = dispatcher
        .dispatch(&CommandRequest {
            command,
            timeout_seconds,
        })
        .await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(ExitCode::from(exit_status(&outcome)))
}

/// Process exit status for a dispatch outcome.
fn exit_status(outcome: &DispatchOutcome) -> u8 {
    match outcome.state {
        ExecutionState::Succeeded => 0,
        ExecutionState::TimedOut => EXIT_TIMED_OUT,
        ExecutionState::SubmitError => EXIT_SUBMIT_ERROR,
        // Codes outside 1..=255 (signals, negative) still have to fail.
        _ => outcome
            .exit_code
            .and_then(|code| u8::try_from(code).ok())
            .filter(|code| *code != 0)
            .unwrap_or(1),
    }
}
