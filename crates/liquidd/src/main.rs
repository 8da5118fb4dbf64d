//! liquidd: the Liquid container daemon.
//!
//! # Usage
//!
//! ```text
//! liquidd validate --config liquid.toml
//! liquidd run --config liquid.toml --metrics-port 9464
//! liquidd exec --config liquid.toml -- python3 -c 'print(1)'
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use liquid_core::{
    Config, ConfigError, PartialConfig, apply_env_overrides, format_bytes, format_duration,
    load_config,
};
use liquid_runtime::{RuntimeError, Subsystem, Workload};
use liquidd::{AppState, build_router};

const DEFAULT_LOG_FILTER: &str = "info,liquidd=debug,liquid=debug";

#[derive(Parser)]
#[command(name = "liquidd", about = "Liquid container subsystem daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a configuration file and print every problem found.
    Validate {
        /// TOML config file. Defaults plus environment overrides if omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Keep a warm pool running and serve metrics until Ctrl-C.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port for /metrics, /healthz and /endpoints.
        #[arg(long, default_value = "9464")]
        metrics_port: u16,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Run one command in a pooled container and exit with its code.
    Exec {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Time limit in milliseconds, capped by max_execution_time.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Forward this process's stdin to the workload.
        #[arg(long)]
        stdin: bool,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { config } => {
            init_tracing(false);
            validate(config.as_deref())
        }
        Command::Run {
            config,
            metrics_port,
            log_json,
        } => {
            init_tracing(log_json);
            run(config.as_deref(), metrics_port).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec {
            config,
            timeout_ms,
            stdin,
            command,
        } => {
            init_tracing(false);
            exec(config.as_deref(), timeout_ms, stdin, command).await
        }
    }
}

fn read_partial(path: Option<&Path>) -> anyhow::Result<PartialConfig> {
    let mut partial = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            PartialConfig::from_toml_str(&content)?
        }
        None => PartialConfig::default(),
    };
    apply_env_overrides(&mut partial);
    Ok(partial)
}

fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => load_config(path)?,
        None => read_partial(None)?.resolve().map_err(ConfigError::Invalid)?,
    };
    Ok(config)
}

fn validate(path: Option<&Path>) -> anyhow::Result<ExitCode> {
    match read_partial(path)?.resolve() {
        Ok(config) => {
            let pool = &config.pool;
            println!("configuration is valid");
            println!(
                "  pool: min_idle={} max_total={} image={}",
                pool.min_idle, pool.max_total, pool.image
            );
            println!(
                "  limits: memory={} cpus={} pids={} time={}",
                format_bytes(pool.resources.memory),
                pool.resources.cpu_quota,
                pool.resources.pids_limit,
                format_duration(pool.resources.max_execution_time.as_millis() as u64),
            );
            println!(
                "  placement: {:?} with {} remote endpoint(s)",
                pool.placement.kind,
                pool.placement.remote_endpoints.len()
            );
            println!("  secrets: {:?}, {} injected", config.secrets.backend, config.secrets.inject.len());
            Ok(ExitCode::SUCCESS)
        }
        Err(validation) => {
            eprintln!("configuration is invalid:");
            for problem in &validation.errors {
                eprintln!("  - {problem}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(path: Option<&Path>, metrics_port: u16) -> anyhow::Result<()> {
    info!("Liquid daemon starting");

    let config = load(path)?;
    let subsystem = Subsystem::docker(&config)?;

    match subsystem.pool.warm_up().await {
        Ok(created) => info!(created, "pool warm"),
        Err(e) => warn!(error = %e, "pool warm-up incomplete, maintenance will retry"),
    }
    subsystem.pool.start_maintenance();

    let router = build_router(AppState {
        pool: Arc::clone(&subsystem.pool),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    info!(%addr, "metrics server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    subsystem.pool.shutdown().await;
    info!("Liquid daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    }
}

async fn exec(
    path: Option<&Path>,
    timeout_ms: Option<u64>,
    forward_stdin: bool,
    command: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let config = load(path)?;
    let subsystem = Subsystem::docker(&config)?;

    let mut workload = Workload::new(command);
    if let Some(ms) = timeout_ms {
        workload = workload.with_timeout(Duration::from_millis(ms));
    }
    if forward_stdin {
        let mut input = Vec::new();
        tokio::io::stdin().read_to_end(&mut input).await?;
        workload = workload.with_stdin(input);
    }

    let result = subsystem.executor.run(&workload).await;
    subsystem.pool.shutdown().await;

    match result {
        Ok(outcome) => {
            print!("{}", outcome.stdout);
            eprint!("{}", outcome.stderr);
            info!(
                endpoint = %outcome.endpoint_id,
                duration_ms = outcome.duration.as_millis() as u64,
                "workload finished"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(RuntimeError::ContainerExecution {
            exit_code: Some(code),
            message,
            ..
        }) => {
            eprintln!("{message}");
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        Err(e) => Err(e.into()),
    }
}
