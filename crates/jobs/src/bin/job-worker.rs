//! job-worker: claim jobs for one or more tenants and run a command per job.
//!
//! # Usage
//!
//! ```bash
//! # Run `./process.sh` for every job of project-a, two at a time
//! job-worker --tenant project-a --max-jobs 2 --command './process.sh "$JOB_ID"'
//! ```
//!
//! Tenants default to the configured bootstrap tenants. The service name
//! from the config should match the dispatcher's worker service
//! (`job-worker` unless changed) so stop requests reach this process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;

use courier::{CourierConfig, MessagingClient, TenantId};
use courier_jobs::{CommandRunner, JobWorker, WorkerConfig, DEFAULT_WORKER_SERVICE};

#[derive(Parser, Debug)]
#[command(name = "job-worker", version, about)]
struct Cli {
    /// Path to courier.toml. Defaults plus COURIER_* variables when absent.
    #[arg(long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Tenant to take jobs for. Repeatable.
    #[arg(long = "tenant")]
    tenants: Vec<String>,

    /// Shell command run per job, with JOB_ID set.
    #[arg(long, env = "JOB_WORKER_COMMAND")]
    command: String,

    /// Jobs run at once per tenant.
    #[arg(long, default_value_t = 1)]
    max_jobs: usize,

    /// How long each claim attempt waits.
    #[arg(long, default_value_t = 1000)]
    poll_timeout_ms: u64,

    /// Seconds between metrics log lines (0 disables).
    #[arg(long, default_value_t = 60)]
    metrics_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => CourierConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CourierConfig::local()?,
    };
    // Without an explicit service name, join the default worker pool.
    if config.service.name == CourierConfig::default().service.name {
        config.service.name = DEFAULT_WORKER_SERVICE.to_string();
    }

    let mut tenants = config.bootstrap_tenants()?;
    for t in &cli.tenants {
        tenants.push(TenantId::new(t.as_str())?);
    }
    if tenants.is_empty() {
        anyhow::bail!("no tenants: pass --tenant or set bootstrap_tenants");
    }

    let client = Arc::new(MessagingClient::from_config(&config)?);
    let runner = Arc::new(CommandRunner::new(cli.command));
    let worker_config = WorkerConfig {
        poll_timeout: Duration::from_millis(cli.poll_timeout_ms),
        max_concurrent_jobs: cli.max_jobs.max(1),
        ..WorkerConfig::default()
    };

    let shutdown = Arc::new(Notify::new());
    let mut handles = Vec::new();
    let mut stops = Vec::new();
    for tenant in tenants {
        let worker = Arc::new(JobWorker::new(
            Arc::clone(&client),
            tenant,
            runner.clone(),
            worker_config.clone(),
        ));
        let stop = Arc::new(Notify::new());
        stops.push(Arc::clone(&stop));
        handles.push(tokio::spawn(worker.run(stop)));
    }

    if cli.metrics_interval_secs > 0 {
        let client = Arc::clone(&client);
        let shutdown = Arc::clone(&shutdown);
        let every = Duration::from_secs(cli.metrics_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {
                        tracing::info!(metrics = ?client.metrics().snapshot(), "messaging metrics");
                    }
                }
            }
        });
    }

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping workers");
    shutdown.notify_one();
    for stop in &stops {
        stop.notify_one();
    }
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "worker task panicked");
        }
    }
    client.close().await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
