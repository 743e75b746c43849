//! courier-admin: operate tenant namespaces and poke at queues.
//!
//! # Usage
//!
//! ```bash
//! # Provision the configured bootstrap tenants plus two more
//! courier-admin provision project-a project-b
//!
//! # Is the management API reachable?
//! courier-admin ping
//!
//! # Publish a JSON event and read it back
//! courier-admin publish --tenant project-a --event-type orders.create \
//!     --mode unicast --target one-to-one --payload '{"id": 7}'
//! courier-admin poll --tenant project-a --event-type orders.create \
//!     --mode unicast --target one-to-one
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use courier::vhost::NamespaceProvisioner;
use courier::{
    CourierConfig, Event, MessagingClient, PollOptions, PublishOptions, Target, TenantId,
    VirtualHostAdmin, WorkerMode,
};

#[derive(Parser, Debug)]
#[command(name = "courier-admin", version, about)]
struct Cli {
    /// Path to courier.toml. Defaults plus COURIER_* variables when absent.
    #[arg(long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ensure namespaces exist for the bootstrap tenants and the given ones.
    Provision { tenants: Vec<String> },

    /// Delete a tenant namespace.
    Remove { tenant: String },

    /// List every virtual host on the broker.
    List,

    /// Check that the management API answers.
    Ping,

    /// Publish one JSON event.
    Publish {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        event_type: String,
        #[arg(long, default_value = "unicast")]
        mode: WorkerMode,
        #[arg(long, default_value = "one-to-one")]
        target: Target,
        /// Service to address with target MICROSERVICE.
        #[arg(long)]
        recipient: Option<String>,
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Empty the target queue first.
        #[arg(long)]
        purge: bool,
    },

    /// Poll events and print them as JSON lines.
    Poll {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        event_type: String,
        #[arg(long, default_value = "unicast")]
        mode: WorkerMode,
        #[arg(long, default_value = "one-to-one")]
        target: Target,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        /// Keep polling until interrupted.
        #[arg(long)]
        follow: bool,
    },
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
    let config = match &cli.config {
        Some(path) => CourierConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CourierConfig::local()?,
    };
    tracing::debug!(?cli, "starting courier-admin");

    match cli.command {
        Command::Provision { tenants } => {
            let admin = VirtualHostAdmin::new(&config.broker, &config.namespace)?;
            let mut all = config.bootstrap_tenants()?;
            for t in tenants {
                all.push(TenantId::new(t)?);
            }
            for handle in admin.provision_bootstrap(&all).await? {
                println!("{} -> {}", handle.tenant, handle.vhost);
            }
        }
        Command::Remove { tenant } => {
            let admin = VirtualHostAdmin::new(&config.broker, &config.namespace)?;
            let tenant = TenantId::new(tenant)?;
            admin.remove_namespace(&tenant).await?;
            println!("removed {}", admin.vhost_name(&tenant));
        }
        Command::List => {
            let admin = VirtualHostAdmin::new(&config.broker, &config.namespace)?;
            for name in admin.list_namespaces().await? {
                println!("{name}");
            }
        }
        Command::Ping => {
            let admin = VirtualHostAdmin::new(&config.broker, &config.namespace)?;
            if !admin.broker_running().await {
                anyhow::bail!("management API at {} unreachable", config.broker.management_url());
            }
            println!("ok");
        }
        Command::Publish {
            tenant,
            event_type,
            mode,
            target,
            recipient,
            payload,
            purge,
        } => {
            let client = MessagingClient::from_config(&config)?;
            let tenant = TenantId::new(tenant)?;
            let value: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let event = Event::json(event_type, &value)?;
            let options = PublishOptions {
                transaction: None,
                purge_before_send: purge,
                recipient: recipient.as_deref(),
            };
            client.publish(&tenant, &event, mode, target, options).await?;
            println!("{}", event.id());
            client.close().await;
        }
        Command::Poll {
            tenant,
            event_type,
            mode,
            target,
            timeout_ms,
            follow,
        } => {
            let client = MessagingClient::from_config(&config)?;
            let tenant = TenantId::new(tenant)?;
            let options = PollOptions::timeout(Duration::from_millis(timeout_ms));
            let poll = async {
                loop {
                    match client.poll(&tenant, &event_type, mode, target, options).await? {
                        Some(event) => print_event(&event),
                        None if !follow => {
                            tracing::info!("no message before timeout");
                            break;
                        }
                        None => {}
                    }
                    if !follow {
                        break;
                    }
                }
                anyhow::Ok(())
            };
            tokio::select! {
                result = poll => result?,
                _ = shutdown_signal() => tracing::info!("shutdown signal received"),
            }
            tracing::info!(metrics = ?client.metrics().snapshot(), "messaging metrics");
            client.close().await;
        }
    }
    Ok(())
}

fn print_event(event: &Event) {
    let payload = event
        .decode::<serde_json::Value>()
        .unwrap_or_else(|_| serde_json::Value::String(format!("<{} bytes>", event.payload().len())));
    let line = serde_json::json!({
        "id": event.id().to_string(),
        "event_type": event.event_type(),
        "tenant": event.tenant(),
        "redelivered": event.is_redelivered(),
        "timestamp": event.timestamp().to_rfc3339(),
        "payload": payload,
    });
    println!("{line}");
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
