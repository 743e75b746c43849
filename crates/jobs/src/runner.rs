//! What a worker actually runs.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::events::JobId;

pub type RunError = Box<dyn std::error::Error + Send + Sync>;

/// Raised when the dispatcher cancels a running job. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal and the sender that raises it.
    pub(crate) fn channel() -> (watch::Sender<bool>, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, StopSignal { rx })
    }

    /// A signal raised through an existing sender.
    pub(crate) fn watching(tx: &watch::Sender<bool>) -> StopSignal {
        StopSignal { rx: tx.subscribe() }
    }

    /// A signal that is never raised.
    pub fn never() -> StopSignal {
        let (_tx, signal) = Self::channel();
        signal
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the stop is raised.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            // Sender gone without a stop: the job can no longer be cancelled.
            std::future::pending::<()>().await;
        }
    }
}

/// Runs one job to completion.
///
/// Long jobs should watch `stop` and return early once it is raised; the
/// worker then reports the job as aborted whatever the result.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job_id: JobId, stop: StopSignal) -> Result<(), RunError>;
}

/// Runs a shell command per job with `JOB_ID` in its environment. A stop
/// kills the child.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: String,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn run(&self, job_id: JobId, stop: StopSignal) -> Result<(), RunError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("JOB_ID", job_id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        debug!(job_id, pid = ?child.id(), "job command started");

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(format!("command exited with {status}").into())
                }
            }
            _ = stop.stopped() => {
                if let Err(e) = child.kill().await {
                    warn!(job_id, error = %e, "failed to kill job command");
                }
                Ok(())
            }
        }
    }
}
