#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use courier::{
    ClientSettings, InMemoryBroker, MessagingClient, ServiceIdentity, TenantId, TopologyResolver,
};
use courier_jobs::{
    JobDispatcher, JobId, JobRunner, JobWorker, RunError, StopSignal, WorkerConfig,
    DEFAULT_WORKER_SERVICE,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const SHORT: Duration = Duration::from_millis(50);

pub fn tenant() -> TenantId {
    TenantId::new("project-a").unwrap()
}

pub fn client(broker: &InMemoryBroker, service: &str, instance: &str) -> Arc<MessagingClient> {
    Arc::new(MessagingClient::new(
        TopologyResolver::new("courier", ServiceIdentity::new(service, instance)),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        ClientSettings {
            poll_interval: Duration::from_millis(5),
            default_timeout: SHORT,
            ..ClientSettings::default()
        },
    ))
}

pub async fn dispatcher(broker: &InMemoryBroker) -> JobDispatcher {
    let dispatcher = JobDispatcher::new(client(broker, "rs-dispatch", "d0"), tenant());
    dispatcher.bind().await.unwrap();
    dispatcher
}

pub async fn worker(
    broker: &InMemoryBroker,
    instance: &str,
    runner: Arc<dyn JobRunner>,
) -> Arc<JobWorker> {
    let worker = JobWorker::new(
        client(broker, DEFAULT_WORKER_SERVICE, instance),
        tenant(),
        runner,
        WorkerConfig {
            poll_timeout: SHORT,
            max_concurrent_jobs: 1,
            error_backoff: SHORT,
        },
    );
    worker.bind().await.unwrap();
    Arc::new(worker)
}

/// Succeeds, or fails with `message` for the job ids listed in `fail`.
#[derive(Default)]
pub struct ScriptedRunner {
    pub fail: Vec<JobId>,
    pub runs: AtomicUsize,
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    async fn run(&self, job_id: JobId, _stop: StopSignal) -> Result<(), RunError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail.contains(&job_id) {
            return Err(format!("job {job_id} blew up").into());
        }
        Ok(())
    }
}

/// Runs until stopped.
pub struct UntilStopped;

#[async_trait]
impl JobRunner for UntilStopped {
    async fn run(&self, _job_id: JobId, stop: StopSignal) -> Result<(), RunError> {
        stop.stopped().await;
        Ok(())
    }
}
