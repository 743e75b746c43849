//! Worker side of the job protocol.
//!
//! A [`JobWorker`] claims [`NewJobEvent`]s for one tenant, runs them
//! through its [`JobRunner`] and reports progress as [`JobEvent`]s. Stop
//! requests arrive on the instance's own broadcast queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use courier::{
    MessagingClient, PollError, PollOptions, PublishOptions, Routable, TenantId, Transaction,
};

use crate::error::JobError;
use crate::events::{JobEvent, JobEventKind, JobId, NewJobEvent, StoppingJobEvent};
use crate::runner::{JobRunner, StopSignal};

/// Stop requests for jobs not running here are remembered up to this many,
/// so a job cancelled before anyone claimed it is aborted on claim.
const REMEMBERED_STOPS: usize = 1024;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long each claim attempt waits for a new job.
    pub poll_timeout: Duration,
    /// Jobs this instance runs at once.
    pub max_concurrent_jobs: usize,
    /// Pause after a claim attempt fails in transport.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            max_concurrent_jobs: 1,
            error_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Default)]
struct StopBook {
    order: VecDeque<JobId>,
    ids: HashSet<JobId>,
}

impl StopBook {
    fn remember(&mut self, job_id: JobId) {
        if !self.ids.insert(job_id) {
            return;
        }
        self.order.push_back(job_id);
        if self.order.len() > REMEMBERED_STOPS {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn take(&mut self, job_id: JobId) -> bool {
        if self.ids.remove(&job_id) {
            self.order.retain(|id| *id != job_id);
            true
        } else {
            false
        }
    }
}

pub struct JobWorker {
    client: Arc<MessagingClient>,
    tenant: TenantId,
    runner: Arc<dyn JobRunner>,
    config: WorkerConfig,
    running: Mutex<HashMap<JobId, watch::Sender<bool>>>,
    stops: Mutex<StopBook>,
}

impl JobWorker {
    pub fn new(
        client: Arc<MessagingClient>,
        tenant: TenantId,
        runner: Arc<dyn JobRunner>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            client,
            tenant,
            runner,
            config,
            running: Mutex::new(HashMap::new()),
            stops: Mutex::new(StopBook::default()),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// `service/instance` reported in every [`JobEvent`].
    pub fn name(&self) -> String {
        let id = self.client.resolver().identity();
        format!("{}/{}", id.service, id.instance)
    }

    /// Jobs claimed or running on this instance.
    pub fn running_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.running().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, watch::Sender<bool>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stops(&self) -> std::sync::MutexGuard<'_, StopBook> {
        self.stops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare this instance's stop queue. Stops broadcast before the
    /// queue exists never reach it.
    pub async fn bind(&self) -> Result<(), JobError> {
        self.client
            .bind(
                &self.tenant,
                StoppingJobEvent::EVENT_TYPE,
                StoppingJobEvent::MODE,
                StoppingJobEvent::TARGET,
            )
            .await?;
        Ok(())
    }

    fn report(&self, job_id: JobId, kind: JobEventKind) -> JobEvent {
        JobEvent::new(job_id, kind, self.name())
    }

    async fn publish(&self, event: &JobEvent) -> Result<(), JobError> {
        self.client
            .publish_event(&self.tenant, event, PublishOptions::default())
            .await?;
        Ok(())
    }

    /// Wait up to `timeout` for a new job and claim it.
    ///
    /// The claim report is published in the same transaction that consumes
    /// the job, so a job is never claimed twice nor lost. A job already
    /// cancelled is consumed and reported aborted instead; `None` is
    /// returned for it.
    pub async fn claim_next(&self, timeout: Duration) -> Result<Option<JobId>, JobError> {
        let tx = Transaction::new();
        let polled = self
            .client
            .poll_event::<NewJobEvent>(&self.tenant, PollOptions::transactional(&tx, timeout))
            .await;
        let job = match polled {
            Ok(Some((job, _))) => job,
            Ok(None) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(PollError::Envelope(e)) => {
                warn!(tenant = %self.tenant, error = %e, "undecodable job dead-lettered");
                tx.commit().await?;
                return Ok(None);
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        };

        let cancelled = self.stops().take(job.job_id);
        let kind = if cancelled {
            JobEventKind::Aborted
        } else {
            JobEventKind::Claimed
        };
        let claimed = self
            .client
            .publish_event(
                &self.tenant,
                &self.report(job.job_id, kind),
                PublishOptions::transactional(&tx),
            )
            .await;
        if let Err(e) = claimed {
            tx.rollback().await?;
            return Err(e.into());
        }

        if cancelled {
            tx.commit().await?;
            info!(tenant = %self.tenant, job_id = job.job_id, "job was cancelled before it was claimed");
            return Ok(None);
        }

        // Owned from here on, so a stop arriving before `run_job` is not lost.
        self.running().insert(job.job_id, watch::channel(false).0);
        if let Err(e) = tx.commit().await {
            self.running().remove(&job.job_id);
            return Err(e.into());
        }
        info!(tenant = %self.tenant, job_id = job.job_id, worker = %self.name(), "job claimed");
        Ok(Some(job.job_id))
    }

    /// Run a claimed job and report how it ended.
    ///
    /// A job stopped between claim and run is reported aborted without
    /// being started.
    pub async fn run_job(&self, job_id: JobId) -> Result<JobEventKind, JobError> {
        let stop = {
            let mut running = self.running();
            let tx = running
                .entry(job_id)
                .or_insert_with(|| watch::channel(false).0);
            StopSignal::watching(tx)
        };

        if stop.is_stopped() {
            self.running().remove(&job_id);
            let report = self.report(job_id, JobEventKind::Aborted);
            self.publish(&report).await?;
            info!(tenant = %self.tenant, job_id, "job stopped before it started");
            return Ok(JobEventKind::Aborted);
        }

        if let Err(e) = self.publish(&self.report(job_id, JobEventKind::Running)).await {
            self.running().remove(&job_id);
            return Err(e);
        }
        debug!(tenant = %self.tenant, job_id, "job running");

        let result = self.runner.run(job_id, stop.clone()).await;
        self.running().remove(&job_id);

        let report = match result {
            _ if stop.is_stopped() => self.report(job_id, JobEventKind::Aborted),
            Ok(()) => self.report(job_id, JobEventKind::Succeeded),
            Err(e) => {
                warn!(tenant = %self.tenant, job_id, error = %e, "job failed");
                self.report(job_id, JobEventKind::Failed).with_message(e.to_string())
            }
        };
        let kind = report.kind;
        self.publish(&report).await?;
        info!(tenant = %self.tenant, job_id, outcome = %kind, "job finished");
        Ok(kind)
    }

    /// Drain stop requests, waiting up to `timeout` for the first one.
    ///
    /// Jobs running here get their [`StopSignal`] raised. Other job ids
    /// are logged and remembered in case the job is claimed later.
    /// Returns every job id a stop arrived for.
    pub async fn check_stops(&self, timeout: Duration) -> Result<Vec<JobId>, JobError> {
        let mut seen = Vec::new();
        let mut wait = timeout;
        loop {
            let polled = self
                .client
                .poll_event::<StoppingJobEvent>(&self.tenant, PollOptions::timeout(wait))
                .await;
            wait = Duration::ZERO;
            let stop = match polled {
                Ok(Some((stop, _))) => stop,
                Ok(None) => return Ok(seen),
                Err(PollError::Envelope(e)) => {
                    warn!(tenant = %self.tenant, error = %e, "undecodable stop request dropped");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            seen.push(stop.job_id);

            let raised = self
                .running()
                .get(&stop.job_id)
                .map(|tx| tx.send_replace(true))
                .is_some();
            if raised {
                info!(tenant = %self.tenant, job_id = stop.job_id, "stopping job");
            } else {
                debug!(tenant = %self.tenant, job_id = stop.job_id, "stop for a job not running here");
                self.stops().remember(stop.job_id);
            }
        }
    }

    fn stop_all(&self) {
        for tx in self.running().values() {
            tx.send_replace(true);
        }
    }

    /// Claim and run jobs until `shutdown` is notified (use `notify_one`).
    /// Running jobs are stopped and awaited before returning.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        info!(
            tenant = %self.tenant,
            worker = %self.name(),
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "job worker started"
        );
        if let Err(e) = self.bind().await {
            warn!(error = %e, "stop queue bind failed, retrying on first check");
        }

        let mut jobs = JoinSet::new();
        loop {
            if let Err(e) = self.check_stops(Duration::ZERO).await {
                warn!(tenant = %self.tenant, error = %e, "stop check failed");
            }
            while let Some(joined) = jobs.try_join_next() {
                log_joined(joined);
            }

            if jobs.len() >= self.config.max_concurrent_jobs {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    Some(joined) = jobs.join_next() => log_joined(joined),
                    _ = tokio::time::sleep(self.config.poll_timeout) => {}
                }
                continue;
            }

            // A claim in progress is finished even on shutdown; a job it
            // takes is then aborted along with the running ones.
            let claim = self.claim_next(self.config.poll_timeout);
            tokio::pin!(claim);
            let (claimed, stopping) = tokio::select! {
                claimed = &mut claim => (claimed, false),
                _ = shutdown.notified() => (claim.await, true),
            };
            match claimed {
                Ok(Some(job_id)) => {
                    let worker = Arc::clone(&self);
                    jobs.spawn(async move { worker.run_job(job_id).await });
                }
                Ok(None) => {}
                Err(e) => {
                    error!(tenant = %self.tenant, error = %e, "job claim failed");
                    if !stopping {
                        tokio::select! {
                            _ = shutdown.notified() => break,
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                        }
                    }
                }
            }
            if stopping {
                break;
            }
        }

        self.stop_all();
        while let Some(joined) = jobs.join_next().await {
            log_joined(joined);
        }
        info!(tenant = %self.tenant, "job worker stopped");
    }
}

fn log_joined(joined: Result<Result<JobEventKind, JobError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "job report failed"),
        Err(e) => error!(error = %e, "job task panicked"),
    }
}
