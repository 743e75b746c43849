//! Dispatcher side of the job protocol.
//!
//! Submits and cancels jobs for one tenant and follows their progress from
//! the [`JobEvent`]s workers report. State lives in memory only.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use courier::{
    Event, MessagingClient, PollError, PollOptions, PublishOptions, Routable, TenantId,
};

use crate::error::JobError;
use crate::events::{JobEvent, JobEventKind, JobId, NewJobEvent, StoppingJobEvent};

/// Service name workers run under unless configured otherwise.
pub const DEFAULT_WORKER_SERVICE: &str = "job-worker";

/// Dispatcher view of a job.
///
/// `Submitted → Claimed → Running → Done | Cancelled | Failed`. A job whose
/// submit failed in transport stays `Submitted` and may be submitted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Claimed,
    Running,
    Done,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }

    /// The state after a worker reports `kind`, or `None` when the report
    /// does not fit the current state.
    pub fn apply(self, kind: JobEventKind) -> Option<JobState> {
        use JobEventKind as K;
        match (self, kind) {
            (Self::Submitted, K::Claimed) => Some(Self::Claimed),
            // Running may overtake Claimed when one of them was redelivered.
            (Self::Submitted | Self::Claimed, K::Running) => Some(Self::Running),
            (Self::Running, K::Succeeded) => Some(Self::Done),
            (Self::Submitted | Self::Claimed | Self::Running, K::Failed) => Some(Self::Failed),
            (Self::Submitted | Self::Claimed | Self::Running, K::Aborted) => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Submitted => "submitted",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone)]
struct JobRecord {
    state: JobState,
    cancel_requested: bool,
    worker: Option<String>,
    message: Option<String>,
}

impl JobRecord {
    fn submitted() -> Self {
        Self {
            state: JobState::Submitted,
            cancel_requested: false,
            worker: None,
            message: None,
        }
    }
}

pub struct JobDispatcher {
    client: Arc<MessagingClient>,
    tenant: TenantId,
    worker_service: String,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl JobDispatcher {
    pub fn new(client: Arc<MessagingClient>, tenant: TenantId) -> Self {
        Self {
            client,
            tenant,
            worker_service: DEFAULT_WORKER_SERVICE.to_string(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Service whose instances receive stop requests.
    pub fn with_worker_service(mut self, service: impl Into<String>) -> Self {
        self.worker_service = service.into();
        self
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare the queue job events arrive on. Call before submitting so no
    /// report is missed.
    pub async fn bind(&self) -> Result<(), JobError> {
        self.client
            .bind(&self.tenant, JobEvent::EVENT_TYPE, JobEvent::MODE, JobEvent::TARGET)
            .await?;
        Ok(())
    }

    /// Publish a [`NewJobEvent`]. On a transport error the job stays
    /// `Submitted` and the error is returned so the caller can retry.
    pub async fn submit(&self, job_id: JobId) -> Result<(), JobError> {
        {
            let mut jobs = self.jobs();
            let record = jobs.entry(job_id).or_insert_with(JobRecord::submitted);
            if record.state != JobState::Submitted {
                return Err(JobError::AlreadySubmitted {
                    job_id,
                    state: record.state,
                });
            }
        }

        match self
            .client
            .publish_event(&self.tenant, &NewJobEvent { job_id }, PublishOptions::default())
            .await
        {
            Ok(_) => {
                info!(tenant = %self.tenant, job_id, "job submitted");
                Ok(())
            }
            Err(e) => {
                warn!(tenant = %self.tenant, job_id, error = %e, "job submit failed, job stays submitted");
                Err(e.into())
            }
        }
    }

    /// Broadcast a [`StoppingJobEvent`] to every worker instance.
    ///
    /// The job moves to `Cancelled` once the worker running it reports
    /// the abort. Finished jobs are left alone.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), JobError> {
        if let Some(state) = self.state(job_id) {
            if state.is_terminal() {
                debug!(tenant = %self.tenant, job_id, state = %state, "job already finished, not cancelling");
                return Ok(());
            }
        }

        let event = Event::of(&StoppingJobEvent { job_id }).map_err(courier::PublishError::from)?;
        self.client
            .publish(
                &self.tenant,
                &event,
                StoppingJobEvent::MODE,
                StoppingJobEvent::TARGET,
                PublishOptions::default().to_service(&self.worker_service),
            )
            .await?;

        if let Some(record) = self.jobs().get_mut(&job_id) {
            record.cancel_requested = true;
        }
        info!(
            tenant = %self.tenant,
            job_id,
            service = %self.worker_service,
            "job cancellation broadcast"
        );
        Ok(())
    }

    /// Advance the job's state machine with a worker report.
    pub fn record(&self, event: &JobEvent) -> Result<JobState, JobError> {
        let mut jobs = self.jobs();
        let record = jobs
            .get_mut(&event.job_id)
            .ok_or(JobError::UnknownJob(event.job_id))?;
        let next = record
            .state
            .apply(event.kind)
            .ok_or(JobError::InvalidTransition {
                job_id: event.job_id,
                state: record.state,
                kind: event.kind,
            })?;

        debug!(
            tenant = %self.tenant,
            job_id = event.job_id,
            from = %record.state,
            to = %next,
            worker = %event.worker,
            "job state changed"
        );
        record.state = next;
        record.worker = Some(event.worker.clone());
        if event.message.is_some() {
            record.message = event.message.clone();
        }
        Ok(next)
    }

    pub fn state(&self, job_id: JobId) -> Option<JobState> {
        self.jobs().get(&job_id).map(|r| r.state)
    }

    pub fn is_cancel_requested(&self, job_id: JobId) -> bool {
        self.jobs().get(&job_id).is_some_and(|r| r.cancel_requested)
    }

    /// `service/instance` of the worker that last reported on the job.
    pub fn worker_of(&self, job_id: JobId) -> Option<String> {
        self.jobs().get(&job_id).and_then(|r| r.worker.clone())
    }

    /// Failure reason reported for the job, if any.
    pub fn message_of(&self, job_id: JobId) -> Option<String> {
        self.jobs().get(&job_id).and_then(|r| r.message.clone())
    }

    /// Drain pending job events, waiting up to `timeout` for the first one.
    ///
    /// Reports for unknown jobs or impossible transitions are logged and
    /// dropped. Returns the number of reports applied.
    pub async fn poll_events(&self, timeout: Duration) -> Result<usize, JobError> {
        let mut applied = 0;
        let mut wait = timeout;
        loop {
            let polled = self
                .client
                .poll_event::<JobEvent>(&self.tenant, PollOptions::timeout(wait))
                .await;
            wait = Duration::ZERO;
            let event = match polled {
                Ok(Some((event, _))) => event,
                Ok(None) => return Ok(applied),
                Err(PollError::Envelope(e)) => {
                    warn!(tenant = %self.tenant, error = %e, "undecodable job event dropped");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match self.record(&event) {
                Ok(_) => applied += 1,
                Err(e) => warn!(tenant = %self.tenant, error = %e, "job event ignored"),
            }
        }
    }
}
