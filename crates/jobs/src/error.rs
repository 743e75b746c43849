use thiserror::Error;

use courier::{PollError, PublishError, TransactionError};

use crate::dispatcher::JobState;
use crate::events::{JobEventKind, JobId};

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("job {0} is not tracked by this dispatcher")]
    UnknownJob(JobId),

    #[error("job {job_id} was already submitted and is {state}")]
    AlreadySubmitted { job_id: JobId, state: JobState },

    #[error("job {job_id} is {state}, cannot apply {kind}")]
    InvalidTransition {
        job_id: JobId,
        state: JobState,
        kind: JobEventKind,
    },
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease '{name}' was lost while its task was running")]
    Lost { name: String },

    /// The store behind a [`LeaseManager`](crate::LeaseManager) failed.
    #[error("lease backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}
