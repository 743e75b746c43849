//! Job dispatch over courier.
//!
//! A dispatcher submits jobs as [`NewJobEvent`]s that exactly one idle
//! worker claims, and cancels them with a [`StoppingJobEvent`] broadcast to
//! every worker instance. Workers report progress as [`JobEvent`]s, which
//! drive the dispatcher's per-job [`JobState`]. Nothing is persisted.

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod lease;
pub mod runner;
pub mod worker;

pub use dispatcher::{JobDispatcher, JobState, DEFAULT_WORKER_SERVICE};
pub use error::{JobError, LeaseError};
pub use events::{JobEvent, JobEventKind, JobId, NewJobEvent, StoppingJobEvent};
pub use lease::{run_exclusive, InMemoryLeaseManager, Lease, LeaseManager};
pub use runner::{CommandRunner, JobRunner, RunError, StopSignal};
pub use worker::{JobWorker, WorkerConfig};
