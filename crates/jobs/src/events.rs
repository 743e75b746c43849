//! Job protocol payloads and their routing.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier::{Routable, Target, WorkerMode};

pub type JobId = u64;

/// A job is ready to run. Exactly one idle worker in the tenant claims it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJobEvent {
    pub job_id: JobId,
}

impl Routable for NewJobEvent {
    const EVENT_TYPE: &'static str = "courier.jobs.new";
    const MODE: WorkerMode = WorkerMode::Unicast;
    const TARGET: Target = Target::OneToOne;
}

/// Stop a job. Every instance of the worker service receives it; only the
/// instance running the job acts on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoppingJobEvent {
    pub job_id: JobId,
}

impl Routable for StoppingJobEvent {
    const EVENT_TYPE: &'static str = "courier.jobs.stopping";
    const MODE: WorkerMode = WorkerMode::Broadcast;
    const TARGET: Target = Target::Microservice;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Claimed,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        })
    }
}

/// Progress reported by a worker. One instance of every subscribed service
/// receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobEventKind,
    /// `service/instance` of the reporting worker.
    pub worker: String,
    /// Failure reason, when there is one.
    #[serde(default)]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: JobId, kind: JobEventKind, worker: impl Into<String>) -> Self {
        Self {
            job_id,
            kind,
            worker: worker.into(),
            message: None,
            at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl Routable for JobEvent {
    const EVENT_TYPE: &'static str = "courier.jobs.event";
    const MODE: WorkerMode = WorkerMode::Unicast;
    const TARGET: Target = Target::All;
}

#[cfg(test)]
mod tests {
    use courier::Event;

    use super::*;

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&JobEventKind::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
    }

    #[test]
    fn job_event_survives_the_envelope() {
        let event = JobEvent::new(7, JobEventKind::Failed, "job-worker/a").with_message("exit 3");
        let envelope = Event::of(&event).unwrap();
        assert_eq!(envelope.event_type(), "courier.jobs.event");
        let back: JobEvent = envelope.decode_as().unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn message_is_optional_on_the_wire() {
        let back: JobEvent = serde_json::from_str(
            r#"{"job_id":1,"kind":"running","worker":"w/1","at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(back.kind, JobEventKind::Running);
        assert!(back.message.is_none());
    }
}
