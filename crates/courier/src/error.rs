use thiserror::Error;

use crate::registry::DuplicateHandler;
use crate::tenant::InvalidTenant;
use crate::topology::{Target, WorkerMode};

/// Namespace or permission setup against the broker management API failed.
///
/// Kept apart from the messaging errors: a provisioning failure is fatal to
/// the calling operation and is never retried inside the layer.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("management API unreachable at {endpoint}: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("cannot list virtual hosts (status {status}): {body}")]
    ListRejected { status: u16, body: String },

    #[error("cannot create virtual host {vhost} (status {status}): {body}")]
    CreateRejected {
        vhost: String,
        status: u16,
        body: String,
    },

    #[error("cannot grant permissions on {vhost} to {user} (status {status}): {body}")]
    PermissionRejected {
        vhost: String,
        user: String,
        status: u16,
        body: String,
    },

    #[error("cannot remove virtual host {vhost} (status {status}): {body}")]
    RemoveRejected {
        vhost: String,
        status: u16,
        body: String,
    },

    #[error("invalid management endpoint: {0}")]
    Endpoint(String),
}

/// The requested routing cannot be expressed. Programming error, never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("worker mode {mode} cannot be combined with target {target}")]
    Unsupported { mode: WorkerMode, target: Target },

    #[error("a recipient service can only be addressed with target MICROSERVICE, not {target}")]
    RecipientNotAllowed { target: Target },

    #[error("invalid {field} '{value}': must be non-empty and contain no whitespace")]
    InvalidName { field: &'static str, value: String },

    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Failure talking to the broker itself (connection, channel, protocol).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("connecting to virtual host {0} timed out")]
    Timeout(String),

    #[error("channel closed for virtual host {0}")]
    Closed(String),

    #[error("virtual host {0} does not exist")]
    UnknownVhost(String),

    #[error("no exchange '{0}' declared")]
    UnknownExchange(String),

    #[error("no queue '{0}' declared")]
    UnknownQueue(String),

    #[error("exchange '{name}' already declared as {existing}")]
    PreconditionFailed { name: String, existing: String },

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

/// Encoding or decoding an event payload failed.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),

    #[error("expected event type '{expected}', got '{actual}'")]
    UnexpectedType { expected: String, actual: String },
}

/// Returned by [`MessagingClient::publish`](crate::MessagingClient::publish).
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("cannot encode event: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("publish failed: {0}")]
    Transport(#[from] TransportError),
}

/// Returned by [`MessagingClient::poll`](crate::MessagingClient::poll).
///
/// An empty timeout is not an error; it surfaces as `Ok(None)`.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("cannot decode event: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("poll failed: {0}")]
    Transport(#[from] TransportError),
}

/// Completing a [`Transaction`](crate::Transaction) could not reach the broker.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("deferred publish to exchange '{exchange}' failed: {source}")]
    Publish {
        exchange: String,
        #[source]
        source: TransportError,
    },

    #[error("acknowledging delivery {tag} failed: {source}")]
    Ack {
        tag: u64,
        #[source]
        source: TransportError,
    },

    #[error("requeueing delivery {tag} failed: {source}")]
    Requeue {
        tag: u64,
        #[source]
        source: TransportError,
    },
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config error: {0}")]
    Invalid(String),
}

/// Umbrella error for callers that do not care which layer failed.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tenant(#[from] InvalidTenant),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] DuplicateHandler),
}
