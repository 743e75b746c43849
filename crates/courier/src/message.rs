use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EnvelopeError;
use crate::tenant::TenantId;
use crate::topology::{Target, WorkerMode};
use crate::transport::WireMessage;

pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_OCTET: &str = "application/octet-stream";

pub const HEADER_TENANT: &str = "courier_tenant";
pub const HEADER_EVENT_TYPE: &str = "courier_event_type";
pub const HEADER_REQUEST_ID: &str = "courier_request_id";
pub const HEADER_OWNER: &str = "courier_owner";
pub const HEADER_SESSION: &str = "courier_session";
pub const HEADER_CORRELATION_ID: &str = "courier_correlation_id";
pub const HEADER_VERSION: &str = "courier_version";

/// Envelope version written by this crate.
pub const ENVELOPE_VERSION: u16 = 1;

/// A type that knows how it is routed.
///
/// Every service publishing or consuming `E` uses the same constants, which
/// is what keeps independently deployed instances on one topology.
pub trait Routable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fully-qualified logical event type, e.g. `"courier.jobs.new"`.
    const EVENT_TYPE: &'static str;
    const MODE: WorkerMode;
    const TARGET: Target;
}

/// Optional envelope headers carried next to the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventHeaders {
    /// Tenant the event was published under. Set by the publisher.
    pub tenant: Option<String>,
    pub request_id: Option<String>,
    pub owner: Option<String>,
    pub session: Option<String>,
}

/// An event: opaque payload bytes plus a declared logical type.
///
/// Immutable once built; the `with_*` methods consume and return the event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    id: Uuid,
    event_type: String,
    payload: Vec<u8>,
    content_type: String,
    headers: EventHeaders,
    correlation_id: Uuid,
    timestamp: DateTime<Utc>,
    version: u16,
    redelivered: bool,
}

impl Event {
    /// Build an event, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        let bytes = rmp_serde::to_vec_named(payload)?;
        Ok(Self::from_bytes(event_type, bytes, CONTENT_TYPE_MSGPACK))
    }

    /// Build an event with a JSON payload.
    pub fn json<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(Self::from_bytes(event_type, bytes, CONTENT_TYPE_JSON))
    }

    /// Build an event around already-encoded bytes.
    pub fn from_bytes(
        event_type: impl Into<String>,
        payload: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            event_type: event_type.into(),
            payload,
            content_type: content_type.into(),
            headers: EventHeaders::default(),
            correlation_id: id,
            timestamp: Utc::now(),
            version: ENVELOPE_VERSION,
            redelivered: false,
        }
    }

    /// Build an event for a [`Routable`] payload.
    pub fn of<E: Routable>(payload: &E) -> Result<Self, EnvelopeError> {
        Self::new(E::EVENT_TYPE, payload)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.headers.request_id = Some(request_id.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.headers.owner = Some(owner.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.headers.session = Some(session.into());
        self
    }

    /// Link this event to an earlier one (replies, follow-ups).
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn headers(&self) -> &EventHeaders {
        &self.headers
    }

    pub fn tenant(&self) -> Option<&str> {
        self.headers.tenant.as_deref()
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// The broker delivered this message before and it was not acknowledged.
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Deserialize the payload according to its content type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        match self.content_type.as_str() {
            CONTENT_TYPE_MSGPACK => Ok(rmp_serde::from_slice(&self.payload)?),
            CONTENT_TYPE_JSON => Ok(serde_json::from_slice(&self.payload)?),
            other => Err(EnvelopeError::UnsupportedContentType(other.to_string())),
        }
    }

    /// Check the declared type and decode into `E`.
    pub fn decode_as<E: Routable>(&self) -> Result<E, EnvelopeError> {
        if self.event_type != E::EVENT_TYPE {
            return Err(EnvelopeError::UnexpectedType {
                expected: E::EVENT_TYPE.to_string(),
                actual: self.event_type.clone(),
            });
        }
        self.decode()
    }

    /// Wire representation, stamped with the tenant it is published under.
    pub fn to_wire(&self, tenant: &TenantId) -> WireMessage {
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_TENANT.to_string(), tenant.to_string());
        headers.insert(HEADER_EVENT_TYPE.to_string(), self.event_type.clone());
        headers.insert(HEADER_CORRELATION_ID.to_string(), self.correlation_id.to_string());
        headers.insert(HEADER_VERSION.to_string(), self.version.to_string());
        if let Some(v) = &self.headers.request_id {
            headers.insert(HEADER_REQUEST_ID.to_string(), v.clone());
        }
        if let Some(v) = &self.headers.owner {
            headers.insert(HEADER_OWNER.to_string(), v.clone());
        }
        if let Some(v) = &self.headers.session {
            headers.insert(HEADER_SESSION.to_string(), v.clone());
        }

        WireMessage {
            body: self.payload.clone(),
            content_type: Some(self.content_type.clone()),
            headers,
            message_id: Some(self.id.to_string()),
            timestamp: u64::try_from(self.timestamp.timestamp()).ok(),
        }
    }

    /// Rebuild an event from what the broker handed back.
    ///
    /// Never fails: messages published by foreign producers lack our headers,
    /// so missing or malformed values fall back to defaults and the event
    /// type falls back to the one the queue was resolved for.
    pub fn from_wire(wire: WireMessage, redelivered: bool, fallback_event_type: &str) -> Self {
        let WireMessage {
            body,
            content_type,
            mut headers,
            message_id,
            timestamp,
        } = wire;

        let id = message_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);
        let correlation_id = headers
            .get(HEADER_CORRELATION_ID)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or(id);
        let version = headers
            .get(HEADER_VERSION)
            .and_then(|s| s.parse().ok())
            .unwrap_or(ENVELOPE_VERSION);
        let timestamp = timestamp
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        Self {
            id,
            event_type: headers
                .remove(HEADER_EVENT_TYPE)
                .unwrap_or_else(|| fallback_event_type.to_string()),
            payload: body,
            content_type: content_type.unwrap_or_else(|| CONTENT_TYPE_OCTET.to_string()),
            headers: EventHeaders {
                tenant: headers.remove(HEADER_TENANT),
                request_id: headers.remove(HEADER_REQUEST_ID),
                owner: headers.remove(HEADER_OWNER),
                session: headers.remove(HEADER_SESSION),
            },
            correlation_id,
            timestamp,
            version,
            redelivered,
        }
    }
}
