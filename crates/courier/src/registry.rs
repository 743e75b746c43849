//! Explicit handler registry built at startup.
//!
//! Maps each event type to its routing (mode, target) and the handler that
//! processes batches of it. A [`Subscriber`](crate::Subscriber) drives the
//! registry against a [`MessagingClient`].

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::client::MessagingClient;
use crate::message::{Event, Routable};
use crate::tenant::TenantId;
use crate::topology::{Target, WorkerMode};
use crate::transaction::Transaction;

/// Error returned by handlers and validators.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("a handler is already registered for event type '{0}'")]
pub struct DuplicateHandler(pub String);

/// What a handler sees besides its messages.
///
/// Publishing with `PublishOptions::transactional(ctx.transaction)` ties
/// outgoing events to the fate of the incoming batch.
pub struct HandlerContext<'a> {
    pub tenant: &'a TenantId,
    pub client: &'a MessagingClient,
    pub transaction: &'a Transaction,
}

/// Processes batches of one event type for one tenant.
#[async_trait]
pub trait Handler<E: Routable>: Send + Sync + 'static {
    /// Reject a single message. Rejected messages are dead-lettered and
    /// never reach [`handle`](Handler::handle).
    fn validate(&self, _tenant: &TenantId, _message: &E) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Handle every valid message of the batch. An error requeues the whole
    /// batch.
    async fn handle(&self, ctx: &HandlerContext<'_>, messages: Vec<E>) -> Result<(), HandlerError>;
}

/// Result of dispatching one batch to its handler.
pub(crate) struct Dispatch {
    pub valid: usize,
    pub rejected: usize,
    pub result: Result<(), HandlerError>,
}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn dispatch(&self, ctx: &HandlerContext<'_>, events: Vec<Event>) -> Dispatch;
}

struct Typed<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E: Routable, H: Handler<E>> ErasedHandler for Typed<E, H> {
    async fn dispatch(&self, ctx: &HandlerContext<'_>, events: Vec<Event>) -> Dispatch {
        let mut valid = Vec::with_capacity(events.len());
        let mut rejected = 0;
        for event in events {
            let checked = event
                .decode_as::<E>()
                .map_err(HandlerError::from)
                .and_then(|payload| {
                    self.handler.validate(ctx.tenant, &payload)?;
                    Ok(payload)
                });
            match checked {
                Ok(payload) => valid.push(payload),
                Err(e) => {
                    warn!(
                        tenant = %ctx.tenant,
                        event_type = E::EVENT_TYPE,
                        event_id = %event.id(),
                        error = %e,
                        "invalid message rejected"
                    );
                    ctx.transaction.reject(&event);
                    rejected += 1;
                }
            }
        }

        let count = valid.len();
        let result = if valid.is_empty() {
            Ok(())
        } else {
            self.handler.handle(ctx, valid).await
        };
        Dispatch {
            valid: count,
            rejected,
            result,
        }
    }
}

/// One registered event type.
#[derive(Clone)]
pub struct Registration {
    pub event_type: &'static str,
    pub mode: WorkerMode,
    pub target: Target,
    pub(crate) handler: Arc<dyn ErasedHandler>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("event_type", &self.event_type)
            .field("mode", &self.mode)
            .field("target", &self.target)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    registrations: BTreeMap<&'static str, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `E`, routed with `E::MODE` and `E::TARGET`.
    pub fn register<E, H>(&mut self, handler: H) -> Result<&mut Self, DuplicateHandler>
    where
        E: Routable,
        H: Handler<E>,
    {
        if self.registrations.contains_key(E::EVENT_TYPE) {
            return Err(DuplicateHandler(E::EVENT_TYPE.to_string()));
        }
        self.registrations.insert(
            E::EVENT_TYPE,
            Registration {
                event_type: E::EVENT_TYPE,
                mode: E::MODE,
                target: E::TARGET,
                handler: Arc::new(Typed {
                    handler,
                    _event: PhantomData,
                }),
            },
        );
        Ok(self)
    }

    pub fn get(&self, event_type: &str) -> Option<&Registration> {
        self.registrations.get(event_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.values()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
