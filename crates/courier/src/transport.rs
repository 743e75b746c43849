//! Broker transport abstraction.
//!
//! [`Broker`] opens one channel per virtual host; [`BrokerChannel`] is the
//! small subset of AMQP 0-9-1 the messaging client needs. Two backends:
//! [`amqp::AmqpBroker`] talks to a real broker, [`memory::InMemoryBroker`]
//! keeps everything in process for tests and local runs.

pub mod amqp;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::topology::ExchangeKind;

/// Message as it travels through the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
}

/// One fetched, not yet acknowledged message.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    /// Channel-scoped delivery tag used for ack/nack.
    pub tag: u64,
    pub redelivered: bool,
    pub message: WireMessage,
}

/// Optional queue arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-expires`
    pub expires: Option<Duration>,
}

/// Opens channels on a virtual host.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, vhost: &str) -> Result<Arc<dyn BrokerChannel>, TransportError>;
}

#[async_trait]
impl<T: Broker + ?Sized> Broker for Arc<T> {
    async fn connect(&self, vhost: &str) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        (**self).connect(vhost).await
    }
}

/// An open channel bound to one virtual host.
///
/// All declarations are idempotent. Delivery tags are only valid on the
/// channel that produced them. Closing or dropping a channel returns its
/// unacknowledged deliveries to their queues.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError>;

    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<(), TransportError>;

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
    ) -> Result<(), TransportError>;

    /// Fetch one message without auto-ack. `None` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<RawDelivery>, TransportError>;

    async fn ack(&self, tag: u64) -> Result<(), TransportError>;

    /// Negative acknowledge. Without `requeue` the message is dead-lettered
    /// if its queue has a dead-letter exchange, dropped otherwise.
    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Drop every ready message. Returns how many were removed.
    async fn purge(&self, queue: &str) -> Result<u32, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}
