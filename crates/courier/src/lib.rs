pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod subscriber;
pub mod tenant;
pub mod topology;
pub mod transaction;
pub mod transport;
pub mod vhost;

pub use client::{ClientSettings, MessagingClient, PollOptions, PublishOptions};
pub use config::{BrokerConfig, CourierConfig, NamespaceConfig, PollConfig, ServiceConfig};
pub use error::{
    ConfigError, CourierError, EnvelopeError, PollError, ProvisioningError, PublishError,
    TopologyError, TransactionError, TransportError,
};
pub use message::{Event, EventHeaders, Routable};
pub use metrics::{MessagingMetrics, MetricsSnapshot};
pub use registry::{
    DuplicateHandler, Handler, HandlerContext, HandlerError, HandlerRegistry, Registration,
};
pub use subscriber::{BatchReport, Subscriber, SubscriberConfig};
pub use tenant::{InvalidTenant, TenantId};
pub use topology::{
    Binding, DeadLetter, ExchangeKind, ServiceIdentity, Target, Topology, TopologyResolver,
    WorkerMode,
};
pub use transaction::Transaction;
pub use transport::amqp::AmqpBroker;
pub use transport::memory::InMemoryBroker;
pub use transport::{Broker, BrokerChannel, QueueArguments, RawDelivery, WireMessage};
pub use vhost::{NamespaceHandle, NamespaceProvisioner, VirtualHostAdmin};
