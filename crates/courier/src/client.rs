//! Publisher and poller: the explicit entry point of the messaging layer.
//!
//! One [`MessagingClient`] is built per process and shared (`Arc`) with
//! every component that publishes or polls. It owns one broker channel per
//! tenant and remembers which exchanges and queues it already declared.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CourierConfig;
use crate::error::{CourierError, PollError, ProvisioningError, PublishError, TransportError};
use crate::message::{Event, Routable};
use crate::metrics::MessagingMetrics;
use crate::tenant::TenantId;
use crate::topology::{ExchangeKind, Target, Topology, TopologyResolver, WorkerMode};
use crate::transaction::{PendingPublish, Transaction};
use crate::transport::amqp::AmqpBroker;
use crate::transport::{Broker, BrokerChannel, QueueArguments};
use crate::vhost::{NamespaceProvisioner, VirtualHostAdmin};

// ── Settings & options ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Pause between two empty `basic.get` attempts while polling.
    pub poll_interval: Duration,
    /// Poll timeout when [`PollOptions::timeout`] is not set.
    pub default_timeout: Duration,
    /// Declare work queues with the namespace dead-letter exchange.
    pub dead_letter: bool,
    /// `x-expires` for per-instance queues.
    pub instance_queue_expiry: Option<Duration>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            default_timeout: Duration::from_secs(5),
            dead_letter: true,
            instance_queue_expiry: Some(Duration::from_secs(1800)),
        }
    }
}

impl ClientSettings {
    pub fn from_config(config: &CourierConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            default_timeout: config.default_poll_timeout(),
            dead_letter: config.namespace.dead_letter,
            instance_queue_expiry: config.instance_queue_expiry(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions<'a> {
    /// Defer the send until this transaction commits.
    pub transaction: Option<&'a Transaction>,
    /// Empty the target queue first. Test and reset only.
    pub purge_before_send: bool,
    /// Address another service (MICROSERVICE targets only).
    pub recipient: Option<&'a str>,
}

impl<'a> PublishOptions<'a> {
    pub fn transactional(transaction: &'a Transaction) -> Self {
        Self {
            transaction: Some(transaction),
            ..Self::default()
        }
    }

    pub fn to_service(mut self, service: &'a str) -> Self {
        self.recipient = Some(service);
        self
    }

    pub fn purged(mut self) -> Self {
        self.purge_before_send = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PollOptions<'a> {
    /// Falls back to [`ClientSettings::default_timeout`].
    pub timeout: Option<Duration>,
    /// Defer the ack until this transaction commits.
    pub transaction: Option<&'a Transaction>,
}

impl<'a> PollOptions<'a> {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            transaction: None,
        }
    }

    pub fn transactional(transaction: &'a Transaction, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            transaction: Some(transaction),
        }
    }
}

// ── Internal errors ──────────────────────────────────────────────────

/// Failure while obtaining a channel or declaring topology.
enum SetupError {
    Provisioning(ProvisioningError),
    Transport(TransportError),
}

impl From<ProvisioningError> for SetupError {
    fn from(e: ProvisioningError) -> Self {
        Self::Provisioning(e)
    }
}

impl From<TransportError> for SetupError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<SetupError> for PublishError {
    fn from(e: SetupError) -> Self {
        match e {
            SetupError::Provisioning(e) => Self::Provisioning(e),
            SetupError::Transport(e) => Self::Transport(e),
        }
    }
}

impl From<SetupError> for PollError {
    fn from(e: SetupError) -> Self {
        match e {
            SetupError::Provisioning(e) => Self::Provisioning(e),
            SetupError::Transport(e) => Self::Transport(e),
        }
    }
}

/// One tenant's channel. Locked on its own so a tenant that is slow to
/// provision or connect never holds up the others.
type ChannelSlot = Arc<Mutex<Option<Arc<dyn BrokerChannel>>>>;

struct Fetched {
    event: Event,
    channel: Arc<dyn BrokerChannel>,
    tag: u64,
}

// ── Client ───────────────────────────────────────────────────────────

pub struct MessagingClient {
    resolver: TopologyResolver,
    provisioner: Arc<dyn NamespaceProvisioner>,
    broker: Arc<dyn Broker>,
    settings: ClientSettings,
    channels: StdMutex<HashMap<TenantId, ChannelSlot>>,
    declared: StdMutex<HashSet<(TenantId, String)>>,
    metrics: Arc<MessagingMetrics>,
}

impl MessagingClient {
    pub fn new(
        resolver: TopologyResolver,
        provisioner: Arc<dyn NamespaceProvisioner>,
        broker: Arc<dyn Broker>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            resolver,
            provisioner,
            broker,
            settings,
            channels: StdMutex::new(HashMap::new()),
            declared: StdMutex::new(HashSet::new()),
            metrics: Arc::new(MessagingMetrics::new()),
        }
    }

    /// Client for a real broker: AMQP transport plus management API provisioning.
    pub fn from_config(config: &CourierConfig) -> Result<Self, CourierError> {
        let provisioner = VirtualHostAdmin::new(&config.broker, &config.namespace)?;
        let resolver = TopologyResolver::new(&config.namespace.exchange_prefix, config.identity());
        info!(
            service = %resolver.identity().service,
            instance = %resolver.identity().instance,
            host = %config.broker.host,
            "messaging client configured"
        );
        Ok(Self::new(
            resolver,
            Arc::new(provisioner),
            Arc::new(AmqpBroker::new(config.broker.clone())),
            ClientSettings::from_config(config),
        ))
    }

    pub fn resolver(&self) -> &TopologyResolver {
        &self.resolver
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn metrics(&self) -> Arc<MessagingMetrics> {
        Arc::clone(&self.metrics)
    }

    // ── Channels & declarations ─────────────────────────────────────

    /// The tenant's channel, provisioning the namespace and connecting on
    /// first use. A closed channel is replaced.
    async fn channel(&self, tenant: &TenantId) -> Result<Arc<dyn BrokerChannel>, SetupError> {
        let slot = Arc::clone(
            self.channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(tenant.clone())
                .or_default(),
        );
        let mut slot = slot.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
            warn!(tenant = %tenant, "tenant channel closed, reconnecting");
            *slot = None;
            self.forget_declared(tenant);
        }

        let namespace = self.provisioner.ensure_namespace(tenant).await?;
        let channel = self.broker.connect(&namespace.vhost).await?;
        debug!(tenant = %tenant, vhost = %namespace.vhost, "tenant channel ready");
        *slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    fn forget_declared(&self, tenant: &TenantId) {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(t, _)| t != tenant);
    }

    /// Whether `key` still needs declaring for `tenant`. Marks it declared.
    fn first_declaration(&self, tenant: &TenantId, key: String) -> bool {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((tenant.clone(), key))
    }

    fn undo_declaration(&self, tenant: &TenantId, key: String) {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(tenant.clone(), key));
    }

    async fn declare_dead_letter(
        &self,
        tenant: &TenantId,
        channel: &Arc<dyn BrokerChannel>,
    ) -> Result<(), TransportError> {
        let dl = self.resolver.dead_letter();
        let key = format!("dlx:{}", dl.exchange);
        if !self.first_declaration(tenant, key.clone()) {
            return Ok(());
        }
        let result = async {
            channel.declare_exchange(&dl.exchange, ExchangeKind::Fanout).await?;
            channel.declare_queue(&dl.queue, &QueueArguments::default()).await?;
            channel.bind(&dl.queue, &dl.exchange, "").await
        }
        .await;
        if result.is_err() {
            self.undo_declaration(tenant, key);
        }
        result
    }

    /// Declare the exchange, and with `with_queue` the queue and binding.
    async fn declare(
        &self,
        tenant: &TenantId,
        channel: &Arc<dyn BrokerChannel>,
        topology: &Topology,
        with_queue: bool,
    ) -> Result<(), TransportError> {
        let exchange_key = format!("x:{}", topology.exchange);
        if self.first_declaration(tenant, exchange_key.clone()) {
            if let Err(e) = channel
                .declare_exchange(&topology.exchange, topology.binding.kind)
                .await
            {
                self.undo_declaration(tenant, exchange_key);
                return Err(e);
            }
        }
        if !with_queue {
            return Ok(());
        }

        let queue_key = format!(
            "q:{}:{}:{}",
            topology.queue, topology.exchange, topology.binding.routing_key
        );
        if !self.first_declaration(tenant, queue_key.clone()) {
            return Ok(());
        }
        let result = async {
            let mut args = QueueArguments::default();
            if self.settings.dead_letter {
                self.declare_dead_letter(tenant, channel).await?;
                args.dead_letter_exchange = Some(self.resolver.dead_letter().exchange);
            }
            if topology.per_instance {
                args.expires = self.settings.instance_queue_expiry;
            }
            channel.declare_queue(&topology.queue, &args).await?;
            channel
                .bind(&topology.queue, &topology.exchange, topology.routing_key())
                .await
        }
        .await;
        if result.is_err() {
            self.undo_declaration(tenant, queue_key);
        } else {
            debug!(
                tenant = %tenant,
                exchange = %topology.exchange,
                queue = %topology.queue,
                "topology declared"
            );
        }
        result
    }

    // ── Publishing ──────────────────────────────────────────────────

    /// Publish `event` to the tenant namespace.
    ///
    /// With a transaction the send is deferred to its commit. No retry: a
    /// transport failure is returned to the caller.
    pub async fn publish(
        &self,
        tenant: &TenantId,
        event: &Event,
        mode: WorkerMode,
        target: Target,
        options: PublishOptions<'_>,
    ) -> Result<(), PublishError> {
        let topology = self
            .resolver
            .resolve_for(event.event_type(), mode, target, options.recipient)?;
        let channel = self.channel(tenant).await?;
        let with_queue = topology.publisher_binds || options.purge_before_send;
        self.declare(tenant, &channel, &topology, with_queue).await?;

        let wire = event.to_wire(tenant);
        match options.transaction {
            Some(tx) => {
                // A rollback must leave the queue untouched, so the purge
                // waits for the commit too.
                tx.enlist_publish(
                    PendingPublish {
                        channel,
                        exchange: topology.exchange.clone(),
                        routing_key: topology.binding.routing_key.clone(),
                        event_type: event.event_type().to_string(),
                        message: wire,
                        purge_queue: options.purge_before_send.then(|| topology.queue.clone()),
                    },
                    &self.metrics,
                );
                debug!(
                    tenant = %tenant,
                    event_type = %event.event_type(),
                    transaction = %tx.id(),
                    "publish deferred"
                );
            }
            None => {
                if options.purge_before_send {
                    let purged = channel.purge(&topology.queue).await?;
                    debug!(tenant = %tenant, queue = %topology.queue, purged, "queue purged before send");
                }
                channel
                    .publish(&topology.exchange, topology.routing_key(), wire)
                    .await?;
                self.metrics.record_published(event.event_type());
                debug!(
                    tenant = %tenant,
                    event_type = %event.event_type(),
                    exchange = %topology.exchange,
                    "event published"
                );
            }
        }
        Ok(())
    }

    /// Publish a [`Routable`] payload with its own mode and target.
    pub async fn publish_event<E: Routable>(
        &self,
        tenant: &TenantId,
        payload: &E,
        options: PublishOptions<'_>,
    ) -> Result<Event, PublishError> {
        let event = Event::of(payload)?;
        self.publish(tenant, &event, E::MODE, E::TARGET, options).await?;
        Ok(event)
    }

    // ── Polling ─────────────────────────────────────────────────────

    /// Declare the queue and binding for `(event_type, mode, target)`.
    ///
    /// BROADCAST consumers bind before anything is published so their queue
    /// receives every copy from then on.
    pub async fn bind(
        &self,
        tenant: &TenantId,
        event_type: &str,
        mode: WorkerMode,
        target: Target,
    ) -> Result<Topology, PollError> {
        let topology = self.resolver.resolve(event_type, mode, target)?;
        let channel = self.channel(tenant).await?;
        self.declare(tenant, &channel, &topology, true).await?;
        Ok(topology)
    }

    async fn fetch(
        &self,
        tenant: &TenantId,
        topology: &Topology,
        timeout: Duration,
    ) -> Result<Option<Fetched>, PollError> {
        let channel = self.channel(tenant).await?;
        self.declare(tenant, &channel, topology, true).await?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = channel.get(&topology.queue).await? {
                let event =
                    Event::from_wire(delivery.message, delivery.redelivered, &topology.event_type);
                self.metrics.record_received(event.event_type());
                return Ok(Some(Fetched {
                    event,
                    channel,
                    tag: delivery.tag,
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }

    /// Ack now, or hand the delivery to the transaction.
    async fn accept(
        &self,
        fetched: Fetched,
        transaction: Option<&Transaction>,
    ) -> Result<Event, PollError> {
        let Fetched {
            event,
            channel,
            tag,
        } = fetched;
        match transaction {
            Some(tx) => tx.enlist_delivery(channel, tag, event.id(), &self.metrics),
            None => {
                channel.ack(tag).await?;
                self.metrics.record_acked(1);
            }
        }
        Ok(event)
    }

    /// Wait up to the timeout for one message.
    ///
    /// `Ok(None)` on timeout. In a transaction the message is only
    /// acknowledged when the transaction commits.
    pub async fn poll(
        &self,
        tenant: &TenantId,
        event_type: &str,
        mode: WorkerMode,
        target: Target,
        options: PollOptions<'_>,
    ) -> Result<Option<Event>, PollError> {
        let topology = self.resolver.resolve(event_type, mode, target)?;
        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        match self.fetch(tenant, &topology, timeout).await? {
            Some(fetched) => Ok(Some(self.accept(fetched, options.transaction).await?)),
            None => Ok(None),
        }
    }

    /// Poll and decode a [`Routable`] payload.
    ///
    /// A message that does not decode is dead-lettered (on commit when
    /// polled in a transaction) and reported as [`PollError::Envelope`].
    pub async fn poll_event<E: Routable>(
        &self,
        tenant: &TenantId,
        options: PollOptions<'_>,
    ) -> Result<Option<(E, Event)>, PollError> {
        let topology = self.resolver.resolve(E::EVENT_TYPE, E::MODE, E::TARGET)?;
        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        let Some(fetched) = self.fetch(tenant, &topology, timeout).await? else {
            return Ok(None);
        };

        match fetched.event.decode_as::<E>() {
            Ok(payload) => {
                let event = self.accept(fetched, options.transaction).await?;
                Ok(Some((payload, event)))
            }
            Err(e) => {
                warn!(
                    tenant = %tenant,
                    event_type = E::EVENT_TYPE,
                    event_id = %fetched.event.id(),
                    error = %e,
                    "undecodable message, dead-lettering"
                );
                match options.transaction {
                    Some(tx) => {
                        let event = self.accept(fetched, Some(tx)).await?;
                        tx.reject(&event);
                    }
                    None => {
                        fetched.channel.nack(fetched.tag, false).await?;
                        self.metrics.record_dead_lettered(1);
                    }
                }
                Err(PollError::Envelope(e))
            }
        }
    }

    /// Wait up to the timeout for a first message, then take whatever else
    /// is ready, up to `max` messages.
    pub async fn poll_batch(
        &self,
        tenant: &TenantId,
        event_type: &str,
        mode: WorkerMode,
        target: Target,
        max: usize,
        options: PollOptions<'_>,
    ) -> Result<Vec<Event>, PollError> {
        let topology = self.resolver.resolve(event_type, mode, target)?;
        let mut timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(fetched) = self.fetch(tenant, &topology, timeout).await? else {
                break;
            };
            batch.push(self.accept(fetched, options.transaction).await?);
            timeout = Duration::ZERO;
        }
        Ok(batch)
    }

    /// Drop every ready message of the resolved queue. Test and reset only.
    pub async fn purge(
        &self,
        tenant: &TenantId,
        event_type: &str,
        mode: WorkerMode,
        target: Target,
    ) -> Result<u32, PollError> {
        let topology = self.resolver.resolve(event_type, mode, target)?;
        let channel = self.channel(tenant).await?;
        self.declare(tenant, &channel, &topology, true).await?;
        Ok(channel.purge(&topology.queue).await?)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn close_channel(&self, tenant: &TenantId) {
        let slot = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant);
        self.forget_declared(tenant);
        let channel = match slot {
            Some(slot) => slot.lock().await.take(),
            None => None,
        };
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(tenant = %tenant, error = %e, "failed to close tenant channel");
            }
        }
    }

    /// Close the tenant's channel and delete its namespace.
    pub async fn remove_tenant(&self, tenant: &TenantId) -> Result<(), ProvisioningError> {
        self.close_channel(tenant).await;
        self.provisioner.remove_namespace(tenant).await?;
        info!(tenant = %tenant, "tenant namespace removed");
        Ok(())
    }

    /// Close every tenant channel. In-flight deliveries return to their queues.
    pub async fn close(&self) {
        let tenants: Vec<TenantId> = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for tenant in &tenants {
            self.close_channel(tenant).await;
        }
        info!(tenants = tenants.len(), "messaging client closed");
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use async_trait::async_trait;

    use crate::topology::ServiceIdentity;
    use crate::transport::memory::InMemoryBroker;
    use crate::vhost::NamespaceHandle;

    const SHORT: Duration = Duration::from_millis(50);

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Routable for Ping {
        const EVENT_TYPE: &'static str = "test.ping";
        const MODE: WorkerMode = WorkerMode::Unicast;
        const TARGET: Target = Target::OneToOne;
    }

    fn client(broker: &InMemoryBroker, instance: &str) -> MessagingClient {
        MessagingClient::new(
            TopologyResolver::new("courier", ServiceIdentity::new("svc", instance)),
            Arc::new(broker.clone()),
            Arc::new(broker.clone()),
            ClientSettings {
                poll_interval: Duration::from_millis(5),
                ..ClientSettings::default()
            },
        )
    }

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    #[tokio::test]
    async fn publish_provisions_namespace_and_declares() {
        let broker = InMemoryBroker::default();
        let c = client(&broker, "a");
        c.publish_event(&tenant("Alpha"), &Ping { n: 1 }, PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(broker.vhosts(), vec!["courier.alpha"]);
        assert_eq!(broker.queue_depth("courier.alpha", "courier.unicast.test.ping"), Some(1));
        let args = broker
            .queue_arguments("courier.alpha", "courier.unicast.test.ping")
            .unwrap();
        assert_eq!(args.dead_letter_exchange.as_deref(), Some("courier.dlx"));
        assert_eq!(args.expires, None);
    }

    #[tokio::test]
    async fn poll_decodes_and_acks() {
        let broker = InMemoryBroker::default();
        let c = client(&broker, "a");
        let t = tenant("alpha");
        c.publish_event(&t, &Ping { n: 42 }, PublishOptions::default())
            .await
            .unwrap();

        let (ping, event) = c
            .poll_event::<Ping>(&t, PollOptions::timeout(SHORT))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ping.n, 42);
        assert_eq!(event.tenant(), Some("alpha"));
        assert!(c
            .poll_event::<Ping>(&t, PollOptions::timeout(SHORT))
            .await
            .unwrap()
            .is_none());
        assert_eq!(c.metrics().snapshot().acked, 1);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let broker = InMemoryBroker::default();
        let c = client(&broker, "a");
        c.publish_event(&tenant("alpha"), &Ping { n: 1 }, PublishOptions::default())
            .await
            .unwrap();
        let got = c
            .poll(&tenant("beta"), "test.ping", WorkerMode::Unicast, Target::OneToOne, PollOptions::timeout(SHORT))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn invalid_topology_fails_before_io() {
        let broker = InMemoryBroker::default();
        let c = client(&broker, "a");
        let event = Event::new("evt", &1u8).unwrap();
        let err = c
            .publish(&tenant("alpha"), &event, WorkerMode::Broadcast, Target::OneToOne, PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Topology(_)));
        assert!(broker.vhosts().is_empty());
    }

    #[tokio::test]
    async fn undecodable_message_is_dead_lettered() {
        let broker = InMemoryBroker::default();
        let c = client(&broker, "a");
        let t = tenant("alpha");
        let bogus = Event::new("test.ping", &"not a ping").unwrap();
        c.publish(&t, &bogus, WorkerMode::Unicast, Target::OneToOne, PublishOptions::default())
            .await
            .unwrap();

        let err = c
            .poll_event::<Ping>(&t, PollOptions::timeout(SHORT))
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Envelope(_)));
        assert_eq!(broker.queue_depth("courier.alpha", "courier.dlq"), Some(1));
        assert_eq!(broker.queue_depth("courier.alpha", "courier.unicast.test.ping"), Some(0));
    }

    #[tokio::test]
    async fn purge_before_send_keeps_only_latest() {
        let broker = InMemoryBroker::default();
        let c = client(&broker, "a");
        let t = tenant("alpha");
        c.publish_event(&t, &Ping { n: 1 }, PublishOptions::default()).await.unwrap();
        c.publish_event(&t, &Ping { n: 2 }, PublishOptions::default().purged())
            .await
            .unwrap();

        let (ping, _) = c
            .poll_event::<Ping>(&t, PollOptions::timeout(SHORT))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ping.n, 2);
    }

    #[tokio::test]
    async fn poll_batch_drains_ready_messages() {
        let broker = InMemoryBroker::default();
        let c = client(&broker, "a");
        let t = tenant("alpha");
        for n in 0..5 {
            c.publish_event(&t, &Ping { n }, PublishOptions::default()).await.unwrap();
        }
        let batch = c
            .poll_batch(&t, "test.ping", WorkerMode::Unicast, Target::OneToOne, 3, PollOptions::timeout(SHORT))
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        let purged = c
            .purge(&t, "test.ping", WorkerMode::Unicast, Target::OneToOne)
            .await
            .unwrap();
        assert_eq!(purged, 2);
    }

    #[tokio::test]
    async fn removed_tenant_is_reprovisioned_on_next_use() {
        let broker = InMemoryBroker::default();
        let c = client(&broker, "a");
        let t = tenant("alpha");
        c.publish_event(&t, &Ping { n: 1 }, PublishOptions::default()).await.unwrap();
        c.remove_tenant(&t).await.unwrap();
        assert!(broker.vhosts().is_empty());

        c.publish_event(&t, &Ping { n: 2 }, PublishOptions::default()).await.unwrap();
        assert_eq!(broker.queue_depth("courier.alpha", "courier.unicast.test.ping"), Some(1));
    }

    /// Provisions through the in-memory broker, hanging on one tenant.
    struct HangsOn {
        broker: InMemoryBroker,
        tenant: TenantId,
    }

    #[async_trait]
    impl NamespaceProvisioner for HangsOn {
        fn vhost_name(&self, tenant: &TenantId) -> String {
            self.broker.vhost_name(tenant)
        }

        async fn ensure_namespace(
            &self,
            tenant: &TenantId,
        ) -> Result<NamespaceHandle, ProvisioningError> {
            if *tenant == self.tenant {
                std::future::pending::<()>().await;
            }
            self.broker.ensure_namespace(tenant).await
        }

        async fn remove_namespace(&self, tenant: &TenantId) -> Result<(), ProvisioningError> {
            self.broker.remove_namespace(tenant).await
        }
    }

    #[tokio::test]
    async fn slow_tenant_does_not_block_connected_ones() {
        let broker = InMemoryBroker::default();
        let c = Arc::new(MessagingClient::new(
            TopologyResolver::new("courier", ServiceIdentity::new("svc", "a")),
            Arc::new(HangsOn {
                broker: broker.clone(),
                tenant: tenant("slow"),
            }),
            Arc::new(broker.clone()),
            ClientSettings::default(),
        ));
        let fast = tenant("fast");
        c.publish_event(&fast, &Ping { n: 1 }, PublishOptions::default())
            .await
            .unwrap();

        let stuck = {
            let c = Arc::clone(&c);
            tokio::spawn(async move {
                c.publish_event(&tenant("slow"), &Ping { n: 2 }, PublishOptions::default())
                    .await
            })
        };
        tokio::task::yield_now().await;

        tokio::time::timeout(
            Duration::from_secs(1),
            c.publish_event(&fast, &Ping { n: 3 }, PublishOptions::default()),
        )
        .await
        .expect("publish waited on another tenant")
        .unwrap();
        assert_eq!(broker.queue_depth("courier.fast", "courier.unicast.test.ping"), Some(2));
        assert!(!stuck.is_finished());
        stuck.abort();
    }
}
