//! In-process broker with AMQP 0-9-1 routing semantics.
//!
//! Models what the messaging client relies on: direct and fanout exchanges,
//! competing consumers on one queue, per-channel delivery tags, requeue on
//! nack or channel close, dead-letter exchanges. It also provisions its own
//! virtual hosts, so it can stand in for the whole broker in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ProvisioningError, TransportError};
use crate::tenant::TenantId;
use crate::topology::ExchangeKind;
use crate::transport::{Broker, BrokerChannel, QueueArguments, RawDelivery, WireMessage};
use crate::vhost::{self, NamespaceHandle, NamespaceProvisioner};

#[derive(Debug, Clone)]
struct Stored {
    routing_key: String,
    redelivered: bool,
    message: WireMessage,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Queue {
    args: QueueArguments,
    ready: VecDeque<Stored>,
}

#[derive(Debug, Default)]
struct VirtualHost {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

impl VirtualHost {
    /// Deliver to every matching queue. Returns the number of copies made.
    fn route(&mut self, exchange: &str, stored: Stored) -> Result<usize, TransportError> {
        // Default exchange: routing key names the queue.
        if exchange.is_empty() {
            return Ok(match self.queues.get_mut(&stored.routing_key) {
                Some(queue) => {
                    queue.ready.push_back(stored);
                    1
                }
                None => 0,
            });
        }

        let ex = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::UnknownExchange(exchange.to_string()))?;
        let targets: Vec<String> = ex
            .bindings
            .iter()
            .filter(|(_, key)| ex.kind == ExchangeKind::Fanout || *key == stored.routing_key)
            .map(|(queue, _)| queue.clone())
            .collect();

        let mut copies = 0;
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(stored.clone());
                copies += 1;
            }
        }
        Ok(copies)
    }

    fn dead_letter(&mut self, queue: &str, mut stored: Stored) {
        let dlx = self
            .queues
            .get(queue)
            .and_then(|q| q.args.dead_letter_exchange.clone());
        match dlx {
            Some(exchange) => {
                stored.redelivered = false;
                if let Err(e) = self.route(&exchange, stored) {
                    debug!(queue, error = %e, "dead-letter exchange missing, message dropped");
                }
            }
            None => debug!(queue, "rejected message dropped (no dead-letter exchange)"),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    vhosts: Mutex<HashMap<String, VirtualHost>>,
}

impl BrokerState {
    fn vhosts(&self) -> MutexGuard<'_, HashMap<String, VirtualHost>> {
        self.vhosts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-memory broker. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
    vhost_prefix: String,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_VHOST_PREFIX)
    }
}

impl InMemoryBroker {
    pub fn new(vhost_prefix: impl Into<String>) -> Self {
        Self {
            state: Arc::new(BrokerState::default()),
            vhost_prefix: vhost_prefix.into(),
        }
    }

    /// Create a virtual host directly, bypassing provisioning.
    pub fn add_vhost(&self, vhost: &str) {
        self.state.vhosts().entry(vhost.to_string()).or_default();
    }

    pub fn vhosts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.vhosts().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the queues declared on `vhost`, sorted.
    pub fn queues(&self, vhost: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .vhosts()
            .get(vhost)
            .map(|v| v.queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Ready (not in-flight) messages in a queue.
    pub fn queue_depth(&self, vhost: &str, queue: &str) -> Option<usize> {
        self.state
            .vhosts()
            .get(vhost)
            .and_then(|v| v.queues.get(queue))
            .map(|q| q.ready.len())
    }

    pub fn queue_arguments(&self, vhost: &str, queue: &str) -> Option<QueueArguments> {
        self.state
            .vhosts()
            .get(vhost)
            .and_then(|v| v.queues.get(queue))
            .map(|q| q.args.clone())
    }

    pub fn exchange_kind(&self, vhost: &str, exchange: &str) -> Option<ExchangeKind> {
        self.state
            .vhosts()
            .get(vhost)
            .and_then(|v| v.exchanges.get(exchange))
            .map(|e| e.kind)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, vhost: &str) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        if !self.state.vhosts().contains_key(vhost) {
            return Err(TransportError::UnknownVhost(vhost.to_string()));
        }
        debug!(vhost, "in-memory channel opened");
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            vhost: vhost.to_string(),
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
        }))
    }
}

#[async_trait]
impl NamespaceProvisioner for InMemoryBroker {
    fn vhost_name(&self, tenant: &TenantId) -> String {
        vhost::vhost_name(&self.vhost_prefix, tenant)
    }

    async fn ensure_namespace(
        &self,
        tenant: &TenantId,
    ) -> Result<NamespaceHandle, ProvisioningError> {
        let vhost = self.vhost_name(tenant);
        self.add_vhost(&vhost);
        Ok(NamespaceHandle {
            tenant: tenant.clone(),
            vhost,
        })
    }

    async fn remove_namespace(&self, tenant: &TenantId) -> Result<(), ProvisioningError> {
        let vhost = self.vhost_name(tenant);
        self.state.vhosts().remove(&vhost);
        Ok(())
    }
}

struct InFlight {
    queue: String,
    stored: Stored,
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    vhost: String,
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, InFlight>>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn unacked(&self) -> MutexGuard<'_, HashMap<u64, InFlight>> {
        self.unacked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against this channel's virtual host. A deleted vhost closes
    /// the channel, as the broker does.
    fn with_vhost<R>(
        &self,
        f: impl FnOnce(&mut VirtualHost) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed(self.vhost.clone()));
        }
        let mut vhosts = self.state.vhosts();
        match vhosts.get_mut(&self.vhost) {
            Some(vhost) => f(vhost),
            None => {
                self.open.store(false, Ordering::Release);
                Err(TransportError::Closed(self.vhost.clone()))
            }
        }
    }

    fn take_unacked(&self, tag: u64) -> Result<InFlight, TransportError> {
        self.unacked()
            .remove(&tag)
            .ok_or(TransportError::UnknownDelivery(tag))
    }

    /// Return every in-flight delivery to the front of its queue, oldest first.
    fn requeue_all(&self) {
        let mut pending: Vec<(u64, InFlight)> = self.unacked().drain().collect();
        if pending.is_empty() {
            return;
        }
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        let mut vhosts = self.state.vhosts();
        let Some(vhost) = vhosts.get_mut(&self.vhost) else {
            return;
        };
        for (_, mut inflight) in pending {
            if let Some(queue) = vhost.queues.get_mut(&inflight.queue) {
                inflight.stored.redelivered = true;
                queue.ready.push_front(inflight.stored);
            }
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.requeue_all();
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        self.with_vhost(|vhost| match vhost.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(TransportError::PreconditionFailed {
                name: name.to_string(),
                existing: existing.kind.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                vhost.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        })
    }

    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<(), TransportError> {
        self.with_vhost(|vhost| {
            vhost.queues.entry(name.to_string()).or_insert_with(|| Queue {
                args: args.clone(),
                ready: VecDeque::new(),
            });
            Ok(())
        })
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.with_vhost(|vhost| {
            if !vhost.queues.contains_key(queue) {
                return Err(TransportError::UnknownQueue(queue.to_string()));
            }
            let ex = vhost
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| TransportError::UnknownExchange(exchange.to_string()))?;
            let binding = (queue.to_string(), routing_key.to_string());
            if !ex.bindings.contains(&binding) {
                ex.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
    ) -> Result<(), TransportError> {
        let copies = self.with_vhost(|vhost| {
            vhost.route(
                exchange,
                Stored {
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    message,
                },
            )
        })?;
        if copies == 0 {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<RawDelivery>, TransportError> {
        let stored = self.with_vhost(|vhost| {
            let q = vhost
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
            Ok(q.ready.pop_front())
        })?;
        let Some(stored) = stored else {
            return Ok(None);
        };

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let delivery = RawDelivery {
            tag,
            redelivered: stored.redelivered,
            message: stored.message.clone(),
        };
        self.unacked().insert(
            tag,
            InFlight {
                queue: queue.to_string(),
                stored,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, tag: u64) -> Result<(), TransportError> {
        self.with_vhost(|_| Ok(()))?;
        self.take_unacked(tag).map(|_| ())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.with_vhost(|_| Ok(()))?;
        let InFlight { queue, mut stored } = self.take_unacked(tag)?;
        self.with_vhost(|vhost| {
            if requeue {
                stored.redelivered = true;
                if let Some(q) = vhost.queues.get_mut(&queue) {
                    q.ready.push_front(stored);
                }
            } else {
                vhost.dead_letter(&queue, stored);
            }
            Ok(())
        })
    }

    async fn purge(&self, queue: &str) -> Result<u32, TransportError> {
        self.with_vhost(|vhost| {
            let q = vhost
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
            let count = q.ready.len();
            q.ready.clear();
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.requeue_all();
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.state.vhosts().contains_key(&self.vhost)
    }
}
