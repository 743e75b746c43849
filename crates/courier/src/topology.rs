//! Routing topology resolution.
//!
//! Every service instance computes exchange, queue and binding names locally
//! from `(event type, worker mode, target)` plus its own [`ServiceIdentity`].
//! Independently started instances converge on the same broker topology
//! because the naming below is a pure function of those inputs.
//!
//! | mode      | target       | exchange (kind)                  | queue                          |
//! |-----------|--------------|----------------------------------|--------------------------------|
//! | UNICAST   | ONE_TO_ONE   | `ns.unicast` (direct)            | `ns.unicast.evt`               |
//! | UNICAST   | MICROSERVICE | `ns.unicast.svc` (direct)        | `ns.unicast.svc.evt`           |
//! | UNICAST   | INTERNAL     | `ns.unicast.svc.inst` (direct)   | `ns.unicast.svc.inst.evt`      |
//! | UNICAST   | ALL          | `evt` (direct)                   | `evt.svc`                      |
//! | BROADCAST | MICROSERVICE | `ns.broadcast.svc.evt` (fanout)  | `<exchange>.inst`              |
//! | BROADCAST | ONE_TO_MANY  | `ns.broadcast.evt` (fanout)      | `<exchange>.svc`               |
//! | BROADCAST | ALL          | `ns.broadcast.evt.all` (fanout)  | `<exchange>.svc.inst`          |
//!
//! UNICAST bindings use the event type as routing key. The remaining
//! combinations (UNICAST × ONE_TO_MANY, BROADCAST × ONE_TO_ONE,
//! BROADCAST × INTERNAL) are rejected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TopologyError;

// ── Routing axes ─────────────────────────────────────────────────────

/// Delivery cardinality inside the addressed group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMode {
    /// Competing consumers: one instance receives each message.
    Unicast,
    /// Every bound queue receives its own copy.
    Broadcast,
}

/// Which consumers a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    /// A single consumer across the whole tenant, whatever its service.
    OneToOne,
    /// One copy for every subscribed service.
    OneToMany,
    /// Only the publishing instance.
    Internal,
    /// Instances of one service type (the publisher's own unless overridden).
    Microservice,
    /// Every subscribed service.
    All,
}

impl WorkerMode {
    fn token(self) -> &'static str {
        match self {
            Self::Unicast => "unicast",
            Self::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unicast => "UNICAST",
            Self::Broadcast => "BROADCAST",
        })
    }
}

impl FromStr for WorkerMode {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unicast" => Ok(Self::Unicast),
            "broadcast" => Ok(Self::Broadcast),
            _ => Err(TopologyError::UnknownVariant {
                kind: "worker mode",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OneToOne => "ONE_TO_ONE",
            Self::OneToMany => "ONE_TO_MANY",
            Self::Internal => "INTERNAL",
            Self::Microservice => "MICROSERVICE",
            Self::All => "ALL",
        })
    }
}

impl FromStr for Target {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "one_to_one" => Ok(Self::OneToOne),
            "one_to_many" => Ok(Self::OneToMany),
            "internal" => Ok(Self::Internal),
            "microservice" => Ok(Self::Microservice),
            "all" => Ok(Self::All),
            _ => Err(TopologyError::UnknownVariant {
                kind: "target",
                value: s.to_string(),
            }),
        }
    }
}

// ── Resolved topology ────────────────────────────────────────────────

/// AMQP exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
        })
    }
}

/// How the queue is bound to its exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub kind: ExchangeKind,
    /// Event type for direct exchanges, empty for fanout.
    pub routing_key: String,
}

/// Exchange, queue and binding for one `(event type, mode, target)` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topology {
    pub event_type: String,
    pub exchange: String,
    pub queue: String,
    pub binding: Binding,
    /// The queue belongs to one instance and should expire when unused.
    pub per_instance: bool,
    /// The publisher is itself part of the addressed group, so it declares
    /// the queue too. Otherwise messages published before the first
    /// consumer binds would be unroutable.
    pub publisher_binds: bool,
}

impl Topology {
    pub fn routing_key(&self) -> &str {
        &self.binding.routing_key
    }
}

/// Per-namespace dead-letter exchange and its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub queue: String,
}

// ── Identity ─────────────────────────────────────────────────────────

/// Who is resolving: the service type and this process's instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub service: String,
    pub instance: String,
}

impl ServiceIdentity {
    pub fn new(service: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instance: instance.into(),
        }
    }

    /// Identity with a freshly generated instance id.
    pub fn random_instance(service: impl Into<String>) -> Self {
        Self::new(service, Uuid::new_v4().simple().to_string())
    }
}

// ── Resolver ─────────────────────────────────────────────────────────

/// Computes broker names for this service instance. No I/O.
#[derive(Debug, Clone)]
pub struct TopologyResolver {
    prefix: String,
    identity: ServiceIdentity,
}

impl TopologyResolver {
    pub fn new(prefix: impl Into<String>, identity: ServiceIdentity) -> Self {
        Self {
            prefix: prefix.into(),
            identity,
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolve the topology addressed from this instance.
    pub fn resolve(
        &self,
        event_type: &str,
        mode: WorkerMode,
        target: Target,
    ) -> Result<Topology, TopologyError> {
        self.resolve_for(event_type, mode, target, None)
    }

    /// Resolve with an explicit recipient service for MICROSERVICE targets.
    ///
    /// `recipient` replaces the resolver's own service name in the names,
    /// which is how a publisher addresses instances of another service.
    pub fn resolve_for(
        &self,
        event_type: &str,
        mode: WorkerMode,
        target: Target,
        recipient: Option<&str>,
    ) -> Result<Topology, TopologyError> {
        check_name("event type", event_type)?;
        check_name("exchange prefix", &self.prefix)?;
        check_name("service name", &self.identity.service)?;
        check_name("instance id", &self.identity.instance)?;

        let service = match recipient {
            Some(name) if target == Target::Microservice => {
                check_name("recipient service", name)?;
                name
            }
            Some(_) => return Err(TopologyError::RecipientNotAllowed { target }),
            None => self.identity.service.as_str(),
        };
        // Addressing another service means this instance is not in the group.
        let self_addressed = service == self.identity.service;

        let ns = &self.prefix;
        let inst = &self.identity.instance;
        let evt = event_type;
        let token = mode.token();

        let topology = match (mode, target) {
            (WorkerMode::Unicast, Target::OneToOne) => {
                let exchange = format!("{ns}.{token}");
                direct(evt, format!("{exchange}.{evt}"), exchange, false, true)
            }
            (WorkerMode::Unicast, Target::Microservice) => {
                let exchange = format!("{ns}.{token}.{service}");
                direct(evt, format!("{exchange}.{evt}"), exchange, false, self_addressed)
            }
            (WorkerMode::Unicast, Target::Internal) => {
                let exchange = format!("{ns}.{token}.{service}.{inst}");
                direct(evt, format!("{exchange}.{evt}"), exchange, true, true)
            }
            (WorkerMode::Unicast, Target::All) => {
                direct(evt, format!("{evt}.{service}"), evt.to_string(), false, false)
            }
            (WorkerMode::Broadcast, Target::Microservice) => {
                let exchange = format!("{ns}.{token}.{service}.{evt}");
                fanout(evt, format!("{exchange}.{inst}"), exchange, true)
            }
            (WorkerMode::Broadcast, Target::OneToMany) => {
                let exchange = format!("{ns}.{token}.{evt}");
                fanout(evt, format!("{exchange}.{service}"), exchange, false)
            }
            (WorkerMode::Broadcast, Target::All) => {
                let exchange = format!("{ns}.{token}.{evt}.all");
                fanout(evt, format!("{exchange}.{service}.{inst}"), exchange, true)
            }
            (WorkerMode::Unicast, Target::OneToMany)
            | (WorkerMode::Broadcast, Target::OneToOne)
            | (WorkerMode::Broadcast, Target::Internal) => {
                return Err(TopologyError::Unsupported { mode, target });
            }
        };

        Ok(topology)
    }

    /// Dead-letter exchange and queue shared by every queue of a namespace.
    pub fn dead_letter(&self) -> DeadLetter {
        DeadLetter {
            exchange: format!("{}.dlx", self.prefix),
            queue: format!("{}.dlq", self.prefix),
        }
    }
}

fn direct(
    event_type: &str,
    queue: String,
    exchange: String,
    per_instance: bool,
    publisher_binds: bool,
) -> Topology {
    Topology {
        event_type: event_type.to_string(),
        exchange,
        queue,
        binding: Binding {
            kind: ExchangeKind::Direct,
            routing_key: event_type.to_string(),
        },
        per_instance,
        publisher_binds,
    }
}

fn fanout(event_type: &str, queue: String, exchange: String, per_instance: bool) -> Topology {
    Topology {
        event_type: event_type.to_string(),
        exchange,
        queue,
        binding: Binding {
            kind: ExchangeKind::Fanout,
            routing_key: String::new(),
        },
        per_instance,
        publisher_binds: false,
    }
}

fn check_name(field: &'static str, value: &str) -> Result<(), TopologyError> {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err(TopologyError::InvalidName {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
