use serde::{Deserialize, Serialize};

pub const DEFAULT_VHOST_PREFIX: &str = "courier.";
pub const DEFAULT_EXCHANGE_PREFIX: &str = "courier";

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for one process using the messaging layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub namespace: NamespaceConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub poll: PollConfig,

    /// Tenants whose namespaces are provisioned at startup.
    #[serde(default)]
    pub bootstrap_tenants: Vec<String>,
}

// ── Section configs ─────────────────────────────────────────────────

/// Broker connection and management API credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_amqp_port")]
    pub amqp_port: u16,

    #[serde(default = "default_management_port")]
    pub management_port: u16,

    /// `http` or `https`.
    #[serde(default = "default_management_scheme")]
    pub management_scheme: String,

    /// Full management base URL, replacing scheme/host/port when set.
    #[serde(default)]
    pub management_url_override: Option<String>,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
}

fn default_host() -> String {
    "localhost".into()
}

fn default_amqp_port() -> u16 {
    5672
}

fn default_management_port() -> u16 {
    15672
}

fn default_management_scheme() -> String {
    "http".into()
}

fn default_username() -> String {
    "guest".into()
}

fn default_password() -> String {
    "guest".into()
}

fn default_connection_timeout_secs() -> u64 {
    10
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            amqp_port: default_amqp_port(),
            management_port: default_management_port(),
            management_scheme: default_management_scheme(),
            management_url_override: None,
            username: default_username(),
            password: default_password(),
            connection_timeout_secs: default_connection_timeout_secs(),
        }
    }
}

/// Naming of tenant namespaces and of the exchanges inside them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Virtual host name = prefix + lowercase tenant.
    #[serde(default = "default_vhost_prefix")]
    pub vhost_prefix: String,

    #[serde(default = "default_exchange_prefix")]
    pub exchange_prefix: String,

    /// Declare work queues with a dead-letter exchange.
    #[serde(default = "default_true")]
    pub dead_letter: bool,

    /// `x-expires` of per-instance queues, 0 disables.
    #[serde(default = "default_instance_queue_expiry_secs")]
    pub instance_queue_expiry_secs: u64,
}

fn default_vhost_prefix() -> String {
    DEFAULT_VHOST_PREFIX.into()
}

fn default_exchange_prefix() -> String {
    DEFAULT_EXCHANGE_PREFIX.into()
}

fn default_true() -> bool {
    true
}

fn default_instance_queue_expiry_secs() -> u64 {
    1800
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            vhost_prefix: default_vhost_prefix(),
            exchange_prefix: default_exchange_prefix(),
            dead_letter: true,
            instance_queue_expiry_secs: default_instance_queue_expiry_secs(),
        }
    }
}

/// Identity of this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Instance id; a random one is generated when absent.
    #[serde(default)]
    pub instance: Option<String>,
}

fn default_service_name() -> String {
    "courier".into()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            instance: None,
        }
    }
}

/// Poll timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Pause between two empty `basic.get` attempts.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    100
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}
