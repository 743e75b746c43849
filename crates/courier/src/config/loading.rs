use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, CourierError};
use crate::tenant::TenantId;
use crate::topology::ServiceIdentity;

use super::types::{BrokerConfig, CourierConfig};

impl CourierConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults for a broker on localhost, with environment overrides applied.
    pub fn local() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Identity of this process; generates an instance id when none is set.
    pub fn identity(&self) -> ServiceIdentity {
        match &self.service.instance {
            Some(instance) => ServiceIdentity::new(&self.service.name, instance),
            None => ServiceIdentity::random_instance(&self.service.name),
        }
    }

    pub fn bootstrap_tenants(&self) -> Result<Vec<TenantId>, CourierError> {
        self.bootstrap_tenants
            .iter()
            .map(|t| TenantId::new(t.as_str()).map_err(CourierError::from))
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }

    pub fn default_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll.default_timeout_ms)
    }

    /// `None` when instance queues should not expire.
    pub fn instance_queue_expiry(&self) -> Option<Duration> {
        match self.namespace.instance_queue_expiry_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `COURIER_SECTION_KEY` overrides `section.key`, e.g.
    /// `COURIER_BROKER_HOST` → `broker.host`. Unparsable numbers are ignored.
    /// `COURIER_BOOTSTRAP_TENANTS` is a comma-separated list.
    pub(crate) fn apply_env_overrides(&mut self) {
        override_string("COURIER_BROKER_HOST", &mut self.broker.host);
        override_parsed("COURIER_BROKER_AMQP_PORT", &mut self.broker.amqp_port);
        override_parsed("COURIER_BROKER_MANAGEMENT_PORT", &mut self.broker.management_port);
        override_string("COURIER_BROKER_MANAGEMENT_SCHEME", &mut self.broker.management_scheme);
        if let Ok(v) = std::env::var("COURIER_BROKER_MANAGEMENT_URL") {
            self.broker.management_url_override = Some(v);
        }
        override_string("COURIER_BROKER_USERNAME", &mut self.broker.username);
        override_string("COURIER_BROKER_PASSWORD", &mut self.broker.password);
        override_parsed(
            "COURIER_BROKER_CONNECTION_TIMEOUT_SECS",
            &mut self.broker.connection_timeout_secs,
        );

        override_string("COURIER_NAMESPACE_VHOST_PREFIX", &mut self.namespace.vhost_prefix);
        override_string("COURIER_NAMESPACE_EXCHANGE_PREFIX", &mut self.namespace.exchange_prefix);
        override_parsed("COURIER_NAMESPACE_DEAD_LETTER", &mut self.namespace.dead_letter);
        override_parsed(
            "COURIER_NAMESPACE_INSTANCE_QUEUE_EXPIRY_SECS",
            &mut self.namespace.instance_queue_expiry_secs,
        );

        override_string("COURIER_SERVICE_NAME", &mut self.service.name);
        if let Ok(v) = std::env::var("COURIER_SERVICE_INSTANCE") {
            self.service.instance = Some(v);
        }

        override_parsed("COURIER_POLL_INTERVAL_MS", &mut self.poll.interval_ms);
        override_parsed("COURIER_POLL_DEFAULT_TIMEOUT_MS", &mut self.poll.default_timeout_ms);

        if let Ok(v) = std::env::var("COURIER_BOOTSTRAP_TENANTS") {
            self.bootstrap_tenants = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }
}

fn override_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *target = v;
    }
}

fn override_parsed<T: FromStr>(key: &str, target: &mut T) {
    if let Some(v) = std::env::var(key).ok().and_then(|v| v.parse().ok()) {
        *target = v;
    }
}

impl BrokerConfig {
    /// AMQP URI for `vhost`, percent-encoding the vhost name.
    pub fn amqp_uri(&self, vhost: &str) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            encode_component(&self.username),
            encode_component(&self.password),
            self.host,
            self.amqp_port,
            encode_component(vhost),
        )
    }

    /// Base URL of the management HTTP API.
    pub fn management_url(&self) -> String {
        match &self.management_url_override {
            Some(url) => url.clone(),
            None => format!(
                "{}://{}:{}",
                self.management_scheme, self.host, self.management_port
            ),
        }
    }
}

fn encode_component(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
