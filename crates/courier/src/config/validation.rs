use crate::error::ConfigError;

use super::types::CourierConfig;

impl CourierConfig {
    /// Reject configurations that would only fail later at the broker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_broker()?;
        self.validate_names()?;
        self.validate_poll()?;
        Ok(())
    }

    fn validate_broker(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.host must not be empty".into()));
        }
        if self.broker.username.is_empty() {
            return Err(ConfigError::Invalid("broker.username must not be empty".into()));
        }
        match self.broker.management_scheme.as_str() {
            "http" | "https" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown broker.management_scheme '{other}' (expected http or https)"
                )));
            }
        }
        if self.broker.connection_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "broker.connection_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    fn validate_names(&self) -> Result<(), ConfigError> {
        let names = [
            ("namespace.exchange_prefix", self.namespace.exchange_prefix.as_str()),
            ("service.name", self.service.name.as_str()),
        ];
        for (field, value) in names {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be non-empty without whitespace, got '{value}'"
                )));
            }
        }
        if let Some(instance) = &self.service.instance {
            if instance.is_empty() || instance.chars().any(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "service.instance must be non-empty without whitespace, got '{instance}'"
                )));
            }
        }
        if self.namespace.vhost_prefix.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(
                "namespace.vhost_prefix must not contain whitespace".into(),
            ));
        }
        for tenant in &self.bootstrap_tenants {
            if tenant.is_empty() || tenant.chars().any(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "bootstrap tenant '{tenant}' must be non-empty without whitespace"
                )));
            }
        }
        Ok(())
    }

    fn validate_poll(&self) -> Result<(), ConfigError> {
        if self.poll.interval_ms == 0 {
            return Err(ConfigError::Invalid("poll.interval_ms must be positive".into()));
        }
        Ok(())
    }
}
