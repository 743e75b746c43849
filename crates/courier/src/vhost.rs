//! Tenant virtual-host provisioning through the broker management API.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{BrokerConfig, NamespaceConfig};
use crate::error::ProvisioningError;
use crate::tenant::TenantId;

/// A tenant namespace known to exist on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceHandle {
    pub tenant: TenantId,
    pub vhost: String,
}

/// Creates and removes the isolated broker namespace of a tenant.
#[async_trait]
pub trait NamespaceProvisioner: Send + Sync {
    /// Name of the virtual host backing `tenant`. Pure.
    fn vhost_name(&self, tenant: &TenantId) -> String;

    /// Make sure the tenant namespace exists and the service account may use it.
    ///
    /// Idempotent and safe to call from many instances at once.
    async fn ensure_namespace(&self, tenant: &TenantId)
        -> Result<NamespaceHandle, ProvisioningError>;

    /// Delete the tenant namespace. A namespace that is already gone is fine.
    async fn remove_namespace(&self, tenant: &TenantId) -> Result<(), ProvisioningError>;
}

#[async_trait]
impl<T: NamespaceProvisioner + ?Sized> NamespaceProvisioner for Arc<T> {
    fn vhost_name(&self, tenant: &TenantId) -> String {
        (**self).vhost_name(tenant)
    }

    async fn ensure_namespace(
        &self,
        tenant: &TenantId,
    ) -> Result<NamespaceHandle, ProvisioningError> {
        (**self).ensure_namespace(tenant).await
    }

    async fn remove_namespace(&self, tenant: &TenantId) -> Result<(), ProvisioningError> {
        (**self).remove_namespace(tenant).await
    }
}

/// `prefix + lowercase(tenant)`.
pub fn vhost_name(prefix: &str, tenant: &TenantId) -> String {
    format!("{prefix}{}", tenant.as_str().to_lowercase())
}

#[derive(Debug, Deserialize)]
struct VhostEntry {
    name: String,
}

#[derive(Debug, Serialize)]
struct PermissionGrant<'a> {
    configure: &'a str,
    write: &'a str,
    read: &'a str,
}

/// RabbitMQ management API client.
///
/// Known namespaces are cached per process. A namespace only enters the
/// cache after both creation and permission grant succeeded, so a failed
/// grant is repaired by the next call.
pub struct VirtualHostAdmin {
    http: Client,
    base: Url,
    username: String,
    password: String,
    vhost_prefix: String,
    known: Mutex<HashSet<String>>,
}

impl VirtualHostAdmin {
    pub fn new(broker: &BrokerConfig, namespace: &NamespaceConfig) -> Result<Self, ProvisioningError> {
        let endpoint = broker.management_url();
        let base = Url::parse(&endpoint)
            .map_err(|e| ProvisioningError::Endpoint(format!("{endpoint}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ProvisioningError::Endpoint(endpoint));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(broker.connection_timeout_secs))
            .build()
            .map_err(|source| ProvisioningError::Unreachable {
                endpoint: endpoint.clone(),
                source,
            })?;

        Ok(Self {
            http,
            base,
            username: broker.username.clone(),
            password: broker.password.clone(),
            vhost_prefix: namespace.vhost_prefix.clone(),
            known: Mutex::new(HashSet::new()),
        })
    }

    /// `segments` are percent-encoded individually, so vhost names with dots
    /// or slashes stay one path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ProvisioningError> {
        builder.send().await.map_err(|source| ProvisioningError::Unreachable {
            endpoint: self.base.to_string(),
            source,
        })
    }

    /// Every virtual host on the broker.
    pub async fn list_namespaces(&self) -> Result<Vec<String>, ProvisioningError> {
        let resp = self.send(self.request(Method::GET, self.url(&["vhosts"]))).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProvisioningError::ListRejected {
                status: status.as_u16(),
                body,
            });
        }
        let entries: Vec<VhostEntry> =
            resp.json().await.map_err(|source| ProvisioningError::Unreachable {
                endpoint: self.base.to_string(),
                source,
            })?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    /// The management API answers an authenticated listing.
    pub async fn broker_running(&self) -> bool {
        match self.list_namespaces().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "broker liveness check failed");
                false
            }
        }
    }

    /// Provision every tenant in `tenants`, stopping at the first failure.
    pub async fn provision_bootstrap(
        &self,
        tenants: &[TenantId],
    ) -> Result<Vec<NamespaceHandle>, ProvisioningError> {
        let mut handles = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            handles.push(self.ensure_namespace(tenant).await?);
        }
        info!(count = handles.len(), "bootstrap tenants provisioned");
        Ok(handles)
    }

    async fn create_vhost(&self, vhost: &str) -> Result<(), ProvisioningError> {
        let resp = self
            .send(self.request(Method::PUT, self.url(&["vhosts", vhost])))
            .await?;
        let status = resp.status();
        // A concurrent creator winning the race is not a failure.
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        warn!(vhost, status = status.as_u16(), "virtual host creation rejected");
        Err(ProvisioningError::CreateRejected {
            vhost: vhost.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn grant_permissions(&self, vhost: &str) -> Result<(), ProvisioningError> {
        let grant = PermissionGrant {
            configure: ".*",
            write: ".*",
            read: ".*",
        };
        let resp = self
            .send(
                self.request(Method::PUT, self.url(&["permissions", vhost, self.username.as_str()]))
                    .json(&grant),
            )
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        warn!(vhost, user = %self.username, status = status.as_u16(), "permission grant rejected");
        Err(ProvisioningError::PermissionRejected {
            vhost: vhost.to_string(),
            user: self.username.clone(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl NamespaceProvisioner for VirtualHostAdmin {
    fn vhost_name(&self, tenant: &TenantId) -> String {
        vhost_name(&self.vhost_prefix, tenant)
    }

    #[instrument(skip_all, fields(tenant = %tenant))]
    async fn ensure_namespace(
        &self,
        tenant: &TenantId,
    ) -> Result<NamespaceHandle, ProvisioningError> {
        let vhost = self.vhost_name(tenant);
        let handle = NamespaceHandle {
            tenant: tenant.clone(),
            vhost: vhost.clone(),
        };
        if self.known.lock().await.contains(&vhost) {
            return Ok(handle);
        }

        let existing = self.list_namespaces().await?;
        if existing.iter().any(|name| name == &vhost) {
            debug!(vhost = %vhost, "virtual host already exists");
        } else {
            self.create_vhost(&vhost).await?;
            info!(vhost = %vhost, "virtual host created");
        }
        // Always (re)grant: the PUT is idempotent and repairs a vhost whose
        // earlier grant failed.
        self.grant_permissions(&vhost).await?;

        self.known.lock().await.insert(vhost);
        Ok(handle)
    }

    #[instrument(skip_all, fields(tenant = %tenant))]
    async fn remove_namespace(&self, tenant: &TenantId) -> Result<(), ProvisioningError> {
        let vhost = self.vhost_name(tenant);
        self.known.lock().await.remove(&vhost);

        let resp = self
            .send(self.request(Method::DELETE, self.url(&["vhosts", vhost.as_str()])))
            .await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            info!(vhost = %vhost, "virtual host removed");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ProvisioningError::RemoveRejected {
            vhost,
            status: status.as_u16(),
            body,
        })
    }
}
