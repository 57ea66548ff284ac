//! Resolves a staged object to its tenant and the tenant's enabled destinations.
use crate::errors::{ApiError, DeliveryError};
use crate::types::{DeliveryConfig, TenantInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Source of per-tenant delivery configuration.
#[async_trait]
pub trait TenantConfigStore: Send + Sync {
    /// All configurations stored for the tenant, enabled or not.
    async fn load(&self, tenant_id: &str) -> Result<Vec<DeliveryConfig>, ApiError>;
}

/// Splits `cluster_id/tenant_id/application/pod_name/filename`.
///
/// Anything after the pod segment is the filename, so nested names are kept whole.
pub fn parse_object_key(key: &str) -> Result<TenantInfo, DeliveryError> {
    let segments: Vec<&str> = key.splitn(5, '/').collect();
    if segments.len() < 5 || segments.iter().any(|s| s.is_empty()) {
        return Err(DeliveryError::MalformedKey {
            key: key.to_string(),
        });
    }

    Ok(TenantInfo {
        cluster_id: segments[0].to_string(),
        tenant_id: segments[1].to_string(),
        application: segments[2].to_string(),
        pod_name: segments[3].to_string(),
        filename: segments[4].to_string(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub tenant: TenantInfo,
    /// Only enabled entries belonging to the tenant.
    pub configs: Vec<DeliveryConfig>,
}

#[derive(Clone)]
pub struct TenantResolver {
    store: Arc<dyn TenantConfigStore>,
}

impl TenantResolver {
    pub fn new(store: Arc<dyn TenantConfigStore>) -> Self {
        TenantResolver { store }
    }

    pub async fn resolve(&self, key: &str) -> Result<Resolution, DeliveryError> {
        let tenant = parse_object_key(key)?;

        let stored = self
            .store
            .load(&tenant.tenant_id)
            .await
            .map_err(DeliveryError::ConfigStore)?;

        let configs: Vec<DeliveryConfig> = stored
            .into_iter()
            .filter(|config| {
                if config.tenant_id != tenant.tenant_id {
                    tracing::warn!(
                        tenant_id = %tenant.tenant_id,
                        config_tenant_id = %config.tenant_id,
                        "Ignoring delivery config stored under another tenant"
                    );
                    return false;
                }
                config.enabled
            })
            .collect();

        if configs.is_empty() {
            return Err(DeliveryError::UnknownTenant(tenant.tenant_id));
        }

        tracing::debug!(
            tenant_id = %tenant.tenant_id,
            destinations = configs.len(),
            "Resolved delivery configs"
        );

        Ok(Resolution { tenant, configs })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FileStoreError {
    #[error("could not read tenant config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse tenant config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Tenant configuration read once from a YAML (or JSON) file.
///
/// Intended for local runs and manual deliveries, where no table is available.
pub struct FileConfigStore {
    by_tenant: HashMap<String, Vec<DeliveryConfig>>,
}

impl FileConfigStore {
    pub fn from_file(path: &Path) -> Result<Self, FileStoreError> {
        let file = std::fs::File::open(path)?;
        let configs: Vec<DeliveryConfig> = serde_yaml::from_reader(file)?;
        Ok(Self::from_configs(configs))
    }

    pub fn from_configs(configs: Vec<DeliveryConfig>) -> Self {
        let mut by_tenant: HashMap<String, Vec<DeliveryConfig>> = HashMap::new();
        for config in configs {
            by_tenant
                .entry(config.tenant_id.clone())
                .or_default()
                .push(config);
        }
        FileConfigStore { by_tenant }
    }
}

#[async_trait]
impl TenantConfigStore for FileConfigStore {
    async fn load(&self, tenant_id: &str) -> Result<Vec<DeliveryConfig>, ApiError> {
        Ok(self.by_tenant.get(tenant_id).cloned().unwrap_or_default())
    }
}
