use async_trait::async_trait;
use kube::{Api, Client, api::ListParams};
use kube_runtime::reflector::{ObjectRef, Store};
use tenant_controller_apis::Tenant;

use crate::errors::{ControllerError, ExtKubeApiError};

#[cfg(test)]
use mockall::automock;

/// Read access to [`Tenant`] objects by work queue key (`namespace/name`).
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait TenantFetcher: Send + Sync {
    /// Returns an owned copy of the tenant, `None` if it does not exist.
    async fn by_key(&self, key: &str) -> Result<Option<Tenant>, ControllerError>;

    /// Number of known tenants.
    async fn count(&self) -> Result<usize, ControllerError>;
}

/// Split a `namespace/name` key. A key without `/` denotes a cluster scoped name.
pub(crate) fn split_key(key: &str) -> Result<(&str, &str), ControllerError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] => Ok(("", *name)),
        [namespace, name] => Ok((*namespace, *name)),
        _ => Err(ControllerError::InvalidKey(key.to_string())),
    }
}

/// [`TenantFetcher`] backed by a reflector cache.
pub(crate) struct StoreTenantFetcher {
    store: Store<Tenant>,
}

impl StoreTenantFetcher {
    pub fn new(store: Store<Tenant>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TenantFetcher for StoreTenantFetcher {
    async fn by_key(&self, key: &str) -> Result<Option<Tenant>, ControllerError> {
        let (namespace, name) = split_key(key)?;
        let object_ref = ObjectRef::<Tenant>::new(name).within(namespace);
        // The store hands out shared objects, callers get their own copy.
        Ok(self.store.get(&object_ref).map(|t| t.as_ref().clone()))
    }

    async fn count(&self) -> Result<usize, ControllerError> {
        Ok(self.store.state().len())
    }
}

/// [`TenantFetcher`] reading directly from the Kubernetes API server.
pub(crate) struct ApiTenantFetcher {
    client: Client,
}

impl ApiTenantFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TenantFetcher for ApiTenantFetcher {
    async fn by_key(&self, key: &str) -> Result<Option<Tenant>, ControllerError> {
        let (namespace, name) = split_key(key)?;
        let api: Api<Tenant> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(tenant) => Ok(Some(tenant)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e)?,
        }
    }

    async fn count(&self) -> Result<usize, ControllerError> {
        let api: Api<Tenant> = Api::all(self.client.clone());
        Ok(api.list_metadata(&ListParams::default()).await?.items.len())
    }
}
