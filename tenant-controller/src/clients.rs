use async_trait::async_trait;
use k8s_openapi::api::{core::v1::Namespace, rbac::v1::RoleBinding};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, PostParams, Preconditions},
};
use kube_runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;
use tenant_controller_apis::Tenant;

#[cfg(test)]
use mockall::automock;

use crate::MANAGER;

/// Write access to [`Tenant`] objects. Both operations carry the object's
/// `resourceVersion`, so a concurrent modification fails with a conflict.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait TenantClient: Send + Sync {
    /// Replace the main resource (metadata and spec).
    async fn update(&self, tenant: &Tenant) -> kube::Result<Tenant>;

    /// Replace the status sub-resource.
    async fn update_status(&self, tenant: &Tenant) -> kube::Result<Tenant>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait NamespaceClient: Send + Sync {
    async fn get(&self, name: &str) -> kube::Result<Namespace>;

    async fn list(&self, label_selector: &str) -> kube::Result<Vec<Namespace>>;

    async fn create(&self, namespace: &Namespace) -> kube::Result<Namespace>;

    /// Delete with an UID precondition.
    async fn delete(&self, name: &str, uid: Option<String>) -> kube::Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait RoleBindingClient: Send + Sync {
    async fn list(&self, namespace: &str, label_selector: &str) -> kube::Result<Vec<RoleBinding>>;

    async fn create(&self, namespace: &str, role_binding: &RoleBinding)
    -> kube::Result<RoleBinding>;

    /// Delete with an UID precondition.
    async fn delete(&self, namespace: &str, name: &str, uid: Option<String>) -> kube::Result<()>;
}

/// Synchronous read access to cached namespaces.
#[cfg_attr(test, automock)]
pub(crate) trait NamespaceLister: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<Namespace>>;
}

fn post_params() -> PostParams {
    let mut pp = PostParams::default();
    pp.field_manager = Some(MANAGER.to_string());
    pp
}

fn delete_params(uid: Option<String>) -> DeleteParams {
    DeleteParams {
        preconditions: uid.map(|uid| Preconditions {
            uid: Some(uid),
            resource_version: None,
        }),
        ..Default::default()
    }
}

/// [`TenantClient`] talking to the Kubernetes API server.
#[derive(Clone)]
pub(crate) struct KubeTenantClient {
    client: Client,
}

impl KubeTenantClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, tenant: &Tenant) -> Api<Tenant> {
        match tenant.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), ns.as_str()),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl TenantClient for KubeTenantClient {
    async fn update(&self, tenant: &Tenant) -> kube::Result<Tenant> {
        self.api(tenant)
            .replace(tenant.name_any().as_str(), &post_params(), tenant)
            .await
    }

    async fn update_status(&self, tenant: &Tenant) -> kube::Result<Tenant> {
        let data = serde_json::to_vec(tenant).map_err(kube::Error::SerdeError)?;
        self.api(tenant)
            .replace_status(tenant.name_any().as_str(), &post_params(), data)
            .await
    }
}

#[derive(Clone)]
pub(crate) struct KubeNamespaceClient {
    api: Api<Namespace>,
}

impl KubeNamespaceClient {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NamespaceClient for KubeNamespaceClient {
    async fn get(&self, name: &str) -> kube::Result<Namespace> {
        self.api.get(name).await
    }

    async fn list(&self, label_selector: &str) -> kube::Result<Vec<Namespace>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api.list(&lp).await?.items)
    }

    async fn create(&self, namespace: &Namespace) -> kube::Result<Namespace> {
        self.api.create(&post_params(), namespace).await
    }

    async fn delete(&self, name: &str, uid: Option<String>) -> kube::Result<()> {
        self.api.delete(name, &delete_params(uid)).await.map(|_| ())
    }
}

#[derive(Clone)]
pub(crate) struct KubeRoleBindingClient {
    client: Client,
}

impl KubeRoleBindingClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<RoleBinding> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RoleBindingClient for KubeRoleBindingClient {
    async fn list(&self, namespace: &str, label_selector: &str) -> kube::Result<Vec<RoleBinding>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api(namespace).list(&lp).await?.items)
    }

    async fn create(
        &self,
        namespace: &str,
        role_binding: &RoleBinding,
    ) -> kube::Result<RoleBinding> {
        self.api(namespace).create(&post_params(), role_binding).await
    }

    async fn delete(&self, namespace: &str, name: &str, uid: Option<String>) -> kube::Result<()> {
        self.api(namespace)
            .delete(name, &delete_params(uid))
            .await
            .map(|_| ())
    }
}

impl NamespaceLister for Store<Namespace> {
    fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        Store::get(self, &ObjectRef::new(name))
    }
}
