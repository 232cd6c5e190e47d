//! In-memory stand-in for the parts of the Kubernetes API server the
//! controller talks to.

use crate::{
    clients::{NamespaceClient, NamespaceLister, RoleBindingClient, TenantClient},
    errors::{ControllerError, api_error},
    tenant_fetcher::{TenantFetcher, split_key},
};
use async_trait::async_trait;
use k8s_openapi::{
    api::{core::v1::Namespace, rbac::v1::RoleBinding},
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::Utc,
};
use kube::{Resource, ResourceExt};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tenant_controller_apis::{SYSTEM_MANAGED_LABEL, Tenant};

/// Number of write calls received per kind of object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub tenant_updates: usize,
    pub tenant_status_updates: usize,
    pub namespace_creates: usize,
    pub namespace_deletes: usize,
    pub role_binding_creates: usize,
    pub role_binding_deletes: usize,
}

#[derive(Default)]
struct Failures {
    namespace_list: bool,
    role_binding_list: bool,
    role_binding_create: bool,
    status_update: bool,
}

#[derive(Default)]
struct State {
    tenants: BTreeMap<(String, String), Tenant>,
    namespaces: BTreeMap<String, Namespace>,
    role_bindings: BTreeMap<(String, String), RoleBinding>,
    counters: Counters,
    failures: Failures,
    sequence: u64,
}

impl State {
    fn next(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Assign uid and resource version the way the API server does on create.
    fn admit<K: Resource>(&mut self, object: &mut K) {
        let n = self.next();
        let meta = object.meta_mut();
        meta.uid = Some(format!("uid-{}", n));
        meta.resource_version = Some(n.to_string());
        meta.creation_timestamp = Some(Time(Utc::now()));
        if meta.name.is_none() {
            if let Some(generate_name) = &meta.generate_name {
                meta.name = Some(format!("{}{:05}", generate_name, n));
            }
        }
    }
}

fn not_found(kind: &str, name: &str) -> kube::Error {
    api_error(404, "NotFound", format!("{} {:?} not found", kind, name))
}

fn conflict(kind: &str, name: &str) -> kube::Error {
    api_error(
        409,
        "Conflict",
        format!("Operation cannot be fulfilled on {} {:?}", kind, name),
    )
}

fn internal(message: &str) -> kube::Error {
    api_error(500, "InternalError", message.to_string())
}

/// Matches `k=v` and bare `k` terms joined by `,`.
fn matches_selector(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

fn check_uid(stored: &impl Resource, uid: &Option<String>, kind: &str) -> kube::Result<()> {
    match uid {
        Some(uid) if stored.meta().uid.as_ref() != Some(uid) => Err(api_error(
            409,
            "Conflict",
            format!("precondition failed for {} uid {}", kind, uid),
        )),
        _ => Ok(()),
    }
}

pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Default::default(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn counters(&self) -> Counters {
        self.state().counters.clone()
    }

    pub fn add_namespace(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
    ) -> Namespace {
        let to_map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        let mut namespace = Namespace::default();
        namespace.metadata.name = Some(name.to_string());
        namespace.metadata.labels = Some(to_map(labels));
        namespace.metadata.annotations = Some(to_map(annotations));
        let mut state = self.state();
        state.admit(&mut namespace);
        state
            .namespaces
            .insert(name.to_string(), namespace.clone());
        namespace
    }

    pub fn set_namespace_annotation(&self, name: &str, key: &str, value: &str) {
        let mut state = self.state();
        if let Some(namespace) = state.namespaces.get_mut(name) {
            namespace
                .annotations_mut()
                .insert(key.to_string(), value.to_string());
        }
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.state().namespaces.get(name).cloned()
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.state().namespaces.keys().cloned().collect()
    }

    /// Delete a namespace behind the controller's back.
    pub fn remove_namespace(&self, name: &str) {
        let mut state = self.state();
        state.namespaces.remove(name);
        state.role_bindings.retain(|(ns, _), _| ns != name);
    }

    pub fn mark_namespace_terminating(&self, name: &str) {
        if let Some(namespace) = self.state().namespaces.get_mut(name) {
            namespace.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
    }

    pub fn add_tenant(&self, mut tenant: Tenant) -> Tenant {
        let mut state = self.state();
        state.admit(&mut tenant);
        let key = (tenant.namespace().unwrap_or_default(), tenant.name_any());
        state.tenants.insert(key, tenant.clone());
        tenant
    }

    pub fn tenant(&self, namespace: &str, name: &str) -> Option<Tenant> {
        self.state()
            .tenants
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Request deletion of a Tenant, which is removed right away unless it has finalizers.
    pub fn delete_tenant(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        let key = (namespace.to_string(), name.to_string());
        let has_finalizers = match state.tenants.get_mut(&key) {
            Some(tenant) => {
                tenant.metadata.deletion_timestamp = Some(Time(Utc::now()));
                !tenant.finalizers().is_empty()
            }
            None => return,
        };
        if !has_finalizers {
            state.tenants.remove(&key);
        }
    }

    pub fn add_role_binding(&self, namespace: &str, mut role_binding: RoleBinding) -> RoleBinding {
        let mut state = self.state();
        state.admit(&mut role_binding);
        role_binding.metadata.namespace = Some(namespace.to_string());
        state.role_bindings.insert(
            (namespace.to_string(), role_binding.name_any()),
            role_binding.clone(),
        );
        role_binding
    }

    /// RoleBindings in `namespace` carrying the empty system-managed marker.
    pub fn role_bindings(&self, namespace: &str) -> Vec<RoleBinding> {
        self.all_role_bindings(namespace)
            .into_iter()
            .filter(|rb| rb.labels().get(SYSTEM_MANAGED_LABEL).map(String::as_str) == Some(""))
            .collect()
    }

    pub fn all_role_bindings(&self, namespace: &str) -> Vec<RoleBinding> {
        self.state()
            .role_bindings
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, rb)| rb.clone())
            .collect()
    }

    pub fn fail_namespace_list(&self, fail: bool) {
        self.state().failures.namespace_list = fail;
    }

    pub fn fail_role_binding_list(&self, fail: bool) {
        self.state().failures.role_binding_list = fail;
    }

    pub fn fail_role_binding_create(&self, fail: bool) {
        self.state().failures.role_binding_create = fail;
    }

    pub fn fail_status_update(&self, fail: bool) {
        self.state().failures.status_update = fail;
    }

    fn stored_tenant<'a>(state: &'a mut State, tenant: &Tenant) -> kube::Result<&'a mut Tenant> {
        let key = (tenant.namespace().unwrap_or_default(), tenant.name_any());
        let stored = state
            .tenants
            .get_mut(&key)
            .ok_or_else(|| not_found("tenants", &key.1))?;
        if tenant.resource_version() != stored.resource_version() {
            return Err(conflict("tenants", &key.1));
        }
        Ok(stored)
    }
}

#[async_trait]
impl TenantClient for FakeCluster {
    async fn update(&self, tenant: &Tenant) -> kube::Result<Tenant> {
        let mut state = self.state();
        let rv = state.next().to_string();
        let stored = Self::stored_tenant(&mut state, tenant)?;
        let mut updated = tenant.clone();
        updated.status = stored.status.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.resource_version = Some(rv);
        let remove = updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty();
        state.counters.tenant_updates += 1;
        let key = (updated.namespace().unwrap_or_default(), updated.name_any());
        if remove {
            state.tenants.remove(&key);
        } else {
            state.tenants.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn update_status(&self, tenant: &Tenant) -> kube::Result<Tenant> {
        let mut state = self.state();
        if state.failures.status_update {
            return Err(conflict("tenants", &tenant.name_any()));
        }
        let rv = state.next().to_string();
        let stored = Self::stored_tenant(&mut state, tenant)?;
        stored.status = tenant.status.clone();
        stored.metadata.resource_version = Some(rv);
        let updated = stored.clone();
        state.counters.tenant_status_updates += 1;
        Ok(updated)
    }
}

#[async_trait]
impl TenantFetcher for FakeCluster {
    async fn by_key(&self, key: &str) -> Result<Option<Tenant>, ControllerError> {
        let (namespace, name) = split_key(key)?;
        Ok(self.tenant(namespace, name))
    }

    async fn count(&self) -> Result<usize, ControllerError> {
        Ok(self.state().tenants.len())
    }
}

#[async_trait]
impl NamespaceClient for FakeCluster {
    async fn get(&self, name: &str) -> kube::Result<Namespace> {
        self.namespace(name)
            .ok_or_else(|| not_found("namespaces", name))
    }

    async fn list(&self, label_selector: &str) -> kube::Result<Vec<Namespace>> {
        let state = self.state();
        if state.failures.namespace_list {
            return Err(internal("namespace list failed"));
        }
        Ok(state
            .namespaces
            .values()
            .filter(|ns| matches_selector(label_selector, ns.labels()))
            .cloned()
            .collect())
    }

    async fn create(&self, namespace: &Namespace) -> kube::Result<Namespace> {
        let mut state = self.state();
        let mut created = namespace.clone();
        state.admit(&mut created);
        let name = created.name_any();
        if state.namespaces.contains_key(&name) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("namespaces {:?} already exists", name),
            ));
        }
        state.namespaces.insert(name, created.clone());
        state.counters.namespace_creates += 1;
        Ok(created)
    }

    async fn delete(&self, name: &str, uid: Option<String>) -> kube::Result<()> {
        let mut state = self.state();
        let stored = state
            .namespaces
            .get(name)
            .ok_or_else(|| not_found("namespaces", name))?;
        check_uid(stored, &uid, "namespaces")?;
        state.namespaces.remove(name);
        state.role_bindings.retain(|(ns, _), _| ns != name);
        state.counters.namespace_deletes += 1;
        Ok(())
    }
}

#[async_trait]
impl RoleBindingClient for FakeCluster {
    async fn list(&self, namespace: &str, label_selector: &str) -> kube::Result<Vec<RoleBinding>> {
        if self.state().failures.role_binding_list {
            return Err(internal("rolebinding list failed"));
        }
        Ok(self
            .all_role_bindings(namespace)
            .into_iter()
            .filter(|rb| matches_selector(label_selector, rb.labels()))
            .collect())
    }

    async fn create(&self, namespace: &str, role_binding: &RoleBinding) -> kube::Result<RoleBinding> {
        let mut state = self.state();
        if state.failures.role_binding_create {
            return Err(internal("rolebinding create failed"));
        }
        let mut created = role_binding.clone();
        state.admit(&mut created);
        created.metadata.namespace = Some(namespace.to_string());
        let key = (namespace.to_string(), created.name_any());
        if state.role_bindings.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("rolebindings {:?} already exists", key.1),
            ));
        }
        state.role_bindings.insert(key, created.clone());
        state.counters.role_binding_creates += 1;
        Ok(created)
    }

    async fn delete(&self, namespace: &str, name: &str, uid: Option<String>) -> kube::Result<()> {
        let mut state = self.state();
        let key = (namespace.to_string(), name.to_string());
        let stored = state
            .role_bindings
            .get(&key)
            .ok_or_else(|| not_found("rolebindings", name))?;
        check_uid(stored, &uid, "rolebindings")?;
        state.role_bindings.remove(&key);
        state.counters.role_binding_deletes += 1;
        Ok(())
    }
}

impl NamespaceLister for FakeCluster {
    fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespace(name).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_selectors() {
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        labels.insert("b".to_string(), "".to_string());
        assert!(matches_selector("", &labels));
        assert!(matches_selector("a=1", &labels));
        assert!(matches_selector("a=1,b", &labels));
        assert!(matches_selector("b=", &labels));
        assert!(!matches_selector("a=2", &labels));
        assert!(!matches_selector("c", &labels));
    }
}
