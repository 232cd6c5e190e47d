use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use kube::{ResourceExt, api::ObjectMeta};
use tenant_controller_apis::{SYSTEM_MANAGED_LABEL, Tenant};

use crate::{
    client_config::ClientConfig,
    clients::RoleBindingClient,
    errors::{ControllerError, ExtKubeApiError},
};

const RBAC_API_GROUP: &'static str = "rbac.authorization.k8s.io";
const DEFAULT_SERVICE_ACCOUNT: &'static str = "default";
const ROLE_BINDING_GENERATE_NAME: &'static str = "tenant-role-binding-";

/// Matches the system-managed label with its empty marker value only.
fn managed_selector() -> String {
    format!("{}=", SYSTEM_MANAGED_LABEL)
}

/// The RoleBinding a tenant namespace should contain: the configured
/// ClusterRole bound to the default service accounts of the tenant
/// namespace and of the client namespace.
pub(crate) fn desired_role_binding(
    tenant: &Tenant,
    tenant_namespace: &str,
    config: &ClientConfig,
) -> RoleBinding {
    let client_namespace = tenant.namespace().unwrap_or_default();
    let mut labels = BTreeMap::new();
    labels.insert(SYSTEM_MANAGED_LABEL.to_string(), "".to_string());
    RoleBinding {
        metadata: ObjectMeta {
            generate_name: Some(ROLE_BINDING_GENERATE_NAME.to_string()),
            namespace: Some(tenant_namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: config.tenant_role().to_string(),
        },
        subjects: Some(vec![
            service_account(tenant_namespace),
            service_account(client_namespace.as_str()),
        ]),
    }
}

fn service_account(namespace: &str) -> Subject {
    Subject {
        api_group: None,
        kind: "ServiceAccount".to_string(),
        name: DEFAULT_SERVICE_ACCOUNT.to_string(),
        namespace: Some(namespace.to_string()),
    }
}

/// Semantic equality of the fields the controller owns. Absent and empty
/// maps, lists and API groups are considered equal.
fn is_up_to_date(actual: &RoleBinding, desired: &RoleBinding) -> bool {
    fn subjects(rb: &RoleBinding) -> Vec<(&str, &str, &str, &str)> {
        rb.subjects
            .iter()
            .flatten()
            .map(|s| {
                (
                    s.api_group.as_deref().unwrap_or(""),
                    s.kind.as_str(),
                    s.name.as_str(),
                    s.namespace.as_deref().unwrap_or(""),
                )
            })
            .collect()
    }
    actual.labels() == desired.labels()
        && actual.annotations() == desired.annotations()
        && actual.role_ref == desired.role_ref
        && subjects(actual) == subjects(desired)
}

/// Converge the system-managed RoleBindings in `tenant_namespace` to exactly
/// one up-to-date binding. A replacement is created before the outdated
/// bindings are deleted, so access is never revoked in between.
///
/// The returned flag tells whether an update was found to be necessary. It is
/// also meaningful on error: `false` together with an error means the current
/// state could not even be determined.
pub(crate) async fn reconcile_tenant_role_binding(
    client: &dyn RoleBindingClient,
    tenant: &Tenant,
    tenant_namespace: &str,
    config: &ClientConfig,
) -> (bool, Result<(), ControllerError>) {
    let existing = match client.list(tenant_namespace, &managed_selector()).await {
        Ok(existing) => existing,
        Err(e) => return (false, Err(e.into())),
    };
    let desired = desired_role_binding(tenant, tenant_namespace, config);
    let needs_update = match existing.as_slice() {
        [single] => !is_up_to_date(single, &desired),
        _ => true,
    };
    if !needs_update {
        return (false, Ok(()));
    }
    (
        true,
        replace_role_bindings(client, tenant_namespace, &desired, &existing).await,
    )
}

async fn replace_role_bindings(
    client: &dyn RoleBindingClient,
    tenant_namespace: &str,
    desired: &RoleBinding,
    outdated: &[RoleBinding],
) -> Result<(), ControllerError> {
    let created = client.create(tenant_namespace, desired).await?;
    info!(
        "created RoleBinding {}/{} for ClusterRole {}",
        tenant_namespace,
        created.name_any(),
        desired.role_ref.name
    );
    for rb in outdated {
        match client.delete(tenant_namespace, &rb.name_any(), rb.uid()).await {
            Ok(()) => info!(
                "deleted outdated RoleBinding {}/{}",
                tenant_namespace,
                rb.name_any()
            ),
            Err(e) if e.is_not_found() => debug!(
                "outdated RoleBinding {}/{} does no longer exist",
                tenant_namespace,
                rb.name_any()
            ),
            Err(e) => Err(e)?,
        }
    }
    Ok(())
}
