use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "tenant.rustrial.org";

/// The K8s finalizer name.
///
/// Note, changing the finalizer name is a breaking change and needs
/// additional code to remove the old finalizer (name) from all affected
/// K8s objects. So, think twice before you rename it, otherwise users might
/// be stuck with Tenant objects which cannot be deleted as they have a finalizer
/// set which is not automatically removed.
pub const FINALIZER: &'static str = "tenant.rustrial.org/tenant-controller";

/// Label (with empty value) put on every RoleBinding reconciled by the controller.
pub const SYSTEM_MANAGED_LABEL: &'static str = "tenant.rustrial.org/system-managed";

/// Label on tenant namespaces holding the tenant namespace prefix of the client.
pub const NAMESPACE_PREFIX_LABEL: &'static str = "tenant.rustrial.org/prefix";

/// Label on tenant namespaces holding the name of the owning Tenant.
pub const NAMESPACE_ID_LABEL: &'static str = "tenant.rustrial.org/id";

/// Client namespace annotation: prefix of all tenant namespaces of that client.
pub const TENANT_NAMESPACE_PREFIX_ANNOTATION: &'static str =
    "tenant.rustrial.org/tenant-namespace-prefix";

/// Client namespace annotation: name of the ClusterRole bound in tenant namespaces.
pub const TENANT_ROLE_ANNOTATION: &'static str = "tenant.rustrial.org/tenant-role";

/// Client namespace annotation: length of the random tenant namespace name suffix.
pub const TENANT_NAMESPACE_SUFFIX_LENGTH_ANNOTATION: &'static str =
    "tenant.rustrial.org/tenant-namespace-suffix-length";

pub const READY: &'static str = "Ready";

/// Status condition of a Tenant, the `Ready` condition being the one the controller maintains.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// A tenant of a client, which gets its own isolated namespace.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tenant.rustrial.org",
    version = "v1alpha1",
    kind = "Tenant",
    derive = "PartialEq",
    status = "TenantStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether the tenant namespace is provisioned and its RoleBinding is in sync."
    }"#,
    printcolumn = r#"{
        "name":"Namespace",
        "type": "string",
        "jsonPath": ".status.tenantNamespaceName",
        "description": "The namespace provisioned for this tenant."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// Logical name of the tenant (informational only).
    #[serde(default)]
    pub name: String,
    /// Human readable name of the tenant (informational only).
    #[serde(default)]
    pub display_name: String,
}

/// Legacy progress indicator, superseded by the `Ready` condition.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum TenantProgress {
    Initializing,
    Ready,
}

/// Legacy result indicator, superseded by the `Ready` condition.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum TenantResult {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "error_infra")]
    ErrorInfra,
    #[serde(rename = "error_content")]
    ErrorContent,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<TenantProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TenantResult>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Name of the namespace provisioned for this tenant, empty until created.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant_namespace_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl Tenant {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .iter()
            .flatten()
            .any(|f| f.as_str() == finalizer)
    }

    /// The provisioned tenant namespace, empty if not yet initialized.
    pub fn tenant_namespace_name(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.tenant_namespace_name.as_str())
            .unwrap_or("")
    }

    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == tpe))
    }

    pub fn status_mut(&mut self) -> &mut TenantStatus {
        self.status.get_or_insert_with(TenantStatus::default)
    }

    pub fn update_condition(&mut self, c: Condition) {
        self.status_mut().update_condition(c);
    }
}

impl TenantStatus {
    /// Insert or replace the condition with the same type. An existing condition
    /// with identical status, reason and message is left untouched and the
    /// transition time only moves when the status value changes.
    pub fn update_condition(&mut self, mut c: Condition) {
        let conditions: &mut Vec<Condition> = self.conditions.get_or_insert_with(Vec::new);
        match conditions.iter_mut().find(|e| e.type_ == c.type_) {
            Some(existing) => {
                if existing.status == c.status
                    && existing.reason == c.reason
                    && existing.message == c.message
                {
                    return;
                }
                c.last_transition_time = if existing.status == c.status {
                    existing.last_transition_time.clone()
                } else {
                    Some(now())
                };
                *existing = c;
            }
            None => {
                c.last_transition_time = Some(now());
                conditions.push(c);
            }
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn spec_wire_format() {
        let p = TenantSpec {
            name: "t1".to_string(),
            display_name: "Tenant One".to_string(),
        };
        assert_eq!(
            r#"{"name":"t1","displayName":"Tenant One"}"#,
            serde_json::to_string(&p).unwrap()
        );
    }

    #[test]
    fn status_wire_format() {
        let mut status = TenantStatus::default();
        assert_eq!("{}", serde_json::to_string(&status).unwrap());
        status.tenant_namespace_name = "prefix1-t1-abc123".to_string();
        status.result = Some(TenantResult::ErrorInfra);
        status.progress = Some(TenantProgress::Ready);
        assert_eq!(
            r#"{"progress":"Ready","result":"error_infra","tenantNamespaceName":"prefix1-t1-abc123"}"#,
            serde_json::to_string(&status).unwrap()
        );
    }

    #[test]
    fn update_condition() {
        let mut status = TenantStatus::default();
        status.update_condition(Condition::new(READY, Some(false), "Failed", "x".into()));
        let first = status.conditions.clone().unwrap();
        assert_eq!(1, first.len());
        assert!(first[0].last_transition_time.is_some());

        // Identical condition does not change anything.
        status.update_condition(Condition::new(READY, Some(false), "Failed", "x".into()));
        assert_eq!(Some(first.clone()), status.conditions);

        // Same status, different message keeps the transition time.
        status.update_condition(Condition::new(READY, Some(false), "Failed", "y".into()));
        let second = status.conditions.clone().unwrap();
        assert_eq!(1, second.len());
        assert_eq!("y", second[0].message);
        assert_eq!(first[0].last_transition_time, second[0].last_transition_time);

        // Other condition types are kept apart.
        status.update_condition(Condition::new("Other", None, "Unknown", "".into()));
        assert_eq!(2, status.conditions.as_ref().unwrap().len());
        assert_eq!("Unknown", status.conditions.as_ref().unwrap()[1].status);
    }

    #[test]
    fn tenant_accessors() {
        let mut tenant = Tenant {
            metadata: ObjectMeta {
                name: Some("tenant1".to_string()),
                namespace: Some("client1".to_string()),
                finalizers: Some(vec!["other".to_string()]),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        };
        assert_eq!("client1/tenant1", tenant.id());
        assert_eq!("", tenant.tenant_namespace_name());
        assert!(!tenant.has_finalizer(FINALIZER));
        assert!(!tenant.is_deleted());
        assert!(tenant.condition(READY).is_none());

        tenant.update_condition(Condition::new(READY, Some(true), "Success", "ok".into()));
        tenant.status_mut().tenant_namespace_name = "ns".to_string();
        assert!(tenant.condition(READY).unwrap().is_true());
        assert_eq!("ns", tenant.tenant_namespace_name());
    }
}
