use std::sync::Arc;

use kube::ResourceExt;
use tenant_controller_apis::{
    TENANT_NAMESPACE_PREFIX_ANNOTATION, TENANT_NAMESPACE_SUFFIX_LENGTH_ANNOTATION,
    TENANT_ROLE_ANNOTATION,
};

use crate::{clients::NamespaceLister, errors::ControllerError};

#[cfg(test)]
use mockall::automock;

/// Raw suffix length recorded when the annotation is absent.
const SUFFIX_LENGTH_UNSET: i8 = -1;
const DEFAULT_SUFFIX_LENGTH: usize = 6;
const MAX_SUFFIX_LENGTH: usize = 32;

/// Tenant provisioning parameters of a client, derived from the annotations
/// of the client namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ClientConfig {
    tenant_namespace_prefix: String,
    tenant_role: String,
    raw_suffix_length: i8,
}

impl ClientConfig {
    pub fn new(tenant_namespace_prefix: &str, tenant_role: &str, raw_suffix_length: i8) -> Self {
        Self {
            tenant_namespace_prefix: tenant_namespace_prefix.to_string(),
            tenant_role: tenant_role.to_string(),
            raw_suffix_length,
        }
    }

    pub fn tenant_namespace_prefix(&self) -> &str {
        &self.tenant_namespace_prefix
    }

    /// Name of the ClusterRole bound to the service accounts in tenant namespaces.
    pub fn tenant_role(&self) -> &str {
        &self.tenant_role
    }

    /// Length of the random tenant namespace suffix. Negative raw values
    /// (including "unset") yield the default, values above the maximum are capped.
    pub fn tenant_namespace_suffix_length(&self) -> usize {
        if self.raw_suffix_length < 0 {
            DEFAULT_SUFFIX_LENGTH
        } else {
            (self.raw_suffix_length as usize).min(MAX_SUFFIX_LENGTH)
        }
    }
}

#[cfg_attr(test, automock)]
pub(crate) trait ClientConfigLoader: Send + Sync {
    /// Load the configuration of the client owning `client_namespace`.
    ///
    /// # Panics
    ///
    /// If `client_namespace` is empty.
    fn load(&self, client_namespace: &str) -> Result<ClientConfig, ControllerError>;
}

/// [`ClientConfigLoader`] reading annotations of cached client namespaces.
pub(crate) struct AnnotationConfigLoader {
    namespaces: Arc<dyn NamespaceLister>,
}

impl AnnotationConfigLoader {
    pub fn new(namespaces: Arc<dyn NamespaceLister>) -> Self {
        Self { namespaces }
    }
}

impl ClientConfigLoader for AnnotationConfigLoader {
    fn load(&self, client_namespace: &str) -> Result<ClientConfig, ControllerError> {
        assert!(
            !client_namespace.is_empty(),
            "client namespace name must not be empty"
        );
        let namespace = self
            .namespaces
            .get(client_namespace)
            .ok_or_else(|| ControllerError::ClientNamespaceNotFound(client_namespace.to_string()))?;
        let annotations = namespace.annotations();
        let required = |key: &str| -> Result<String, ControllerError> {
            match annotations.get(key).map(|v| v.as_str()) {
                None => Err(ControllerError::Configuration(format!(
                    "annotation {:?} is missing on client namespace {:?}",
                    key, client_namespace
                ))),
                Some("") => Err(ControllerError::Configuration(format!(
                    "annotation {:?} must not be empty on client namespace {:?}",
                    key, client_namespace
                ))),
                Some(v) => Ok(v.to_string()),
            }
        };
        let tenant_namespace_prefix = required(TENANT_NAMESPACE_PREFIX_ANNOTATION)?;
        let tenant_role = required(TENANT_ROLE_ANNOTATION)?;
        let raw_suffix_length = match annotations.get(TENANT_NAMESPACE_SUFFIX_LENGTH_ANNOTATION) {
            None => SUFFIX_LENGTH_UNSET,
            Some(v) => v.parse::<i8>().map_err(|_| {
                ControllerError::Configuration(format!(
                    "annotation {:?} on client namespace {:?} has invalid value {:?}: must be an integer in range [{}, {}]",
                    TENANT_NAMESPACE_SUFFIX_LENGTH_ANNOTATION,
                    client_namespace,
                    v,
                    i8::MIN,
                    i8::MAX
                ))
            })?,
        };
        if raw_suffix_length < 0 && raw_suffix_length != SUFFIX_LENGTH_UNSET {
            warn!(
                "negative value {} of annotation {:?} on client namespace {:?} is ignored, using default suffix length",
                raw_suffix_length, TENANT_NAMESPACE_SUFFIX_LENGTH_ANNOTATION, client_namespace
            );
        }
        Ok(ClientConfig::new(
            &tenant_namespace_prefix,
            &tenant_role,
            raw_suffix_length,
        ))
    }
}
