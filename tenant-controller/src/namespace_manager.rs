use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::core::v1::Namespace;
use kube::{ResourceExt, api::ObjectMeta};
use rand::{Rng, rngs::OsRng};
use tenant_controller_apis::{NAMESPACE_ID_LABEL, NAMESPACE_PREFIX_LABEL};

use crate::{
    clients::NamespaceClient,
    errors::{ControllerError, ExtKubeApiError},
};

const SUFFIX_CHARACTERS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Creates, lists and deletes the namespaces belonging to one tenant namespace prefix.
pub(crate) struct NamespaceManager {
    client: Arc<dyn NamespaceClient>,
    prefix: String,
    suffix_length: usize,
}

impl NamespaceManager {
    pub fn new(client: Arc<dyn NamespaceClient>, prefix: &str, suffix_length: usize) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            suffix_length,
        }
    }

    fn labels(&self, custom_part: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(NAMESPACE_PREFIX_LABEL.to_string(), self.prefix.clone());
        labels.insert(NAMESPACE_ID_LABEL.to_string(), custom_part.to_string());
        labels
    }

    fn label_selector(&self, custom_part: &str) -> String {
        self.labels(custom_part)
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Create a new namespace named `<prefix>-<custom_part>-<random suffix>`.
    /// A name collision is returned as the API error it is.
    pub async fn create(
        &self,
        custom_part: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<String, ControllerError> {
        let name = generate_name(&self.prefix, custom_part, self.suffix_length);
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(self.labels(custom_part)),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = self.client.create(&namespace).await?;
        info!("created namespace {}", created.name_any());
        Ok(created.name_any())
    }

    /// Delete a namespace owned by this manager. Deleting an absent namespace
    /// succeeds; namespaces not carrying this manager's prefix are refused.
    pub async fn delete(&self, name: &str) -> Result<(), ControllerError> {
        if !name.starts_with(self.prefix.as_str()) {
            return Err(ControllerError::NamespaceOwnership(format!(
                "refused to delete namespace {:?}: name does not start with prefix {:?}",
                name, self.prefix
            )));
        }
        let namespace = match self.client.get(name).await {
            Ok(ns) => ns,
            Err(e) if e.is_not_found() => {
                debug!("namespace {} does no longer exist", name);
                return Ok(());
            }
            Err(e) => Err(e)?,
        };
        let label = namespace.labels().get(NAMESPACE_PREFIX_LABEL);
        if label != Some(&self.prefix) {
            return Err(ControllerError::NamespaceOwnership(format!(
                "refused to delete namespace {:?}: label {} is {:?} instead of {:?}",
                name, NAMESPACE_PREFIX_LABEL, label, self.prefix
            )));
        }
        match self.client.delete(name, namespace.uid()).await {
            Ok(()) => {
                info!("deleted namespace {}", name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e)?,
        }
    }

    /// Names of all namespaces labeled with this manager's prefix and `custom_part`.
    pub async fn list(&self, custom_part: &str) -> Result<Vec<String>, ControllerError> {
        match self.client.list(&self.label_selector(custom_part)).await {
            Ok(namespaces) => Ok(namespaces.iter().map(|ns| ns.name_any()).collect()),
            Err(e) if e.is_not_found() => Ok(vec![]),
            Err(e) => Err(e)?,
        }
    }
}

/// Join the non-empty parts of prefix, custom part and a random suffix with `-`.
pub(crate) fn generate_name(prefix: &str, custom_part: &str, suffix_length: usize) -> String {
    let suffix = random_suffix(suffix_length);
    [prefix, custom_part, suffix.as_str()]
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
}

fn random_suffix(length: usize) -> String {
    (0..length)
        .map(|_| SUFFIX_CHARACTERS[OsRng.gen_range(0..SUFFIX_CHARACTERS.len())] as char)
        .collect()
}
