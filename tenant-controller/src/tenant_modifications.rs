use crate::{
    clients::TenantClient,
    errors::{ControllerError, ExtKubeApiError},
};
use json_patch::diff;
use kube::ResourceExt;
use std::ops::DerefMut;
use tenant_controller_apis::Tenant;

/// Helper construct to track in-memory modifications of a [`Tenant`] against
/// the version it was fetched as, and to persist them.
pub(crate) struct TenantModifications {
    original: Tenant,
    pub modified: Tenant,
}

impl std::ops::Deref for TenantModifications {
    type Target = Tenant;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for TenantModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl TenantModifications {
    pub(crate) fn new(original: Tenant) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    pub(crate) fn status_has_changed(&self) -> Result<bool, ControllerError> {
        let patch = diff(
            &serde_json::to_value(&self.original.status)?,
            &serde_json::to_value(&self.modified.status)?,
        );
        Ok(!patch.0.is_empty())
    }

    /// Add `finalizer` unless present, returns whether it was added.
    pub(crate) fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            false
        } else {
            self.finalizers_mut().push(finalizer.to_string());
            true
        }
    }

    /// Remove `finalizer`, returns whether it was present.
    pub(crate) fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let finalizers = self.finalizers_mut();
        let len = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        finalizers.len() != len
    }

    /// Persist metadata and spec. The status modifications made so far are
    /// carried over onto the updated object.
    pub(crate) async fn replace_spec(&mut self, client: &dyn TenantClient) -> Result<(), ControllerError> {
        let status = self.modified.status.clone();
        let updated = client.update(&self.modified).await?;
        debug!(
            "updated Tenant {} to resource version {:?}",
            updated.id(),
            updated.resource_version()
        );
        self.original = updated.clone();
        self.modified = updated;
        self.modified.status = status;
        Ok(())
    }

    /// Like [`Self::replace_spec`], but a Tenant which is already gone counts as success.
    pub(crate) async fn replace_spec_if_exists(
        &mut self,
        client: &dyn TenantClient,
    ) -> Result<(), ControllerError> {
        match self.replace_spec(client).await {
            Err(ControllerError::KubeApi(e)) if e.is_not_found() => {
                debug!("Tenant {} does no longer exist", self.original.id());
                Ok(())
            }
            r => r,
        }
    }

    /// Persist the status sub-resource if it differs from the fetched one.
    /// The update carries the fetched resource version and fails on conflicts.
    pub(crate) async fn replace_status(&mut self, client: &dyn TenantClient) -> Result<(), ControllerError> {
        if self.status_has_changed()? {
            let updated = client.update_status(&self.modified).await?;
            self.original = updated.clone();
            self.modified = updated;
        }
        Ok(())
    }
}
