/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_already_exists(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }

    fn is_already_exists(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// Missing or invalid provisioning annotations on the client namespace.
    #[error("{0}")]
    Configuration(String),
    /// Work queue key is not of the form `namespace/name`.
    #[error("unexpected key format: {0:?}")]
    InvalidKey(String),
    /// The client namespace is not (yet) in the namespace cache.
    #[error("client namespace {0:?} not found")]
    ClientNamespaceNotFound(String),
    /// Refused to delete a namespace which is not owned by the namespace manager.
    #[error("{0}")]
    NamespaceOwnership(String),
    /// A resource the tenant depends on is in an unexpected state.
    #[error("{0}")]
    DependentResourceState(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn is_configuration(&self) -> bool {
        matches!(self, ControllerError::Configuration(_))
    }

    pub(crate) fn is_conflict(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_conflict(),
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}
