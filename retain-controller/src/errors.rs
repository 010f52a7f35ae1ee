use retain_controller_apis::UnknownMode;
use std::time::Duration;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
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
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// Failed to map a GroupVersionKind to an API resource. This might be a
    /// temporary failure caused by a not yet installed CustomResourceDefinition
    /// or by API connectivity issues.
    #[error("{0}")]
    ApiDiscoveryError(String),
    /// The Retainer changed since it was read.
    #[error("conflict while updating {0}, retrying with the latest version")]
    Conflict(String),
    /// `spec.mode` holds a value the controller does not know.
    #[error("{0}")]
    UnknownMode(#[from] UnknownMode),
    /// A status write would have touched the spec.
    #[error("refusing to modify spec of {0}")]
    SpecModified(String),
    /// The Retainer cache was not primed in time.
    #[error("retainer cache not synced within {0:?}")]
    CacheSync(Duration),
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
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::UnknownMode(_) => false,
            ControllerError::SpecModified(_) => false,
            _ => true,
        }
    }

    pub(crate) fn is_conflict(&self) -> bool {
        match self {
            ControllerError::Conflict(_) => true,
            ControllerError::KubeApi(e) => e.is_conflict(),
            _ => false,
        }
    }
}
