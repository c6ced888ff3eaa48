use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Write conflict on {0}")]
    Conflict(String),

    #[error("Invalid spec field {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Reconcile pass exceeded {0:?}")]
    Timeout(Duration),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Translate a raw API error into the crate taxonomy. `what` names the
    /// object the call addressed, e.g. `"Deployment default/web"`.
    pub fn from_kube(err: kube::Error, what: impl Into<String>) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 404 => Self::NotFound(what.into()),
            kube::Error::Api(ref resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::AlreadyExists(what.into())
            }
            kube::Error::Api(ref resp) if resp.code == 409 => Self::Conflict(what.into()),
            e => Self::Kube(e),
        }
    }
}
