//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the control plane.
///
/// `NotFound` and `Conflict` are pulled out of the generic API error so
/// reconcilers can branch on them: `NotFound` usually means the goal is
/// already satisfied, `Conflict` means a lost get-modify-write race that a
/// later pass will retry.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The named object does not exist
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Resource kind, e.g. "Pod"
        kind: &'static str,
        /// Object name
        name: String,
    },

    /// Write rejected because of a concurrent modification or an existing
    /// object with the same name
    #[error("conflict: {0}")]
    Conflict(String),

    /// Object is missing a required field, e.g. a name
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Any other Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Api(#[from] kube::Error),
}

impl ClientError {
    /// True when the operation failed because the object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the operation lost a write race (HTTP 409).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Classify a raw `kube::Error` for an operation on a named object.
pub(crate) fn classify(kind: &'static str, name: &str, err: kube::Error) -> ClientError {
    match &err {
        kube::Error::Api(response) if response.code == 404 => ClientError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 => {
            ClientError::Conflict(format!("{kind} {name:?}: {}", response.message))
        }
        _ => ClientError::Api(err),
    }
}
