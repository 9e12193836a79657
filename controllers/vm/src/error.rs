//! Controller-specific error types.
//!
//! Most failures bubble up from the control plane as `ClientError`; the
//! variants here cover the controller's own machinery.

use cluster_client::ClientError;
use thiserror::Error;

/// Errors that can occur in the VM controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Control-plane read or write failed
    #[error("cluster error: {0}")]
    Cluster(#[from] ClientError),

    /// Leader-election lease could not be established or renewed
    #[error("lease error: {0}")]
    Lease(String),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
