//! Controller-specific error types.
//!
//! Error types for the vertical-pod-autoscaler controller that are not
//! covered by upstream library errors. Not-found is never modeled here; it
//! is a normal reconciliation branch, not an error.

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the vertical-pod-autoscaler controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Required metadata field absent on an object
    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
