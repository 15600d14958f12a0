//! Vertical Pod Autoscaler Controller
//!
//! Watches the singleton `VerticalPodAutoscalerController` CRD and keeps the
//! vpa-recommender Deployment converged with its spec. The deployment is
//! owner-referenced to the CR, so deleting the CR garbage-collects it.

mod backoff;
mod controller;
mod error;
mod reconcile_helpers;
mod reconciler;
mod watcher;

use crate::controller::Controller;
use crate::error::ControllerError;
use crate::reconciler::OperatorConfig;
use std::env;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting vertical-pod-autoscaler controller");

    // Load configuration from environment variables
    let release_version = env::var("RELEASE_VERSION").unwrap_or_default();
    let name = env::var("VPA_CONTROLLER_NAME").unwrap_or_else(|_| "default".to_string());
    let namespace = env::var("VPA_NAMESPACE")
        .unwrap_or_else(|_| "openshift-vertical-pod-autoscaler".to_string());
    let image = env::var("VPA_IMAGE").map_err(|_| {
        ControllerError::InvalidConfig("VPA_IMAGE environment variable is required".to_string())
    })?;
    let verbosity = match env::var("VPA_VERBOSITY") {
        Ok(v) => v.parse::<u32>().map_err(|_| {
            ControllerError::InvalidConfig(format!("VPA_VERBOSITY must be an integer, got {v}"))
        })?,
        Err(_) => 1,
    };
    let extra_args = env::var("VPA_EXTRA_ARGS").unwrap_or_default();

    info!("Configuration:");
    info!("  Release version: {}", release_version);
    info!("  Singleton name: {}", name);
    info!("  Namespace: {}", namespace);
    info!("  Image: {}", image);

    let config = OperatorConfig {
        release_version,
        name,
        namespace,
        image,
        verbosity,
        extra_args,
    };

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
