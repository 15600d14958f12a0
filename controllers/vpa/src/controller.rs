//! Main controller implementation.
//!
//! The `Controller` struct wires the kube client, the reconciler, and the
//! watcher together, and runs the watcher until it exits.

use crate::error::ControllerError;
use crate::reconcile_helpers::CONTROLLER_NAME;
use crate::reconciler::{OperatorConfig, Reconciler};
use crate::watcher::Watcher;
use crds::VerticalPodAutoscalerController;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::events::{Recorder, Reporter};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for the vertical-pod-autoscaler operator.
pub struct Controller {
    vpa_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: OperatorConfig) -> Result<Self, ControllerError> {
        info!("Initializing vertical-pod-autoscaler controller");

        // Create Kubernetes client
        let kube_client = Client::try_default().await.map_err(ControllerError::Kube)?;

        // The CRD and the managed deployment live in the configured namespace
        let vpa_api: Api<VerticalPodAutoscalerController> =
            Api::namespaced(kube_client.clone(), &config.namespace);
        let deployment_api: Api<Deployment> =
            Api::namespaced(kube_client.clone(), &config.namespace);

        // Event recorder attributed to this controller
        let recorder = Recorder::new(
            kube_client,
            Reporter {
                controller: CONTROLLER_NAME.to_string(),
                instance: None,
            },
        );

        let reconciler = Arc::new(Reconciler::new(
            vpa_api.clone(),
            deployment_api.clone(),
            recorder,
            config,
        ));

        let watcher_instance = Arc::new(Watcher::new(reconciler, vpa_api, deployment_api));

        // Start the watcher in a background task
        let vpa_watcher = {
            let watcher = watcher_instance;
            tokio::spawn(async move { watcher.watch_autoscaler_controllers().await })
        };

        Ok(Self { vpa_watcher })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("vertical-pod-autoscaler controller running");

        // Wait for the watcher to exit (it should run forever)
        tokio::select! {
            result = &mut self.vpa_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("VerticalPodAutoscalerController watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("VerticalPodAutoscalerController watcher error: {}", e)))?;
            }
        }

        Ok(())
    }
}
