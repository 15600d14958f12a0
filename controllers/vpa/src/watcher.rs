//! Kubernetes resource watcher.
//!
//! Drives reconciliation with `kube_runtime::Controller`, which handles
//! watch multiplexing, event queueing, automatic reconnection, and requeue
//! scheduling. The primary watch covers the VerticalPodAutoscalerController
//! CRD; a secondary `.owns` watch maps events on the owned recommender
//! Deployment back to its parent resource, so drift or deletion of the
//! Deployment re-triggers reconciliation.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::VerticalPodAutoscalerController;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Watches the VerticalPodAutoscalerController CRD and its owned Deployment.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    vpa_api: Api<VerticalPodAutoscalerController>,
    deployment_api: Api<Deployment>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        vpa_api: Api<VerticalPodAutoscalerController>,
        deployment_api: Api<Deployment>,
    ) -> Self {
        Self {
            reconciler,
            vpa_api,
            deployment_api,
        }
    }

    /// Watches VerticalPodAutoscalerController resources until shutdown.
    pub async fn watch_autoscaler_controllers(&self) -> Result<(), ControllerError> {
        info!("Starting VerticalPodAutoscalerController watcher");

        // Error policy: requeue with Fibonacci backoff keyed by resource name
        let error_policy = |obj: Arc<VerticalPodAutoscalerController>,
                            error: &ControllerError,
                            ctx: Arc<Reconciler>| {
            let name = obj.name_any();
            let (backoff_seconds, error_count) = ctx.get_backoff_for_resource(&name);
            error!(
                "Reconciliation error for VerticalPodAutoscalerController {} (error count {}): {}, requeue in {}s",
                name, error_count, error, backoff_seconds
            );
            Action::requeue(Duration::from_secs(backoff_seconds))
        };

        // Reconcile by identifier: the reconciler re-fetches the resource so
        // a request for an already-deleted instance resolves to a no-op.
        let reconcile = |obj: Arc<VerticalPodAutoscalerController>, ctx: Arc<Reconciler>| async move {
            let name = obj.name_any();
            debug!("Reconciling VerticalPodAutoscalerController {}", name);

            match ctx.reconcile(&name).await {
                Ok(()) => {
                    ctx.reset_error(&name);
                    Ok(Action::await_change())
                }
                Err(e) => {
                    ctx.increment_error(&name);
                    error!(
                        "Reconciliation failed for VerticalPodAutoscalerController {}: {}",
                        name, e
                    );
                    Err(e)
                }
            }
        };

        // Debounce batches bursts of events (e.g. status updates on the
        // owned Deployment); the singleton resource needs no concurrency.
        let controller_config = ControllerConfig::default()
            .debounce(Duration::from_secs(5))
            .concurrency(1);

        Controller::new(self.vpa_api.clone(), watcher::Config::default())
            .owns(self.deployment_api.clone(), watcher::Config::default())
            .with_config(controller_config)
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                if let Err(e) = res {
                    error!(
                        "Controller error for VerticalPodAutoscalerController: {}",
                        e
                    );
                }
            })
            .await;

        Ok(())
    }
}
