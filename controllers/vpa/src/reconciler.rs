//! Reconciliation logic for the VerticalPodAutoscalerController CRD.
//!
//! Each invocation is idempotent and safe to retry: fetch the resource by
//! name, derive the expected recommender Deployment, and converge the cluster
//! via create-or-update. Retry scheduling lives in the watcher's error
//! policy; this module performs no retries of its own.

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::reconcile_helpers::{
    deployment_needs_update, expected_deployment, object_reference, recommender_name,
    recommender_pod_spec, singleton_name_matches, update_annotations,
};
use crds::VerticalPodAutoscalerController;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::PostParams;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Api, Resource};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Process-wide configuration for a reconciler instance.
///
/// Injected at construction and swappable via [`Reconciler::set_config`];
/// never persisted to the cluster.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// The release version assigned to the operator.
    pub release_version: String,
    /// The name of the singleton VerticalPodAutoscalerController resource.
    pub name: String,
    /// The namespace for vertical-pod-autoscaler deployments.
    pub namespace: String,
    /// The vertical-pod-autoscaler image to use in deployments.
    pub image: String,
    /// The log verbosity level for the vertical-pod-autoscaler.
    pub verbosity: u32,
    /// Additional arguments passed to the vertical-pod-autoscaler.
    pub extra_args: String,
}

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(1, 10), // 1 minute min, 10 minutes max
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Reconciles the singleton VerticalPodAutoscalerController resource.
pub struct Reconciler {
    vpa_api: Api<VerticalPodAutoscalerController>,
    deployment_api: Api<Deployment>,
    recorder: Recorder,
    config: OperatorConfig,
    /// Error count tracking per resource (name -> BackoffState)
    backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        vpa_api: Api<VerticalPodAutoscalerController>,
        deployment_api: Api<Deployment>,
        recorder: Recorder,
        config: OperatorConfig,
    ) -> Self {
        Self {
            vpa_api,
            deployment_api,
            recorder,
            config,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the injected configuration.
    ///
    /// Must be called before the reconciler is shared with the watcher;
    /// subsequent reconciles observe the new config.
    #[allow(dead_code)] // Only called from tests and config reloads
    pub fn set_config(&mut self, config: OperatorConfig) {
        self.config = config;
    }

    /// Reconciles the VerticalPodAutoscalerController with the given name.
    ///
    /// Name-filter mismatches and already-deleted resources are normal
    /// no-op outcomes; only apiserver failures surface as errors for the
    /// watcher to requeue.
    pub async fn reconcile(&self, name: &str) -> Result<(), ControllerError> {
        info!("Reconciling VerticalPodAutoscalerController {}", name);

        if !singleton_name_matches(name, &self.config.name) {
            warn!(
                "Not processing VerticalPodAutoscalerController {}, name must be {}",
                name, self.config.name
            );
            return Ok(());
        }

        let vpa = match self.vpa_api.get_opt(name).await {
            Ok(Some(vpa)) => vpa,
            Ok(None) => {
                // Deleted after the reconcile request was queued. Owned
                // objects are garbage collected via the owner reference.
                info!(
                    "VerticalPodAutoscalerController {} not found, will not reconcile",
                    name
                );
                return Ok(());
            }
            Err(e) => {
                error!("Error reading VerticalPodAutoscalerController: {}", e);
                return Err(e.into());
            }
        };

        // Reference for events, with the deployment namespace substituted
        // when the resource carries none. Keeps events for cluster-scoped
        // instances out of the default namespace.
        let vpa_ref = object_reference(&vpa, &self.config);
        if vpa_ref.is_none() {
            error!(
                "Error creating object reference for VerticalPodAutoscalerController {}",
                name
            );
        }

        let deployment_name = recommender_name(&vpa);
        let existing = match self.deployment_api.get_opt(&deployment_name).await {
            Ok(existing) => existing,
            Err(e) => {
                let msg = format!("Error getting vertical-pod-autoscaler deployment: {e}");
                error!("{}", msg);
                self.publish_event(
                    vpa_ref.as_ref(),
                    EventType::Warning,
                    "FailedGetDeployment",
                    "Get",
                    &msg,
                )
                .await;
                return Err(e.into());
            }
        };

        match existing {
            None => {
                if let Err(e) = self.create_autoscaler(&vpa).await {
                    let msg =
                        format!("Error creating VerticalPodAutoscalerController deployment: {e}");
                    error!("{}", msg);
                    self.publish_event(
                        vpa_ref.as_ref(),
                        EventType::Warning,
                        "FailedCreate",
                        "Create",
                        &msg,
                    )
                    .await;
                    return Err(e);
                }

                let msg = format!(
                    "Created VerticalPodAutoscalerController deployment: {}/{}",
                    self.config.namespace, deployment_name
                );
                info!("{}", msg);
                self.publish_event(
                    vpa_ref.as_ref(),
                    EventType::Normal,
                    "SuccessfulCreate",
                    "Create",
                    &msg,
                )
                .await;
            }
            Some(deployment) => {
                if let Err(e) = self.update_autoscaler(&vpa, deployment).await {
                    let msg = format!("Error updating vertical-pod-autoscaler deployment: {e}");
                    error!("{}", msg);
                    self.publish_event(
                        vpa_ref.as_ref(),
                        EventType::Warning,
                        "FailedUpdate",
                        "Update",
                        &msg,
                    )
                    .await;
                    return Err(e);
                }

                let msg = format!(
                    "Updated VerticalPodAutoscalerController deployment: {}/{}",
                    self.config.namespace, deployment_name
                );
                info!("{}", msg);
                self.publish_event(
                    vpa_ref.as_ref(),
                    EventType::Normal,
                    "SuccessfulUpdate",
                    "Update",
                    &msg,
                )
                .await;
            }
        }

        Ok(())
    }

    /// Creates the recommender Deployment for the given resource.
    async fn create_autoscaler(
        &self,
        vpa: &VerticalPodAutoscalerController,
    ) -> Result<(), ControllerError> {
        info!(
            "Creating VerticalPodAutoscalerController deployment: {}/{}",
            self.config.namespace,
            recommender_name(vpa)
        );

        // Set the resource as owner and controller of the Deployment.
        let owner_ref = vpa
            .controller_owner_ref(&())
            .ok_or(ControllerError::MissingObjectKey(".metadata.name"))?;

        let deployment = expected_deployment(vpa, &self.config, owner_ref);
        self.deployment_api
            .create(&PostParams::default(), &deployment)
            .await?;

        Ok(())
    }

    /// Updates the existing recommender Deployment to match the expected
    /// spec, if needed.
    ///
    /// Only the template pod spec and the resource's release-version
    /// annotation are compared; a match is a no-op with no apiserver write.
    async fn update_autoscaler(
        &self,
        vpa: &VerticalPodAutoscalerController,
        mut existing: Deployment,
    ) -> Result<(), ControllerError> {
        let expected_spec = recommender_pod_spec(vpa, &self.config);

        if !deployment_needs_update(&existing, &expected_spec, vpa, &self.config.release_version) {
            return Ok(());
        }

        {
            let spec = existing.spec.get_or_insert_with(Default::default);
            spec.template.spec = Some(expected_spec);
            update_annotations(
                spec.template.metadata.get_or_insert_with(Default::default),
                &self.config.release_version,
            );
        }
        update_annotations(&mut existing.metadata, &self.config.release_version);

        let name = existing
            .metadata
            .name
            .clone()
            .ok_or(ControllerError::MissingObjectKey(".metadata.name"))?;
        self.deployment_api
            .replace(&name, &PostParams::default(), &existing)
            .await?;

        Ok(())
    }

    /// Publishes an event against the given reference, if one could be built.
    ///
    /// Event emission is best-effort: a publish failure is logged and never
    /// fails the reconciliation.
    async fn publish_event(
        &self,
        reference: Option<&ObjectReference>,
        type_: EventType,
        reason: &str,
        action: &str,
        note: &str,
    ) {
        let Some(reference) = reference else {
            // Reference construction failed and was already logged; skip
            // event emission for this cycle.
            return;
        };

        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: action.to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!("Failed to publish {} event: {}", reason, e);
        }
    }

    /// Get the Fibonacci backoff duration for a resource based on its error count
    ///
    /// Returns (backoff_seconds, error_count)
    pub fn get_backoff_for_resource(&self, resource_key: &str) -> (u64, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states
                    .entry(resource_key.to_string())
                    .or_insert_with(BackoffState::new);
                let backoff_seconds = state.backoff.next_backoff_seconds();
                let error_count = state.error_count;
                (backoff_seconds, error_count)
            }
            Err(e) => {
                warn!(
                    "Failed to lock backoff_states: {}, using default backoff",
                    e
                );
                (60, 0) // 60 seconds default
            }
        }
    }

    /// Increment error count for a resource
    pub fn increment_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            let state = states
                .entry(resource_key.to_string())
                .or_insert_with(BackoffState::new);
            state.increment_error();
        }
    }

    /// Reset error count for a resource (on successful reconciliation)
    pub fn reset_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }
}
