//! VerticalPodAutoscalerController CRD
//!
//! Cluster-wide tuning knobs for the vertical-pod-autoscaler recommender.
//! The resource is an effective singleton: the controller only acts on the
//! instance whose name matches its configured singleton name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "autoscaling.openshift.io",
    version = "v1",
    kind = "VerticalPodAutoscalerController",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscalerControllerSpec {
    /// Fraction of usage added as the safety margin to the recommended request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_margin_fraction: Option<f64>,

    /// Minimum CPU recommendation for a pod, in millicores
    #[serde(
        default,
        rename = "podMinCPUMillicores",
        skip_serializing_if = "Option::is_none"
    )]
    pub pod_min_cpu_millicores: Option<f64>,

    /// Minimum memory recommendation for a pod, in megabytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_min_memory_mb: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_field_names_match_original_api() {
        let spec = VerticalPodAutoscalerControllerSpec {
            safety_margin_fraction: Some(0.5),
            pod_min_cpu_millicores: Some(0.1),
            pod_min_memory_mb: Some(25.0),
        };

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["safetyMarginFraction"], 0.5);
        assert_eq!(value["podMinCPUMillicores"], 0.1);
        assert_eq!(value["podMinMemoryMb"], 25.0);
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let spec = VerticalPodAutoscalerControllerSpec::default();
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }
}
