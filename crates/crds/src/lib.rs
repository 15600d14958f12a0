//! CRD definitions for the vertical-pod-autoscaler operator.
//!
//! Kubernetes Custom Resource Definitions consumed by the VPA controller.

pub mod vertical_pod_autoscaler;

pub use vertical_pod_autoscaler::*;
