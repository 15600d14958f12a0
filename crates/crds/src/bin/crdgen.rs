//! Prints the VerticalPodAutoscalerController CRD manifest as YAML.
//!
//! Usage: `cargo run --bin crdgen > deploy/crds/verticalpodautoscalercontroller.yaml`

use anyhow::Result;
use crds::VerticalPodAutoscalerController;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let crd = VerticalPodAutoscalerController::crd();
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
