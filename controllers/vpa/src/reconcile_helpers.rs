//! Pure helpers for deriving the expected recommender Deployment.
//!
//! Everything in this module is a pure function of the
//! `VerticalPodAutoscalerController` resource and the injected
//! `OperatorConfig`; no apiserver access happens here. The reconciler calls
//! these to build, compare, and annotate the managed Deployment.

use crate::reconciler::OperatorConfig;
use crds::VerticalPodAutoscalerController;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ObjectReference, PodSpec, PodTemplateSpec, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Controller name used for the event reporter.
pub const CONTROLLER_NAME: &str = "vertical-pod-autoscaler-controller";

/// Service account the recommender pod runs as.
pub const RECOMMENDER_SERVICE_ACCOUNT: &str = "vpa-recommender";

/// Priority class for the recommender pod.
pub const RECOMMENDER_PRIORITY_CLASS: &str = "system-cluster-critical";

/// Marker annotation identifying the recommender as a critical pod.
pub const CRITICAL_POD_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/critical-pod";

/// Annotation recording which operator release last reconciled the object.
pub const RELEASE_VERSION_ANNOTATION: &str = "release.openshift.io/version";

/// Returns true if the resource name matches the configured singleton name.
///
/// The CRD is effectively a singleton; any instance with a different name is
/// ignored by the reconciler regardless of which watch event produced it.
pub fn singleton_name_matches(name: &str, configured_name: &str) -> bool {
    name == configured_name
}

/// Deterministic name of the recommender Deployment owned by the given resource.
pub fn recommender_name(vpa: &VerticalPodAutoscalerController) -> String {
    format!("vpa-recommender-{}", vpa.name_any())
}

/// Fixed label set shared by the Deployment selector and pod template.
pub fn recommender_labels(vpa: &VerticalPodAutoscalerController) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("vertical-pod-autoscaler".to_string(), vpa.name_any()),
        ("app".to_string(), "vertical-pod-autoscaler".to_string()),
    ])
}

/// Annotations expected on the Deployment and its pod template.
pub fn managed_annotations(release_version: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CRITICAL_POD_ANNOTATION.to_string(), String::new()),
        (
            RELEASE_VERSION_ANNOTATION.to_string(),
            release_version.to_string(),
        ),
    ])
}

/// Refreshes the managed annotations on the given metadata in place.
///
/// Unrelated annotations are preserved; only the critical-pod marker and the
/// release-version marker are (re)set.
pub fn update_annotations(meta: &mut ObjectMeta, release_version: &str) {
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(CRITICAL_POD_ANNOTATION.to_string(), String::new());
    annotations.insert(
        RELEASE_VERSION_ANNOTATION.to_string(),
        release_version.to_string(),
    );
}

/// Recommender CLI arguments derived from the resource spec and config.
///
/// Each tuning field contributes one flag when present; absent fields emit
/// nothing, so the recommender falls back to its own defaults. Formatting
/// precision is fixed per flag to keep the argument list deterministic.
pub fn recommender_args(
    vpa: &VerticalPodAutoscalerController,
    config: &OperatorConfig,
) -> Vec<String> {
    let spec = &vpa.spec;
    let mut args = vec![format!("--v={}", config.verbosity)];

    if let Some(fraction) = spec.safety_margin_fraction {
        args.push(format!("--recommendation-margin-fraction={fraction:.1}"));
    }

    if let Some(millicores) = spec.pod_min_cpu_millicores {
        args.push(format!(
            "--pod-recommendation-min-cpu-millicores={millicores:.1}"
        ));
    }

    if let Some(megabytes) = spec.pod_min_memory_mb {
        args.push(format!("--pod-recommendation-min-memory-mb={megabytes:.0}"));
    }

    args
}

/// Expected pod spec for the recommender Deployment.
pub fn recommender_pod_spec(
    vpa: &VerticalPodAutoscalerController,
    config: &OperatorConfig,
) -> PodSpec {
    let mut args = recommender_args(vpa, config);

    if !config.extra_args.is_empty() {
        args.push(config.extra_args.clone());
    }

    PodSpec {
        service_account_name: Some(RECOMMENDER_SERVICE_ACCOUNT.to_string()),
        priority_class_name: Some(RECOMMENDER_PRIORITY_CLASS.to_string()),
        node_selector: Some(BTreeMap::from([
            ("node-role.kubernetes.io/master".to_string(), String::new()),
            ("beta.kubernetes.io/os".to_string(), "linux".to_string()),
        ])),
        containers: vec![Container {
            name: "vertical-pod-autoscaler".to_string(),
            image: Some(config.image.clone()),
            command: Some(vec!["recommender".to_string()]),
            args: Some(args),
            ..Default::default()
        }],
        tolerations: Some(vec![
            Toleration {
                key: Some("CriticalAddonsOnly".to_string()),
                operator: Some("Exists".to_string()),
                ..Default::default()
            },
            Toleration {
                key: Some("node-role.kubernetes.io/master".to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// Expected recommender Deployment for the given resource.
///
/// The owner reference ties the Deployment to the resource so it is garbage
/// collected when the resource is deleted.
pub fn expected_deployment(
    vpa: &VerticalPodAutoscalerController,
    config: &OperatorConfig,
    owner_ref: OwnerReference,
) -> Deployment {
    let labels = recommender_labels(vpa);
    let annotations = managed_annotations(&config.release_version);
    let pod_spec = recommender_pod_spec(vpa, config);

    Deployment {
        metadata: ObjectMeta {
            name: Some(recommender_name(vpa)),
            namespace: Some(config.namespace.clone()),
            annotations: Some(annotations.clone()),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Returns true if the object's release-version annotation matches.
pub fn release_version_matches(meta: &ObjectMeta, release_version: &str) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(RELEASE_VERSION_ANNOTATION))
        .is_some_and(|version| version == release_version)
}

/// Returns true if the existing Deployment must be updated.
///
/// Only the template pod spec and the release-version annotation on the
/// VerticalPodAutoscalerController resource itself are compared; drift in
/// other Deployment fields (labels, replicas, selector) is left untouched to
/// minimize update churn.
pub fn deployment_needs_update(
    existing: &Deployment,
    expected_spec: &PodSpec,
    vpa: &VerticalPodAutoscalerController,
    release_version: &str,
) -> bool {
    let current_spec = existing
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref());

    current_spec != Some(expected_spec) || !release_version_matches(&vpa.metadata, release_version)
}

/// Builds an object reference to the resource for event emission.
///
/// If the resource carries no namespace (cluster-scoped instance), the
/// configured deployment namespace is substituted so events do not land in
/// the default namespace. Returns `None` if no useful reference can be
/// built; the caller logs and skips event emission for that cycle.
pub fn object_reference(
    vpa: &VerticalPodAutoscalerController,
    config: &OperatorConfig,
) -> Option<ObjectReference> {
    let name = vpa.metadata.name.clone()?;
    let namespace = vpa
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| config.namespace.clone());

    Some(ObjectReference {
        api_version: Some(VerticalPodAutoscalerController::api_version(&()).into_owned()),
        kind: Some(VerticalPodAutoscalerController::kind(&()).into_owned()),
        name: Some(name),
        namespace: Some(namespace),
        uid: vpa.metadata.uid.clone(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::VerticalPodAutoscalerControllerSpec;

    const TEST_NAMESPACE: &str = "test-namespace";
    const TEST_RELEASE_VERSION: &str = "v100";

    fn test_config() -> OperatorConfig {
        OperatorConfig {
            release_version: TEST_RELEASE_VERSION.to_string(),
            name: "test".to_string(),
            namespace: TEST_NAMESPACE.to_string(),
            image: "test/test:v100".to_string(),
            verbosity: 10,
            extra_args: String::new(),
        }
    }

    fn test_vpa() -> VerticalPodAutoscalerController {
        let mut vpa = VerticalPodAutoscalerController::new(
            "test",
            VerticalPodAutoscalerControllerSpec {
                safety_margin_fraction: Some(0.5),
                pod_min_cpu_millicores: Some(0.1),
                pod_min_memory_mb: Some(25.0),
            },
        );
        vpa.metadata.namespace = Some(TEST_NAMESPACE.to_string());
        vpa
    }

    #[test]
    fn test_recommender_args() {
        let args = recommender_args(&test_vpa(), &test_config());

        let expected = [
            "--recommendation-margin-fraction=0.5",
            "--pod-recommendation-min-cpu-millicores=0.1",
            "--pod-recommendation-min-memory-mb=25",
        ];
        for e in expected {
            assert!(args.iter().any(|a| a == e), "missing arg {e} from {args:?}");
        }

        let expected_missing = [
            "--scale-down-delay-after-delete",
            "--scale-down-delay-after-failure",
        ];
        for e in expected_missing {
            assert!(
                !args.iter().any(|a| a.starts_with(e)),
                "found arg expected to be missing: {e}"
            );
        }
    }

    #[test]
    fn test_recommender_args_omits_absent_fields() {
        let vpa = VerticalPodAutoscalerController::new(
            "test",
            VerticalPodAutoscalerControllerSpec::default(),
        );

        let args = recommender_args(&vpa, &test_config());

        assert_eq!(args, vec!["--v=10".to_string()]);
    }

    #[test]
    fn test_recommender_pod_spec_appends_extra_args_verbatim() {
        let mut config = test_config();
        config.extra_args = "--kube-api-qps=25 --kube-api-burst=50".to_string();

        let spec = recommender_pod_spec(&test_vpa(), &config);

        let args = spec.containers[0].args.as_ref().unwrap();
        // The whole string is appended as one trailing argument
        assert_eq!(args.last().unwrap(), "--kube-api-qps=25 --kube-api-burst=50");
    }

    #[test]
    fn test_recommender_name() {
        assert_eq!(recommender_name(&test_vpa()), "vpa-recommender-test");
    }

    #[test]
    fn test_singleton_name_matches() {
        assert!(singleton_name_matches("test", "test"));
        assert!(!singleton_name_matches("other", "test"));
    }

    #[test]
    fn test_expected_deployment() {
        let vpa = test_vpa();
        let config = test_config();
        let owner_ref = OwnerReference {
            api_version: "autoscaling.openshift.io/v1".to_string(),
            kind: "VerticalPodAutoscalerController".to_string(),
            name: "test".to_string(),
            controller: Some(true),
            ..Default::default()
        };

        let deployment = expected_deployment(&vpa, &config, owner_ref.clone());

        assert_eq!(
            deployment.metadata.name.as_deref(),
            Some("vpa-recommender-test")
        );
        assert_eq!(deployment.metadata.namespace.as_deref(), Some(TEST_NAMESPACE));
        assert_eq!(
            deployment.metadata.owner_references,
            Some(vec![owner_ref])
        );

        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));

        // Selector must match the template labels
        let labels = recommender_labels(&vpa);
        assert_eq!(spec.selector.match_labels.as_ref(), Some(&labels));
        assert_eq!(
            spec.template.metadata.as_ref().unwrap().labels.as_ref(),
            Some(&labels)
        );

        // Annotations identical on Deployment and pod template
        let annotations = managed_annotations(TEST_RELEASE_VERSION);
        assert_eq!(deployment.metadata.annotations.as_ref(), Some(&annotations));
        assert_eq!(
            spec.template.metadata.as_ref().unwrap().annotations.as_ref(),
            Some(&annotations)
        );

        let pod_spec = spec.template.spec.as_ref().unwrap();
        assert_eq!(
            pod_spec.service_account_name.as_deref(),
            Some(RECOMMENDER_SERVICE_ACCOUNT)
        );
        assert_eq!(
            pod_spec.priority_class_name.as_deref(),
            Some(RECOMMENDER_PRIORITY_CLASS)
        );
        assert_eq!(pod_spec.containers.len(), 1);
        assert_eq!(pod_spec.containers[0].name, "vertical-pod-autoscaler");
        assert_eq!(pod_spec.containers[0].image.as_deref(), Some("test/test:v100"));
        assert_eq!(
            pod_spec.containers[0].command,
            Some(vec!["recommender".to_string()])
        );

        let node_selector = pod_spec.node_selector.as_ref().unwrap();
        assert_eq!(
            node_selector.get("node-role.kubernetes.io/master"),
            Some(&String::new())
        );
        assert_eq!(
            node_selector.get("beta.kubernetes.io/os"),
            Some(&"linux".to_string())
        );

        let tolerations = pod_spec.tolerations.as_ref().unwrap();
        assert_eq!(tolerations.len(), 2);
        assert_eq!(tolerations[0].key.as_deref(), Some("CriticalAddonsOnly"));
        assert_eq!(tolerations[0].operator.as_deref(), Some("Exists"));
        assert_eq!(
            tolerations[1].key.as_deref(),
            Some("node-role.kubernetes.io/master")
        );
        assert_eq!(tolerations[1].effect.as_deref(), Some("NoSchedule"));
    }

    #[test]
    fn test_update_annotations() {
        let expected = managed_annotations(TEST_RELEASE_VERSION);

        let cases: Vec<(&str, Option<BTreeMap<String, String>>)> = vec![
            ("no prior annotations", None),
            (
                "missing version annotation",
                Some(BTreeMap::from([(
                    CRITICAL_POD_ANNOTATION.to_string(),
                    String::new(),
                )])),
            ),
            (
                "missing critical-pod annotation",
                Some(BTreeMap::from([(
                    RELEASE_VERSION_ANNOTATION.to_string(),
                    TEST_RELEASE_VERSION.to_string(),
                )])),
            ),
            (
                "old version annotation",
                Some(BTreeMap::from([(
                    RELEASE_VERSION_ANNOTATION.to_string(),
                    "vOLD".to_string(),
                )])),
            ),
        ];

        for (label, annotations) in cases {
            let mut meta = ObjectMeta {
                annotations,
                ..Default::default()
            };
            update_annotations(&mut meta, TEST_RELEASE_VERSION);
            assert_eq!(meta.annotations.as_ref(), Some(&expected), "case: {label}");
        }
    }

    #[test]
    fn test_update_annotations_preserves_unrelated_keys() {
        let mut meta = ObjectMeta {
            annotations: Some(BTreeMap::from([(
                "unrelated".to_string(),
                "kept".to_string(),
            )])),
            ..Default::default()
        };

        update_annotations(&mut meta, TEST_RELEASE_VERSION);

        let annotations = meta.annotations.unwrap();
        assert_eq!(annotations.get("unrelated"), Some(&"kept".to_string()));
        assert_eq!(
            annotations.get(RELEASE_VERSION_ANNOTATION),
            Some(&TEST_RELEASE_VERSION.to_string())
        );
    }

    fn annotated_vpa(release_version: &str) -> VerticalPodAutoscalerController {
        let mut vpa = test_vpa();
        vpa.metadata.annotations = Some(BTreeMap::from([(
            RELEASE_VERSION_ANNOTATION.to_string(),
            release_version.to_string(),
        )]));
        vpa
    }

    fn matching_deployment(
        vpa: &VerticalPodAutoscalerController,
        pod_spec: &PodSpec,
    ) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(recommender_name(vpa)),
                namespace: Some(TEST_NAMESPACE.to_string()),
                annotations: Some(managed_annotations(TEST_RELEASE_VERSION)),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(pod_spec.clone()),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_deployment_needs_update() {
        let config = test_config();

        // Matching pod spec and resource release version: no update
        let vpa = annotated_vpa(TEST_RELEASE_VERSION);
        let expected_spec = recommender_pod_spec(&vpa, &config);
        let deployment = matching_deployment(&vpa, &expected_spec);
        assert!(!deployment_needs_update(
            &deployment,
            &expected_spec,
            &vpa,
            TEST_RELEASE_VERSION
        ));

        // Stale release version on the resource alone forces an update
        let stale_vpa = annotated_vpa("vOLD");
        assert!(deployment_needs_update(
            &deployment,
            &expected_spec,
            &stale_vpa,
            TEST_RELEASE_VERSION
        ));

        // Pod spec drift alone forces an update
        let mut drifted = test_config();
        drifted.image = "test/test:v999".to_string();
        let drifted_spec = recommender_pod_spec(&vpa, &drifted);
        assert!(deployment_needs_update(
            &deployment,
            &drifted_spec,
            &vpa,
            TEST_RELEASE_VERSION
        ));
    }

    #[test]
    fn test_needs_update_reads_release_version_from_resource() {
        let config = test_config();

        // The Deployment's own annotation is not consulted: a stale marker
        // on the resource triggers an update even though the Deployment
        // carries the current version and an identical pod spec.
        let stale_vpa = annotated_vpa("vOLD");
        let expected_spec = recommender_pod_spec(&stale_vpa, &config);
        let deployment = matching_deployment(&stale_vpa, &expected_spec);
        assert_eq!(
            deployment
                .metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(RELEASE_VERSION_ANNOTATION),
            Some(&TEST_RELEASE_VERSION.to_string())
        );
        assert!(deployment_needs_update(
            &deployment,
            &expected_spec,
            &stale_vpa,
            TEST_RELEASE_VERSION
        ));

        // Conversely a current marker on the resource is a no-op even when
        // the Deployment's annotation is stale.
        let current_vpa = annotated_vpa(TEST_RELEASE_VERSION);
        let mut stale_deployment = matching_deployment(&current_vpa, &expected_spec);
        stale_deployment
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(RELEASE_VERSION_ANNOTATION.to_string(), "vOLD".to_string());
        assert!(!deployment_needs_update(
            &stale_deployment,
            &expected_spec,
            &current_vpa,
            TEST_RELEASE_VERSION
        ));
    }

    #[test]
    fn test_release_version_matches_requires_annotation() {
        // An unannotated resource never matches, so it is always updated.
        assert!(!release_version_matches(
            &test_vpa().metadata,
            TEST_RELEASE_VERSION
        ));
        assert!(release_version_matches(
            &annotated_vpa(TEST_RELEASE_VERSION).metadata,
            TEST_RELEASE_VERSION
        ));
    }

    #[test]
    fn test_object_reference_substitutes_namespace() {
        let config = test_config();

        // Cluster-scoped instance without a namespace gets the configured one
        let cluster_scoped = VerticalPodAutoscalerController::new(
            "cluster-scoped",
            VerticalPodAutoscalerControllerSpec::default(),
        );
        let reference = object_reference(&cluster_scoped, &config).unwrap();
        assert_eq!(
            reference.api_version.as_deref(),
            Some("autoscaling.openshift.io/v1")
        );
        assert_eq!(
            reference.kind.as_deref(),
            Some("VerticalPodAutoscalerController")
        );
        assert_eq!(reference.name.as_deref(), Some("cluster-scoped"));
        assert_eq!(reference.namespace.as_deref(), Some(TEST_NAMESPACE));

        // An existing namespace is left unchanged
        let mut namespaced = cluster_scoped;
        namespaced.metadata.namespace = Some("should-not-change".to_string());
        let reference = object_reference(&namespaced, &config).unwrap();
        assert_eq!(reference.namespace.as_deref(), Some("should-not-change"));
    }

    #[test]
    fn test_object_reference_requires_name() {
        let mut vpa = test_vpa();
        vpa.metadata.name = None;
        assert!(object_reference(&vpa, &test_config()).is_none());
    }
}
