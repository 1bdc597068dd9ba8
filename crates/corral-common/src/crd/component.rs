//! CorralComponent CRD: desired state of one platform microservice

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, Volume, VolumeMount};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, HasConditions};

/// Condition types recorded on a component
pub mod component_conditions {
    /// The owning cluster has a complete configuration
    pub const CLUSTER_CONFIG_COMPLETED: &str = "ClusterConfigCompleted";
    /// The offline package is unpacked
    pub const PACKAGE_READY: &str = "PackageReady";
    /// All pods of the component are ready
    pub const READY: &str = "Ready";
}

/// Desired state of a platform component
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "corral.dev",
    version = "v1alpha1",
    kind = "CorralComponent",
    plural = "corralcomponents",
    shortname = "ccp",
    namespaced,
    status = "CorralComponentStatus",
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CorralComponentSpec {
    /// Desired pod count; `None` lets the component decide
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Container image
    #[serde(default)]
    pub image: String,

    /// Image pull policy (Always, Never, IfNotPresent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Arguments overriding the generated ones by flag name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Scheduled before other components and never uses private registry credentials
    #[serde(default)]
    pub priority_component: bool,

    /// Environment variables overriding the generated ones by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Compute resources; `requests` and `limits` each replace the defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Volume mounts overriding the generated ones by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Volumes overriding the generated ones by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

/// Observed state of a platform component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorralComponentStatus {
    /// Pods the component should be running
    #[serde(default)]
    pub replicas: i32,

    /// Pods that are ready
    #[serde(default)]
    pub ready_replicas: i32,

    /// Names of the component's pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<String>,

    /// Component conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for CorralComponentStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

impl CorralComponent {
    /// Image pull policy, defaulting to IfNotPresent
    pub fn image_pull_policy(&self) -> String {
        self.spec
            .image_pull_policy
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "IfNotPresent".to_string())
    }

    /// Labels stamped on every object generated for this component
    ///
    /// Workload selectors use the same set, so pod listing matches what
    /// the component created.
    pub fn workload_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels().clone();
        labels.insert(crate::LABEL_NAME.to_string(), self.name_any());
        labels.insert(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_CORRAL.to_string(),
        );
        labels
    }

    /// Whether the user asked for single-writer volume claims
    pub fn wants_rwo_claims(&self) -> bool {
        self.labels()
            .get(crate::LABEL_PVC_ACCESS_MODES)
            .is_some_and(|v| v == "ReadWriteOnce")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component() -> CorralComponent {
        let mut c = CorralComponent::new("corral-api", CorralComponentSpec::default());
        c.metadata.namespace = Some("corral-system".to_string());
        c
    }

    #[test]
    fn test_pull_policy_defaults_to_if_not_present() {
        let mut c = component();
        assert_eq!(c.image_pull_policy(), "IfNotPresent");
        c.spec.image_pull_policy = Some(String::new());
        assert_eq!(c.image_pull_policy(), "IfNotPresent");
        c.spec.image_pull_policy = Some("Always".to_string());
        assert_eq!(c.image_pull_policy(), "Always");
    }

    #[test]
    fn test_workload_labels_include_name_and_user_labels() {
        let mut c = component();
        c.metadata.labels = Some(BTreeMap::from([(
            "team".to_string(),
            "platform".to_string(),
        )]));
        let labels = c.workload_labels();
        assert_eq!(labels.get("name").map(String::as_str), Some("corral-api"));
        assert_eq!(labels.get("team").map(String::as_str), Some("platform"));
        assert_eq!(
            labels.get(crate::LABEL_MANAGED_BY).map(String::as_str),
            Some("corral")
        );
    }

    #[test]
    fn test_wants_rwo_claims() {
        let mut c = component();
        assert!(!c.wants_rwo_claims());
        c.metadata.labels = Some(BTreeMap::from([(
            crate::LABEL_PVC_ACCESS_MODES.to_string(),
            "ReadWriteOnce".to_string(),
        )]));
        assert!(c.wants_rwo_claims());
    }

    #[test]
    fn test_replicas_none_is_distinct_from_zero() {
        let spec: CorralComponentSpec =
            serde_json::from_value(serde_json::json!({"image": "x"})).expect("parse");
        assert_eq!(spec.replicas, None);
        let spec: CorralComponentSpec =
            serde_json::from_value(serde_json::json!({"image": "x", "replicas": 0}))
                .expect("parse");
        assert_eq!(spec.replicas, Some(0));
    }
}
