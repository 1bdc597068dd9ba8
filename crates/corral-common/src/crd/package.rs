//! CorralPackage CRD: the offline image package

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, HasConditions};

/// Offline package spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "corral.dev",
    version = "v1alpha1",
    kind = "CorralPackage",
    plural = "corralpackages",
    shortname = "cpkg",
    namespaced,
    status = "CorralPackageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CorralPackageSpec {
    /// Path of the package archive on the operator host
    #[serde(default)]
    pub pkg_path: String,
}

/// Offline package status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorralPackageStatus {
    /// Package conditions; `Ready=True` once every image is loaded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Images already pushed to the registry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images_pushed: Vec<String>,
}

impl HasConditions for CorralPackageStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}
