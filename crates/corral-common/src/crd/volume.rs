//! CorralVolume CRD: a storage provisioning descriptor
//!
//! Each descriptor is labelled with the access mode it provisions and,
//! once its provisioner is running, names the storage class to use.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, HasConditions};

/// Condition types on a CorralVolume
pub mod volume_conditions {
    /// The descriptor names a usable storage class
    pub const READY: &str = "Ready";
}

/// Volume sharing semantics
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Many writers
    ReadWriteMany,
    /// A single writer
    ReadWriteOnce,
}

impl AccessMode {
    /// The Kubernetes spelling, also used as the descriptor label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadWriteMany => "ReadWriteMany",
            Self::ReadWriteOnce => "ReadWriteOnce",
        }
    }

    /// Label selector matching descriptors of this mode
    pub fn selector(&self) -> String {
        format!("{}={}", crate::LABEL_ACCESS_MODES, self.as_str())
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage descriptor spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "corral.dev",
    version = "v1alpha1",
    kind = "CorralVolume",
    plural = "corralvolumes",
    shortname = "cv",
    namespaced,
    status = "CorralVolumeStatus",
    printcolumn = r#"{"name":"StorageClass","type":"string","jsonPath":".spec.storageClassName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CorralVolumeSpec {
    /// Storage class provisioned for this descriptor; empty while pending
    #[serde(default)]
    pub storage_class_name: String,

    /// Storage class corral creates when no class name is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_parameters: Option<StorageClassParameters>,
}

/// How to build a storage class for a descriptor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassParameters {
    /// Provisioner serving the class, e.g. `nfs.csi.k8s.io`
    pub provisioner: String,

    /// Provisioner-specific parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    /// Mount options for volumes of this class
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_options: Vec<String>,
}

/// Storage descriptor status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorralVolumeStatus {
    /// Volume conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for CorralVolumeStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_selector() {
        assert_eq!(
            AccessMode::ReadWriteMany.selector(),
            "accessModes=ReadWriteMany"
        );
        assert_eq!(AccessMode::ReadWriteOnce.to_string(), "ReadWriteOnce");
    }
}
