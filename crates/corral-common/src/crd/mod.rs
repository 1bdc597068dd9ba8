//! Custom Resource Definitions for corral

mod cluster;
mod component;
mod package;
mod types;
mod volume;

pub use cluster::{
    CorralCluster, CorralClusterSpec, CorralClusterStatus, Database, EtcdConfig, ImageHub,
    InstallMode, K8sNode,
};
pub use component::{
    component_conditions, CorralComponent, CorralComponentSpec, CorralComponentStatus,
};
pub use package::{CorralPackage, CorralPackageSpec, CorralPackageStatus};
pub use types::{Condition, ConditionStatus, HasConditions};
pub use volume::{
    volume_conditions, AccessMode, CorralVolume, CorralVolumeSpec, CorralVolumeStatus,
    StorageClassParameters,
};

use kube::CustomResourceExt;

/// All corral CRDs, in install order
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        CorralCluster::crd(),
        CorralComponent::crd(),
        CorralVolume::crd(),
        CorralPackage::crd(),
    ]
}
