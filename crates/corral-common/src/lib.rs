//! Common types for corral: CRDs, errors, configuration and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use config::OperatorConfig;
pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace for corral platform resources
pub const CORRAL_SYSTEM_NAMESPACE: &str = "corral-system";

/// Name of the single CorralCluster object per namespace
pub const CLUSTER_NAME: &str = "corralcluster";

/// Name of the single CorralPackage object per namespace
pub const PACKAGE_NAME: &str = "corralpackage";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "corral-controller";

/// Label key identifying the component a resource belongs to
pub const LABEL_NAME: &str = "name";

/// Label key marking resources managed by corral
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for resources managed by corral
pub const LABEL_MANAGED_BY_CORRAL: &str = "corral";

/// Label key on CorralVolume descriptors naming the access mode they provision
pub const LABEL_ACCESS_MODES: &str = "accessModes";

/// Label key on a CorralComponent requesting single-writer volume claims
pub const LABEL_PVC_ACCESS_MODES: &str = "persistentVolumeClaimAccessModes";

/// Label key recording the fingerprint of the address set a certificate was signed for
pub const LABEL_ADDRESS_FINGERPRINT: &str = "corral.dev/address-fingerprint";
