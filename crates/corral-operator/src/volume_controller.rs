//! CorralVolume controller implementation
//!
//! A volume descriptor is usable once it names a storage class. When the
//! descriptor carries a provisioner instead, the controller creates a
//! storage class named after the descriptor and writes that name back.
//! The `Ready` condition tracks which of the two states the descriptor is in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use corral_common::crd::{
    volume_conditions, Condition, ConditionStatus, CorralVolume, CorralVolumeStatus,
    HasConditions, StorageClassParameters,
};
use corral_common::events::reasons;
use corral_common::{Error, FIELD_MANAGER, LABEL_MANAGED_BY, LABEL_MANAGED_BY_CORRAL};

/// Requeue delay after a retryable failure
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Kubernetes operations the volume controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeKubeClient: Send + Sync {
    /// Replace the status of a CorralVolume
    async fn patch_volume_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CorralVolumeStatus,
    ) -> Result<(), Error>;

    /// Point a CorralVolume at a storage class
    async fn set_storage_class_name(
        &self,
        namespace: &str,
        name: &str,
        storage_class_name: &str,
    ) -> Result<(), Error>;

    /// Create a storage class; `false` when one with that name exists
    async fn create_storage_class(&self, class: &StorageClass) -> Result<bool, Error>;
}

/// [`VolumeKubeClient`] backed by a kube client
pub struct VolumeKubeClientImpl {
    client: Client,
}

impl VolumeKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VolumeKubeClient for VolumeKubeClientImpl {
    async fn patch_volume_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CorralVolumeStatus,
    ) -> Result<(), Error> {
        let api: Api<CorralVolume> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn set_storage_class_name(
        &self,
        namespace: &str,
        name: &str,
        storage_class_name: &str,
    ) -> Result<(), Error> {
        let api: Api<CorralVolume> = Api::namespaced(self.client.clone(), namespace);
        let spec_patch = serde_json::json!({ "spec": { "storageClassName": storage_class_name } });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&spec_patch),
        )
        .await?;
        Ok(())
    }

    async fn create_storage_class(&self, class: &StorageClass) -> Result<bool, Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), class).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared context for the CorralVolume controller
pub struct VolumeContext {
    /// Kubernetes operations
    pub kube: Arc<dyn VolumeKubeClient>,
}

impl VolumeContext {
    /// Create a context talking to the cluster behind `client`
    pub fn new(client: Client) -> Self {
        Self {
            kube: Arc::new(VolumeKubeClientImpl::new(client)),
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn VolumeKubeClient>) -> Self {
        Self { kube }
    }
}

/// Storage class built from a descriptor's parameters
///
/// Volumes of the class outlive their claims; platform data is never
/// reclaimed automatically.
fn storage_class_for(name: &str, params: &StorageClassParameters) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                [(LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_CORRAL.to_string())].into(),
            ),
            ..Default::default()
        },
        provisioner: params.provisioner.clone(),
        parameters: (!params.parameters.is_empty()).then(|| params.parameters.clone()),
        mount_options: (!params.mount_options.is_empty()).then(|| params.mount_options.clone()),
        reclaim_policy: Some("Retain".to_string()),
        ..Default::default()
    }
}

/// Reconcile a CorralVolume
///
/// Status is written only when the `Ready` condition changed.
#[instrument(skip(volume, ctx), fields(volume = %volume.name_any()))]
pub async fn reconcile(volume: Arc<CorralVolume>, ctx: Arc<VolumeContext>) -> Result<Action, Error> {
    let name = volume.name_any();
    let namespace = volume.namespace().ok_or_else(|| {
        Error::validation_for_field(&name, "metadata.namespace", "CorralVolume must be namespaced")
    })?;
    debug!("reconciling volume");

    let mut class_name = volume.spec.storage_class_name.clone();
    if class_name.is_empty() {
        if let Some(params) = volume
            .spec
            .storage_class_parameters
            .as_ref()
            .filter(|p| !p.provisioner.is_empty())
        {
            if ctx
                .kube
                .create_storage_class(&storage_class_for(&name, params))
                .await?
            {
                info!(provisioner = %params.provisioner, "created storage class");
            }
            ctx.kube
                .set_storage_class_name(&namespace, &name, &name)
                .await?;
            class_name = name.clone();
        }
    }

    let condition = if class_name.is_empty() {
        Condition::new(
            volume_conditions::READY,
            ConditionStatus::False,
            reasons::STORAGE_CLASS_PENDING,
            "waiting for a storage class name or provisioner",
        )
    } else {
        Condition::new(
            volume_conditions::READY,
            ConditionStatus::True,
            reasons::STORAGE_CLASS_READY,
            format!("storage class {}", class_name),
        )
    };

    let mut status = volume.status.clone().unwrap_or_default();
    if status.update_condition(condition) {
        ctx.kube
            .patch_volume_status(&namespace, &name, &status)
            .await?;
    }
    Ok(Action::await_change())
}

/// Error policy for CorralVolume reconciliation
pub fn error_policy(volume: Arc<CorralVolume>, error: &Error, _ctx: Arc<VolumeContext>) -> Action {
    if error.is_retryable() {
        warn!(?error, volume = %volume.name_any(), "volume reconciliation failed");
        Action::requeue(RETRY_INTERVAL)
    } else {
        error!(?error, volume = %volume.name_any(), "volume reconciliation failed permanently");
        Action::await_change()
    }
}
