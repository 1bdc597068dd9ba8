//! Storage-class resolution from CorralVolume descriptors
//!
//! The storage installer publishes one `CorralVolume` per access mode,
//! labelled `accessModes=<mode>`. Components that claim volumes read the
//! storage class from the first matching descriptor on every pass.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use corral_common::crd::AccessMode;
use corral_common::Error;

use crate::handler::{ComponentContext, ComponentHandler};
use crate::Result;

/// Storage request applied to shared-writer claims that ask for 0 GiB
const RWX_STORAGE_REQUEST_GIB: i32 = 1;

/// Resolved claim parameters for one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PvcParameters {
    /// Storage class the claim binds to
    pub storage_class_name: String,
    /// Size in GiB used when the caller requests 0
    pub storage_request: Option<i32>,
}

/// Resolve the storage class published for `mode` in `namespace`
///
/// Returns [`Error::NotFound`] when no descriptor exists and
/// [`Error::NotReady`] when the first one has no class yet.
pub async fn resolve(
    ctx: &ComponentContext,
    namespace: &str,
    mode: AccessMode,
) -> Result<PvcParameters> {
    let volumes = ctx.list_volumes(namespace, &mode.selector()).await?;
    let Some(volume) = volumes.first() else {
        return Err(Error::not_found(
            "CorralVolume",
            format!("no {} volume in namespace {}", mode, namespace),
        ));
    };
    if volume.spec.storage_class_name.is_empty() {
        return Err(Error::not_ready(format!(
            "storage class for {} is not ready",
            mode
        )));
    }

    let storage_request = match mode {
        AccessMode::ReadWriteMany => Some(RWX_STORAGE_REQUEST_GIB),
        AccessMode::ReadWriteOnce => None,
    };
    Ok(PvcParameters {
        storage_class_name: volume.spec.storage_class_name.clone(),
        storage_request,
    })
}

/// Resolve a single-writer class, falling back to the shared-writer one
///
/// Only a missing RWO descriptor triggers the fallback; a descriptor that
/// is still provisioning is reported as is.
pub async fn resolve_rwo_with_rwx_fallback(
    ctx: &ComponentContext,
    namespace: &str,
) -> Result<PvcParameters> {
    match resolve(ctx, namespace, AccessMode::ReadWriteOnce).await {
        Err(e) if e.is_not_found() => {
            debug!(namespace, "no ReadWriteOnce volume, falling back to ReadWriteMany");
            resolve(ctx, namespace, AccessMode::ReadWriteMany).await
        }
        other => other,
    }
}

/// Hand resolved storage classes to whichever storage capabilities the handler has
pub async fn set_storage_class_name(
    handler: &mut dyn ComponentHandler,
    ctx: &ComponentContext,
) -> Result<()> {
    let namespace = ctx.namespace().to_string();

    if handler.as_storage_rwx_mut().is_some() {
        let params = resolve(ctx, &namespace, AccessMode::ReadWriteMany).await?;
        if let Some(receiver) = handler.as_storage_rwx_mut() {
            receiver.set_storage_class_name_rwx(params);
        }
    }

    if handler.as_storage_rwo_mut().is_some() {
        let params = resolve_rwo_with_rwx_fallback(ctx, &namespace).await?;
        if let Some(receiver) = handler.as_storage_rwo_mut() {
            receiver.set_storage_class_name_rwo(params);
        }
    }

    Ok(())
}

/// Build a claim for `size_gib`, falling back to the resolved request when 0
pub fn persistent_volume_claim(
    namespace: &str,
    claim_name: &str,
    mode: AccessMode,
    params: &PvcParameters,
    labels: &BTreeMap<String, String>,
    size_gib: i64,
) -> PersistentVolumeClaim {
    let size_gib = match params.storage_request {
        Some(request) if size_gib == 0 => i64::from(request),
        _ => size_gib,
    };
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![mode.as_str().to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(format!("{}Gi", size_gib)),
                )])),
                ..Default::default()
            }),
            storage_class_name: Some(params.storage_class_name.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ManagedResource, MockClusterApi};
    use crate::handler::{testing, StorageClassRwo, StorageClassRwx};
    use async_trait::async_trait;
    use corral_common::crd::{CorralVolume, CorralVolumeSpec};
    use k8s_openapi::api::core::v1::Pod;
    use mockall::predicate::*;

    fn volume(class: &str) -> CorralVolume {
        CorralVolume::new(
            "corral-volume",
            CorralVolumeSpec {
                storage_class_name: class.to_string(),
                ..Default::default()
            },
        )
    }

    fn api_with(rwo: Vec<CorralVolume>, rwx: Vec<CorralVolume>) -> MockClusterApi {
        let mut api = MockClusterApi::new();
        api.expect_list_volumes()
            .with(always(), eq("accessModes=ReadWriteOnce"))
            .returning(move |_, _| Ok(rwo.clone()));
        api.expect_list_volumes()
            .with(always(), eq("accessModes=ReadWriteMany"))
            .returning(move |_, _| Ok(rwx.clone()));
        api
    }

    #[tokio::test]
    async fn test_rwx_sets_default_request() {
        let ctx = testing::context(api_with(vec![], vec![volume("nfs")]));
        let params = resolve(&ctx, "corral-system", AccessMode::ReadWriteMany)
            .await
            .expect("resolution should succeed");
        assert_eq!(
            params,
            PvcParameters {
                storage_class_name: "nfs".to_string(),
                storage_request: Some(1),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_descriptor_is_not_found() {
        let ctx = testing::context(api_with(vec![], vec![]));
        let err = resolve(&ctx, "corral-system", AccessMode::ReadWriteOnce)
            .await
            .expect_err("resolution should fail");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_empty_class_is_not_ready() {
        let ctx = testing::context(api_with(vec![volume("")], vec![]));
        let err = resolve(&ctx, "corral-system", AccessMode::ReadWriteOnce)
            .await
            .expect_err("resolution should fail");
        assert!(matches!(err, Error::NotReady { .. }));
    }

    /// Story: a cluster with only shared storage still serves single-writer claims
    #[tokio::test]
    async fn story_rwo_falls_back_to_rwx_when_absent() {
        let ctx = testing::context(api_with(vec![], vec![volume("nfs")]));
        let params = resolve_rwo_with_rwx_fallback(&ctx, "corral-system")
            .await
            .expect("fallback should succeed");
        assert_eq!(params.storage_class_name, "nfs");
        assert_eq!(params.storage_request, Some(1));
    }

    #[tokio::test]
    async fn test_rwo_not_ready_does_not_fall_back() {
        let ctx = testing::context(api_with(vec![volume("")], vec![volume("nfs")]));
        let err = resolve_rwo_with_rwx_fallback(&ctx, "corral-system")
            .await
            .expect_err("not-ready descriptor should surface");
        assert!(matches!(err, Error::NotReady { .. }));
    }

    #[derive(Default)]
    struct Claims {
        rwx: Option<PvcParameters>,
        rwo: Option<PvcParameters>,
    }

    impl StorageClassRwx for Claims {
        fn set_storage_class_name_rwx(&mut self, params: PvcParameters) {
            self.rwx = Some(params);
        }
    }

    impl StorageClassRwo for Claims {
        fn set_storage_class_name_rwo(&mut self, params: PvcParameters) {
            self.rwo = Some(params);
        }
    }

    #[async_trait]
    impl ComponentHandler for Claims {
        async fn before(&mut self, _ctx: &ComponentContext) -> Result<()> {
            Ok(())
        }
        fn resources(&self) -> Result<Vec<ManagedResource>> {
            Ok(vec![])
        }
        async fn after(&self, _ctx: &ComponentContext) -> Result<()> {
            Ok(())
        }
        async fn list_pods(&self, _ctx: &ComponentContext) -> Result<Vec<Pod>> {
            Ok(vec![])
        }
        fn as_storage_rwx_mut(&mut self) -> Option<&mut dyn StorageClassRwx> {
            Some(self)
        }
        fn as_storage_rwo_mut(&mut self) -> Option<&mut dyn StorageClassRwo> {
            Some(self)
        }
    }

    #[tokio::test]
    async fn test_dispatch_feeds_both_capabilities() {
        let ctx = testing::context(api_with(vec![volume("local")], vec![volume("nfs")]));
        let mut claims = Claims::default();
        set_storage_class_name(&mut claims, &ctx)
            .await
            .expect("dispatch should succeed");

        assert_eq!(
            claims.rwx.map(|p| p.storage_class_name).as_deref(),
            Some("nfs")
        );
        assert_eq!(
            claims.rwo,
            Some(PvcParameters {
                storage_class_name: "local".to_string(),
                storage_request: None,
            })
        );
    }

    #[test]
    fn test_claim_size_falls_back_when_zero() {
        let params = PvcParameters {
            storage_class_name: "nfs".to_string(),
            storage_request: Some(1),
        };
        let labels = BTreeMap::from([("name".to_string(), "corral-api".to_string())]);

        let pvc = persistent_volume_claim(
            "corral-system",
            "grdata",
            AccessMode::ReadWriteMany,
            &params,
            &labels,
            0,
        );
        let spec = pvc.spec.expect("claim should have a spec");
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteMany".to_string()]));
        assert_eq!(spec.storage_class_name.as_deref(), Some("nfs"));
        let requests = spec
            .resources
            .and_then(|r| r.requests)
            .expect("claim should request storage");
        assert_eq!(requests["storage"], Quantity("1Gi".to_string()));

        let sized = persistent_volume_claim(
            "corral-system",
            "grdata",
            AccessMode::ReadWriteMany,
            &params,
            &labels,
            40,
        );
        let requests = sized
            .spec
            .and_then(|s| s.resources)
            .and_then(|r| r.requests)
            .expect("claim should request storage");
        assert_eq!(requests["storage"], Quantity("40Gi".to_string()));
    }
}
