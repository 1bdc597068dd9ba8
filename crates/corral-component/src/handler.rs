//! Component reconciliation protocol
//!
//! A [`ComponentHandler`] turns one `CorralComponent` into cluster objects
//! in fixed phases: `before` gathers prerequisites, `resources` renders
//! the desired objects, `after` runs follow-up side effects and
//! `list_pods` reports what is running.
//!
//! Optional behaviour is exposed through capability probes. A handler
//! that supports a capability overrides the matching `as_*` method to
//! return itself; the reconciler calls the capability only when the probe
//! yields `Some`.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::api::DynamicObject;
use tokio_util::sync::CancellationToken;

use corral_common::crd::CorralVolume;
use corral_common::{Error, OperatorConfig};

use crate::client::{ClusterApi, ManagedResource};
use crate::storage::PvcParameters;
use crate::Result;

/// Everything a handler needs to talk to the cluster during one pass
///
/// Each cluster call goes through [`ComponentContext::guard`], so
/// cancelling the token aborts the pass at the next call boundary with
/// [`Error::Cancelled`].
#[derive(Clone)]
pub struct ComponentContext {
    /// Cluster API
    pub api: Arc<dyn ClusterApi>,
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
    /// Cancellation signal for the current pass
    pub cancel: CancellationToken,
}

impl ComponentContext {
    /// Create a context for one pass
    pub fn new(
        api: Arc<dyn ClusterApi>,
        config: Arc<OperatorConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            config,
            cancel,
        }
    }

    /// Namespace components are reconciled in
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Race `fut` against cancellation
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }

    /// Fetch a Secret
    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.guard(self.api.get_secret(namespace, name)).await
    }

    /// List storage descriptors
    pub async fn list_volumes(&self, namespace: &str, selector: &str) -> Result<Vec<CorralVolume>> {
        self.guard(self.api.list_volumes(namespace, selector)).await
    }

    /// List pods
    pub async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        self.guard(self.api.list_pods(namespace, selector)).await
    }

    /// Fetch a Service
    pub async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.guard(self.api.get_service(namespace, name)).await
    }

    /// Fetch an APIService registration
    pub async fn get_api_service(&self, name: &str) -> Result<Option<APIService>> {
        self.guard(self.api.get_api_service(name)).await
    }

    /// Create or update an APIService registration
    pub async fn apply_api_service(&self, api_service: &APIService) -> Result<()> {
        self.guard(self.api.apply_api_service(api_service)).await
    }

    /// Fetch the live counterpart of a generated object
    pub async fn get(&self, resource: &ManagedResource) -> Result<Option<DynamicObject>> {
        self.guard(self.api.get(resource)).await
    }

    /// Server-side apply a generated object
    pub async fn apply(&self, resource: &ManagedResource) -> Result<()> {
        self.guard(self.api.apply(resource)).await
    }

    /// Create an object unless it already exists
    pub async fn create_if_absent(&self, resource: &ManagedResource) -> Result<bool> {
        self.guard(self.api.create_if_absent(resource)).await
    }

    /// Delete an object if it exists
    pub async fn delete(&self, resource: &ManagedResource) -> Result<()> {
        self.guard(self.api.delete(resource)).await
    }
}

/// Per-component reconciliation phases
#[async_trait]
pub trait ComponentHandler: Send + Sync {
    /// Cluster-independent gate checked before storage dispatch
    ///
    /// An [`Error::NotReady`] here skips the pass without any cluster lookup.
    fn check_installable(&self) -> Result<()> {
        Ok(())
    }

    /// Gather prerequisites; any error stops the pass
    async fn before(&mut self, ctx: &ComponentContext) -> Result<()>;

    /// Render the objects that are applied on every pass
    fn resources(&self) -> Result<Vec<ManagedResource>>;

    /// Follow-up side effects once resources are applied
    async fn after(&self, ctx: &ComponentContext) -> Result<()>;

    /// Pods backing the component
    async fn list_pods(&self, ctx: &ComponentContext) -> Result<Vec<Pod>>;

    /// Replica count that differs from `spec.replicas`
    fn as_replica_override(&self) -> Option<&dyn ReplicaOverride> {
        None
    }

    /// Objects that are created once and never updated
    fn as_create_if_not_exists(&self) -> Option<&dyn CreateIfNotExists> {
        None
    }

    /// Cluster-scoped objects that are created once
    fn as_cluster_scoped(&self) -> Option<&dyn ClusterScopedCreate> {
        None
    }

    /// Objects removed at the start of every pass
    fn as_delete_on_reconcile(&self) -> Option<&dyn DeleteOnReconcile> {
        None
    }

    /// Receiver of the shared-writer storage class
    fn as_storage_rwx_mut(&mut self) -> Option<&mut dyn StorageClassRwx> {
        None
    }

    /// Receiver of the single-writer storage class
    fn as_storage_rwo_mut(&mut self) -> Option<&mut dyn StorageClassRwo> {
        None
    }
}

/// The component decides its own replica count
pub trait ReplicaOverride {
    /// Replica count, `None` to defer to `spec.replicas`
    fn replicas(&self) -> Option<i32>;
}

/// Objects created only when absent
pub trait CreateIfNotExists {
    /// Objects to create if missing
    fn resources_create_if_not_exists(&self) -> Result<Vec<ManagedResource>>;
}

/// Cluster-scoped objects created only when absent
pub trait ClusterScopedCreate {
    /// Cluster-scoped objects to create if missing
    fn create_cluster_scoped(&self) -> Result<Vec<ManagedResource>>;
}

/// Objects that must not exist
pub trait DeleteOnReconcile {
    /// Objects to delete if present
    fn resources_need_delete(&self) -> Result<Vec<ManagedResource>>;
}

/// Accepts a resolved ReadWriteMany storage class
pub trait StorageClassRwx {
    /// Store the resolved parameters for this pass
    fn set_storage_class_name_rwx(&mut self, params: PvcParameters);
}

/// Accepts a resolved ReadWriteOnce storage class
pub trait StorageClassRwo {
    /// Store the resolved parameters for this pass
    fn set_storage_class_name_rwo(&mut self, params: PvcParameters);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::client::MockClusterApi;

    /// Context over a mock API with a live token
    pub fn context(api: MockClusterApi) -> ComponentContext {
        ComponentContext::new(
            Arc::new(api),
            Arc::new(OperatorConfig::default()),
            CancellationToken::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterApi;

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let mut api = MockClusterApi::new();
        api.expect_get_secret().returning(|_, _| Ok(None));
        let ctx = testing::context(api);

        let secret = ctx
            .get_secret("corral-system", "missing")
            .await
            .expect("lookup should succeed");
        assert!(secret.is_none());
    }

    /// Story: a cancelled pass stops at the next cluster call
    #[tokio::test]
    async fn story_cancelled_pass_returns_cancelled() {
        let mut api = MockClusterApi::new();
        api.expect_list_pods().never();
        let ctx = testing::context(api);
        ctx.cancel.cancel();

        let err = ctx
            .guard(std::future::pending::<Result<()>>())
            .await
            .expect_err("cancelled guard should fail");
        assert!(matches!(err, Error::Cancelled));
        assert!(err.is_ignorable());
    }

    struct Bare;

    #[async_trait]
    impl ComponentHandler for Bare {
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
    }

    #[test]
    fn test_capabilities_default_to_absent() {
        let mut handler = Bare;
        assert!(handler.check_installable().is_ok());
        assert!(handler.as_replica_override().is_none());
        assert!(handler.as_create_if_not_exists().is_none());
        assert!(handler.as_cluster_scoped().is_none());
        assert!(handler.as_delete_on_reconcile().is_none());
        assert!(handler.as_storage_rwx_mut().is_none());
        assert!(handler.as_storage_rwo_mut().is_none());
    }
}
