//! Cluster API abstraction used by component handlers
//!
//! Handlers never hold a `kube::Client` directly. Everything they read or
//! write goes through [`ClusterApi`], so tests swap in a mock and the
//! reconciler can race each call against cancellation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use corral_common::crd::CorralVolume;
use corral_common::{Error, FIELD_MANAGER};

/// A generated object together with the API coordinates needed to write it
#[derive(Clone, Debug)]
pub struct ManagedResource {
    /// Group, version, kind and plural of the object
    pub api_resource: ApiResource,
    /// The object body
    pub object: DynamicObject,
}

impl ManagedResource {
    /// Erase a typed object into a managed resource
    pub fn from_typed<K>(obj: &K) -> Result<Self, Error>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let api_resource = ApiResource::erase::<K>(&());
        let mut value = serde_json::to_value(obj).map_err(|e| {
            Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string())
        })?;
        // typed builders often leave TypeMeta empty
        value["apiVersion"] = serde_json::Value::String(api_resource.api_version.clone());
        value["kind"] = serde_json::Value::String(api_resource.kind.clone());
        let object: DynamicObject = serde_json::from_value(value).map_err(|e| {
            Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string())
        })?;
        Ok(Self {
            api_resource,
            object,
        })
    }

    /// Object name
    pub fn name(&self) -> String {
        self.object.name_any()
    }

    /// Object namespace, `None` for cluster-scoped objects
    pub fn namespace(&self) -> Option<String> {
        self.object.namespace()
    }

    /// Object kind
    pub fn kind(&self) -> &str {
        &self.api_resource.kind
    }
}

/// Operations component handlers perform against the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a Secret, `None` when absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// List storage descriptors matching a label selector
    async fn list_volumes(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<CorralVolume>, Error>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Fetch a Service, `None` when absent
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Fetch a cluster-scoped APIService registration, `None` when absent
    async fn get_api_service(&self, name: &str) -> Result<Option<APIService>, Error>;

    /// Create or update an APIService registration
    async fn apply_api_service(&self, api_service: &APIService) -> Result<(), Error>;

    /// Fetch the live counterpart of a generated object, `None` when absent
    async fn get(&self, resource: &ManagedResource) -> Result<Option<DynamicObject>, Error>;

    /// Server-side apply a generated object
    async fn apply(&self, resource: &ManagedResource) -> Result<(), Error>;

    /// Create an object unless it exists; returns whether it was created
    async fn create_if_absent(&self, resource: &ManagedResource) -> Result<bool, Error>;

    /// Delete an object; absent objects are not an error
    async fn delete(&self, resource: &ManagedResource) -> Result<(), Error>;
}

/// [`ClusterApi`] backed by a kube client
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, resource: &ManagedResource) -> Api<DynamicObject> {
        match resource.namespace() {
            Some(ns) => Api::namespaced_with(self.client.clone(), &ns, &resource.api_resource),
            None => Api::all_with(self.client.clone(), &resource.api_resource),
        }
    }
}

/// Turn a 404 into `Ok(None)`
fn optional<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn list_volumes(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<CorralVolume>, Error> {
        let api: Api<CorralVolume> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn get_api_service(&self, name: &str) -> Result<Option<APIService>, Error> {
        let api: Api<APIService> = Api::all(self.client.clone());
        optional(api.get(name).await)
    }

    async fn apply_api_service(&self, api_service: &APIService) -> Result<(), Error> {
        let api: Api<APIService> = Api::all(self.client.clone());
        let name = api_service.name_any();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(api_service),
        )
        .await?;
        info!(name = %name, "Applied APIService");
        Ok(())
    }

    async fn get(&self, resource: &ManagedResource) -> Result<Option<DynamicObject>, Error> {
        optional(self.dynamic_api(resource).get(&resource.name()).await)
    }

    async fn apply(&self, resource: &ManagedResource) -> Result<(), Error> {
        let name = resource.name();
        self.dynamic_api(resource)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&resource.object),
            )
            .await?;
        debug!(kind = %resource.kind(), name = %name, "Applied resource");
        Ok(())
    }

    async fn create_if_absent(&self, resource: &ManagedResource) -> Result<bool, Error> {
        let name = resource.name();
        match self
            .dynamic_api(resource)
            .create(&PostParams::default(), &resource.object)
            .await
        {
            Ok(_) => {
                info!(kind = %resource.kind(), name = %name, "Created resource");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, resource: &ManagedResource) -> Result<(), Error> {
        let name = resource.name();
        match self
            .dynamic_api(resource)
            .delete(&name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(kind = %resource.kind(), name = %name, "Deleted resource");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_typed_fills_type_meta() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("corral-db-config".to_string()),
                namespace: Some("corral-system".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
            ..Default::default()
        };

        let managed = ManagedResource::from_typed(&cm).expect("erasure should succeed");
        assert_eq!(managed.kind(), "ConfigMap");
        assert_eq!(managed.name(), "corral-db-config");
        assert_eq!(managed.namespace().as_deref(), Some("corral-system"));
        assert_eq!(managed.api_resource.api_version, "v1");
        assert_eq!(managed.object.data["data"]["k"], "v");
    }

    #[test]
    fn test_cluster_scoped_object_has_no_namespace() {
        let api_service = APIService {
            metadata: ObjectMeta {
                name: Some("v1beta1.metrics.k8s.io".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let managed = ManagedResource::from_typed(&api_service).expect("erasure should succeed");
        assert_eq!(managed.namespace(), None);
        assert_eq!(managed.api_resource.group, "apiregistration.k8s.io");
    }
}
