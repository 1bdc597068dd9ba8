//! Concrete component handlers and the registry that selects them

mod api;
mod db;
mod etcd;
mod gateway;
mod metrics_server;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, PodTemplateSpec, ResourceRequirements, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use corral_common::crd::{CorralCluster, CorralComponent};
use corral_common::kube_utils::label_selector;
use corral_common::{OperatorConfig, CORRAL_SYSTEM_NAMESPACE};

use crate::handler::{ComponentContext, ComponentHandler};
use crate::merge::{merge_args, merge_envs, merge_resources, merge_volume_mounts, merge_volumes};
use crate::prerequisites::image_pull_secrets;
use crate::Result;

pub use api::API_NAME;
pub use db::DB_NAME;
pub use etcd::ETCD_NAME;
pub use gateway::GATEWAY_NAME;
pub use metrics_server::METRICS_SERVER_NAME;

/// Build the handler for a component, `None` when its name is not supported
pub fn new_handler(
    component: Arc<CorralComponent>,
    cluster: Arc<CorralCluster>,
    config: &OperatorConfig,
) -> Option<Box<dyn ComponentHandler>> {
    let handler: Box<dyn ComponentHandler> = match component.name_any().as_str() {
        API_NAME => Box::new(api::Api::new(component, cluster, config)),
        DB_NAME => Box::new(db::Db::new(component, cluster, config)),
        ETCD_NAME => Box::new(etcd::Etcd::new(component, cluster)),
        GATEWAY_NAME => Box::new(gateway::Gateway::new(component, cluster)),
        METRICS_SERVER_NAME => Box::new(metrics_server::MetricsServer::new(component, cluster)),
        _ => return None,
    };
    Some(handler)
}

/// Names of every supported component
pub fn supported_components() -> [&'static str; 5] {
    [API_NAME, DB_NAME, ETCD_NAME, GATEWAY_NAME, METRICS_SERVER_NAME]
}

/// Settings a handler generates for its main container
#[derive(Default)]
pub(crate) struct ContainerDefaults {
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub volume_mounts: Vec<VolumeMount>,
    pub volumes: Vec<Volume>,
    pub resources: Option<ResourceRequirements>,
}

/// Main container plus pod volumes, with the component's overrides merged in
pub(crate) fn merged_container(
    component: &CorralComponent,
    name: &str,
    defaults: ContainerDefaults,
) -> (Container, Vec<Volume>) {
    let spec = &component.spec;
    let container = Container {
        name: name.to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some(component.image_pull_policy()),
        args: Some(merge_args(&defaults.args, &spec.args)),
        env: Some(merge_envs(&defaults.env, &spec.env)),
        volume_mounts: Some(merge_volume_mounts(
            &defaults.volume_mounts,
            &spec.volume_mounts,
        )),
        resources: merge_resources(defaults.resources, spec.resources.as_ref()),
        ..Default::default()
    };
    (container, merge_volumes(&defaults.volumes, &spec.volumes))
}

/// Pod template running `container` with the component's labels
pub(crate) fn pod_template(
    component: &CorralComponent,
    cluster: &CorralCluster,
    labels: &BTreeMap<String, String>,
    container: Container,
    volumes: Vec<Volume>,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: (!volumes.is_empty()).then_some(volumes),
            image_pull_secrets: image_pull_secrets(component, cluster),
            termination_grace_period_seconds: Some(0),
            ..Default::default()
        }),
    }
}

/// Object metadata in the component's namespace
pub(crate) fn metadata(
    component: &CorralComponent,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: component.namespace(),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

/// ClusterIP service exposing one named port
pub(crate) fn service(
    component: &CorralComponent,
    name: &str,
    labels: &BTreeMap<String, String>,
    port_name: &str,
    port: i32,
) -> Service {
    Service {
        metadata: metadata(component, name, labels),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(port_name.to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            selector: Some(labels.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Namespace the component lives in
pub(crate) fn component_namespace(component: &CorralComponent) -> String {
    component
        .namespace()
        .unwrap_or_else(|| CORRAL_SYSTEM_NAMESPACE.to_string())
}

/// Pods in the component namespace carrying `labels`
pub(crate) async fn list_pods_by_labels(
    ctx: &ComponentContext,
    component: &CorralComponent,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<Pod>> {
    let namespace = component_namespace(component);
    ctx.list_pods(&namespace, &label_selector(labels)).await
}
