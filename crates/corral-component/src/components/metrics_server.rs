//! metrics-server: the resource metrics API
//!
//! Clusters often ship their own metrics-server. When the
//! `v1beta1.metrics.k8s.io` registration points at a service corral did
//! not create, the existing installation is adopted: nothing is rendered
//! and pods are reported through the registered service's selector.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ContainerPort, EmptyDirVolumeSource, Pod, SecurityContext, Service, ServiceAccount,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
    APIService, APIServiceSpec, ServiceReference,
};
use tracing::{debug, info};

use corral_common::crd::{CorralCluster, CorralComponent};
use corral_common::kube_utils::label_selector;
use corral_common::Error;

use super::{
    component_namespace, list_pods_by_labels, merged_container, metadata, pod_template,
    ContainerDefaults,
};
use crate::client::ManagedResource;
use crate::handler::{ClusterScopedCreate, ComponentContext, ComponentHandler, ReplicaOverride};
use crate::Result;

/// Component name, also the name of its Service and ServiceAccount
pub const METRICS_SERVER_NAME: &str = "metrics-server";
/// Aggregated API registration served by metrics-server
pub const METRICS_API_SERVICE: &str = "v1beta1.metrics.k8s.io";
const CLUSTER_ROLE: &str = "system:corral-metrics-server";
const SECURE_PORT: i32 = 4443;

pub(super) struct MetricsServer {
    component: Arc<CorralComponent>,
    cluster: Arc<CorralCluster>,
    labels: BTreeMap<String, String>,
    api_service: Option<APIService>,
    /// Written by `list_pods`, read by the replica override afterwards
    observed_pods: AtomicUsize,
}

fn service_ref(api_service: &APIService) -> Option<(&str, &str)> {
    let svc = api_service.spec.as_ref()?.service.as_ref()?;
    Some((svc.namespace.as_deref()?, svc.name.as_deref()?))
}

impl MetricsServer {
    pub(super) fn new(component: Arc<CorralComponent>, cluster: Arc<CorralCluster>) -> Self {
        let labels = component.workload_labels();
        Self {
            component,
            cluster,
            labels,
            api_service: None,
            observed_pods: AtomicUsize::new(0),
        }
    }

    /// Whether the metrics API is (or will be) served by this component
    fn owns_api_service(&self) -> bool {
        match &self.api_service {
            None => true,
            Some(existing) => {
                service_ref(existing)
                    == Some((
                        component_namespace(&self.component).as_str(),
                        METRICS_SERVER_NAME,
                    ))
            }
        }
    }

    fn desired_api_service(&self) -> APIService {
        APIService {
            metadata: ObjectMeta {
                name: Some(METRICS_API_SERVICE.to_string()),
                ..Default::default()
            },
            spec: Some(APIServiceSpec {
                service: Some(ServiceReference {
                    name: Some(METRICS_SERVER_NAME.to_string()),
                    namespace: Some(component_namespace(&self.component)),
                    ..Default::default()
                }),
                group: Some("metrics.k8s.io".to_string()),
                version: Some("v1beta1".to_string()),
                insecure_skip_tls_verify: Some(true),
                group_priority_minimum: 100,
                version_priority: 30,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn deployment(&self) -> Deployment {
        let (mut container, volumes) = merged_container(
            &self.component,
            METRICS_SERVER_NAME,
            ContainerDefaults {
                args: vec![
                    "--cert-dir=/tmp".to_string(),
                    format!("--secure-port={}", SECURE_PORT),
                    "--kubelet-insecure-tls".to_string(),
                    "--kubelet-preferred-address-types=InternalIP".to_string(),
                ],
                volume_mounts: vec![VolumeMount {
                    name: "tmp-dir".to_string(),
                    mount_path: "/tmp".to_string(),
                    ..Default::default()
                }],
                volumes: vec![Volume {
                    name: "tmp-dir".to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        container.ports = Some(vec![ContainerPort {
            name: Some("main-port".to_string()),
            container_port: SECURE_PORT,
            ..Default::default()
        }]);
        container.security_context = Some(SecurityContext {
            read_only_root_filesystem: Some(true),
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            ..Default::default()
        });

        let mut template = pod_template(
            &self.component,
            &self.cluster,
            &self.labels,
            container,
            volumes,
        );
        if let Some(spec) = template.spec.as_mut() {
            spec.service_account_name = Some(METRICS_SERVER_NAME.to_string());
            spec.node_selector = Some(BTreeMap::from([(
                "kubernetes.io/os".to_string(),
                "linux".to_string(),
            )]));
        }

        Deployment {
            metadata: metadata(&self.component, METRICS_SERVER_NAME, &self.labels),
            spec: Some(DeploymentSpec {
                replicas: self.component.spec.replicas,
                selector: LabelSelector {
                    match_labels: Some(self.labels.clone()),
                    ..Default::default()
                },
                template,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service(&self) -> Service {
        let mut labels = self.labels.clone();
        labels.insert("kubernetes.io/name".to_string(), "Metrics-server".to_string());
        labels.insert("kubernetes.io/cluster-service".to_string(), "true".to_string());
        Service {
            metadata: metadata(&self.component, METRICS_SERVER_NAME, &labels),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 443,
                    target_port: Some(IntOrString::Int(SECURE_PORT)),
                    ..Default::default()
                }]),
                selector: Some(self.labels.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: metadata(&self.component, METRICS_SERVER_NAME, &self.labels),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ComponentHandler for MetricsServer {
    async fn before(&mut self, ctx: &ComponentContext) -> Result<()> {
        self.api_service = ctx.get_api_service(METRICS_API_SERVICE).await?;
        if !self.owns_api_service() {
            debug!("Adopting existing metrics API registration");
        }
        Ok(())
    }

    fn resources(&self) -> Result<Vec<ManagedResource>> {
        if !self.owns_api_service() {
            return Ok(Vec::new());
        }
        Ok(vec![
            ManagedResource::from_typed(&self.service_account())?,
            ManagedResource::from_typed(&self.deployment())?,
            ManagedResource::from_typed(&self.service())?,
        ])
    }

    async fn after(&self, ctx: &ComponentContext) -> Result<()> {
        if !self.owns_api_service() {
            return Ok(());
        }
        let desired = self.desired_api_service();
        let up_to_date = self
            .api_service
            .as_ref()
            .and_then(service_ref)
            .zip(service_ref(&desired))
            .is_some_and(|(current, wanted)| current == wanted);
        if up_to_date {
            return Ok(());
        }
        ctx.apply_api_service(&desired).await?;
        info!(name = METRICS_API_SERVICE, "Registered metrics API");
        Ok(())
    }

    async fn list_pods(&self, ctx: &ComponentContext) -> Result<Vec<Pod>> {
        let pods = match self.api_service.as_ref().filter(|_| !self.owns_api_service()) {
            Some(existing) => {
                let (namespace, name) = service_ref(existing).ok_or_else(|| {
                    Error::not_found("Service", "metrics API registration has no service")
                })?;
                let svc = ctx.get_service(namespace, name).await?.ok_or_else(|| {
                    Error::not_found("Service", format!("{}/{}", namespace, name))
                })?;
                let selector = svc
                    .spec
                    .and_then(|s| s.selector)
                    .unwrap_or_default();
                ctx.list_pods(namespace, &label_selector(&selector)).await?
            }
            None => list_pods_by_labels(ctx, &self.component, &self.labels).await?,
        };
        self.observed_pods.store(pods.len(), Ordering::Relaxed);
        Ok(pods)
    }

    fn as_replica_override(&self) -> Option<&dyn ReplicaOverride> {
        Some(self)
    }

    fn as_cluster_scoped(&self) -> Option<&dyn ClusterScopedCreate> {
        self.owns_api_service().then_some(self as &dyn ClusterScopedCreate)
    }
}

impl ReplicaOverride for MetricsServer {
    /// Observed pod count; an owned install never expects fewer than its spec
    fn replicas(&self) -> Option<i32> {
        let observed = i32::try_from(self.observed_pods.load(Ordering::Relaxed)).unwrap_or(i32::MAX);
        if self.owns_api_service() {
            Some(observed.max(self.component.spec.replicas.unwrap_or(1)))
        } else {
            Some(observed)
        }
    }
}

impl ClusterScopedCreate for MetricsServer {
    /// RBAC letting metrics-server read node metrics and delegate auth
    fn create_cluster_scoped(&self) -> Result<Vec<ManagedResource>> {
        let rule = |groups: &[&str], resources: &[&str]| PolicyRule {
            api_groups: Some(groups.iter().map(|g| g.to_string()).collect()),
            resources: Some(resources.iter().map(|r| r.to_string()).collect()),
            verbs: ["get", "list", "watch"].iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        };
        let cluster_role = ClusterRole {
            metadata: ObjectMeta {
                name: Some(CLUSTER_ROLE.to_string()),
                labels: Some(self.labels.clone()),
                ..Default::default()
            },
            rules: Some(vec![
                rule(&[""], &["nodes/metrics", "nodes", "pods", "namespaces"]),
                rule(&["metrics.k8s.io"], &["pods", "nodes"]),
            ]),
            ..Default::default()
        };
        let subject = Subject {
            kind: "ServiceAccount".to_string(),
            name: METRICS_SERVER_NAME.to_string(),
            namespace: Some(component_namespace(&self.component)),
            ..Default::default()
        };
        let binding = |name: &str, role: &str| ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(self.labels.clone()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: role.to_string(),
            },
            subjects: Some(vec![subject.clone()]),
        };

        Ok(vec![
            ManagedResource::from_typed(&cluster_role)?,
            ManagedResource::from_typed(&binding(CLUSTER_ROLE, CLUSTER_ROLE))?,
            ManagedResource::from_typed(&binding(
                "corral-metrics-server:system:auth-delegator",
                "system:auth-delegator",
            ))?,
        ])
    }
}
