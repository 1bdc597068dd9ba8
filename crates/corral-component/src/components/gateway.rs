//! corral-gateway: the ingress gateway, one pod per gateway node

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{EnvVar, Pod, Secret, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tracing::debug;

use corral_common::crd::{CorralCluster, CorralComponent};

use super::{list_pods_by_labels, merged_container, metadata, pod_template, ContainerDefaults};
use crate::client::ManagedResource;
use crate::handler::{ComponentContext, ComponentHandler, ReplicaOverride};
use crate::prerequisites::{
    affinity_for_required_nodes, etcd_secret, etcd_ssl_args, volume_by_etcd,
};
use crate::Result;

/// Component name
pub const GATEWAY_NAME: &str = "corral-gateway";

pub(super) struct Gateway {
    component: Arc<CorralComponent>,
    cluster: Arc<CorralCluster>,
    labels: BTreeMap<String, String>,
    etcd_secret: Option<Secret>,
}

impl Gateway {
    pub(super) fn new(component: Arc<CorralComponent>, cluster: Arc<CorralCluster>) -> Self {
        let labels = component.workload_labels();
        Self {
            component,
            cluster,
            labels,
            etcd_secret: None,
        }
    }

    fn node_names(&self) -> Vec<String> {
        self.cluster
            .spec
            .nodes_for_gateway
            .iter()
            .map(|n| n.name.clone())
            .collect()
    }

    /// `None` while no gateway node is selected
    fn daemon_set(&self) -> Option<DaemonSet> {
        let node_names = self.node_names();
        if node_names.is_empty() {
            return None;
        }

        let mut args = vec![
            "--error-log=/dev/stderr".to_string(),
            "--errlog-level=error".to_string(),
        ];
        let mut volumes = Vec::new();
        let mut volume_mounts = Vec::new();
        if let Some(secret) = &self.etcd_secret {
            let (volume, mount) = volume_by_etcd(secret);
            volumes.push(volume);
            volume_mounts.push(mount);
            args.extend(etcd_ssl_args());
        }
        let env = [("SERVICE_ID", GATEWAY_NAME), ("LOGGER_DRIVER_NAME", "streamlog")]
            .into_iter()
            .map(|(name, value)| EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            })
            .collect();

        let (container, volumes) = merged_container(
            &self.component,
            GATEWAY_NAME,
            ContainerDefaults {
                args,
                env,
                volume_mounts,
                volumes,
                resources: None,
            },
        );
        let mut template = pod_template(
            &self.component,
            &self.cluster,
            &self.labels,
            container,
            volumes,
        );
        if let Some(spec) = template.spec.as_mut() {
            spec.host_network = Some(true);
            spec.dns_policy = Some("ClusterFirstWithHostNet".to_string());
            spec.affinity = Some(affinity_for_required_nodes(&node_names));
            spec.tolerations = Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]);
        }

        Some(DaemonSet {
            metadata: metadata(&self.component, GATEWAY_NAME, &self.labels),
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(self.labels.clone()),
                    ..Default::default()
                },
                template,
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ComponentHandler for Gateway {
    async fn before(&mut self, ctx: &ComponentContext) -> Result<()> {
        self.etcd_secret = etcd_secret(ctx, &self.cluster).await?;
        Ok(())
    }

    fn resources(&self) -> Result<Vec<ManagedResource>> {
        match self.daemon_set() {
            Some(ds) => Ok(vec![ManagedResource::from_typed(&ds)?]),
            None => {
                debug!("No gateway nodes selected, nothing to render");
                Ok(Vec::new())
            }
        }
    }

    async fn after(&self, _ctx: &ComponentContext) -> Result<()> {
        Ok(())
    }

    async fn list_pods(&self, ctx: &ComponentContext) -> Result<Vec<Pod>> {
        list_pods_by_labels(ctx, &self.component, &self.labels).await
    }

    fn as_replica_override(&self) -> Option<&dyn ReplicaOverride> {
        Some(self)
    }
}

impl ReplicaOverride for Gateway {
    fn replicas(&self) -> Option<i32> {
        Some(i32::try_from(self.cluster.spec.nodes_for_gateway.len()).unwrap_or(i32::MAX))
    }
}
