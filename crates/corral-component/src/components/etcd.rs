//! corral-etcd: the self-hosted etcd cluster
//!
//! Members bootstrap statically from the StatefulSet's stable pod names,
//! so the peer list is known before any pod starts.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, ObjectFieldSelector, Pod, Service, ServicePort, ServiceSpec,
    Toleration, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use corral_common::crd::{AccessMode, CorralCluster, CorralComponent};
use corral_common::Error;

use super::{
    component_namespace, list_pods_by_labels, merged_container, metadata, pod_template,
    ContainerDefaults,
};
use crate::client::ManagedResource;
use crate::handler::{ComponentContext, ComponentHandler, ReplicaOverride, StorageClassRwo};
use crate::prerequisites::affinity_for_required_nodes;
use crate::storage::{persistent_volume_claim, PvcParameters};
use crate::Result;

/// Component name, also the name of its headless Service
pub const ETCD_NAME: &str = "corral-etcd";
const DATA_CLAIM: &str = "data";
const DATA_DIR: &str = "/var/run/etcd";
const STORAGE_GIB: i64 = 20;
const CLIENT_PORT: i32 = 2379;
const PEER_PORT: i32 = 2380;
/// 4 GiB backend quota
const QUOTA_BACKEND_BYTES: &str = "4294967296";

pub(super) struct Etcd {
    component: Arc<CorralComponent>,
    cluster: Arc<CorralCluster>,
    labels: BTreeMap<String, String>,
    pvc: Option<PvcParameters>,
}

impl Etcd {
    pub(super) fn new(component: Arc<CorralComponent>, cluster: Arc<CorralCluster>) -> Self {
        let mut labels = component.workload_labels();
        labels.insert("etcd_node".to_string(), ETCD_NAME.to_string());
        Self {
            component,
            cluster,
            labels,
            pvc: None,
        }
    }

    fn member_count(&self) -> i32 {
        if self.cluster.spec.enable_ha {
            3
        } else {
            1
        }
    }

    fn peer_url(&self, member: &str) -> String {
        format!(
            "http://{}.{}.{}:{}",
            member,
            ETCD_NAME,
            component_namespace(&self.component),
            PEER_PORT
        )
    }

    fn initial_cluster(&self) -> String {
        (0..self.member_count())
            .map(|i| {
                let member = format!("{}-{}", ETCD_NAME, i);
                format!("{}={}", member, self.peer_url(&member))
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    fn args(&self) -> Vec<String> {
        let namespace = component_namespace(&self.component);
        vec![
            "--name=$(POD_NAME)".to_string(),
            format!("--data-dir={}/default.etcd", DATA_DIR),
            format!("--listen-client-urls=http://0.0.0.0:{}", CLIENT_PORT),
            format!(
                "--advertise-client-urls=http://$(POD_NAME).{}.{}:{}",
                ETCD_NAME, namespace, CLIENT_PORT
            ),
            format!("--listen-peer-urls=http://0.0.0.0:{}", PEER_PORT),
            format!(
                "--initial-advertise-peer-urls=http://$(POD_NAME).{}.{}:{}",
                ETCD_NAME, namespace, PEER_PORT
            ),
            format!("--initial-cluster={}", self.initial_cluster()),
            "--initial-cluster-state=new".to_string(),
        ]
    }

    fn stateful_set(&self) -> Result<StatefulSet> {
        let pvc = self.pvc.as_ref().ok_or_else(|| {
            Error::internal_with_context(ETCD_NAME, "storage class was not resolved before rendering")
        })?;
        let claim = persistent_volume_claim(
            &component_namespace(&self.component),
            DATA_CLAIM,
            AccessMode::ReadWriteOnce,
            pvc,
            &self.labels,
            STORAGE_GIB,
        );

        let env = vec![
            EnvVar {
                name: "POD_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: "ETCD_QUOTA_BACKEND_BYTES".to_string(),
                value: Some(QUOTA_BACKEND_BYTES.to_string()),
                ..Default::default()
            },
        ];
        let (mut container, volumes) = merged_container(
            &self.component,
            ETCD_NAME,
            ContainerDefaults {
                args: self.args(),
                env,
                volume_mounts: vec![VolumeMount {
                    name: DATA_CLAIM.to_string(),
                    mount_path: DATA_DIR.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        container.command = Some(vec!["etcd".to_string()]);

        let mut template = pod_template(
            &self.component,
            &self.cluster,
            &self.labels,
            container,
            volumes,
        );
        if let Some(spec) = template.spec.as_mut() {
            spec.tolerations = Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]);
            let chaos_nodes: Vec<String> = self
                .cluster
                .spec
                .nodes_for_chaos
                .iter()
                .map(|n| n.name.clone())
                .collect();
            if !chaos_nodes.is_empty() {
                spec.affinity = Some(affinity_for_required_nodes(&chaos_nodes));
            }
        }

        Ok(StatefulSet {
            metadata: metadata(&self.component, ETCD_NAME, &self.labels),
            spec: Some(StatefulSetSpec {
                replicas: Some(self.member_count()),
                service_name: Some(ETCD_NAME.to_string()),
                selector: LabelSelector {
                    match_labels: Some(self.labels.clone()),
                    ..Default::default()
                },
                template,
                volume_claim_templates: Some(vec![claim]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn headless_service(&self) -> Service {
        let port = |name: &str, port: i32| ServicePort {
            name: Some(name.to_string()),
            port,
            ..Default::default()
        };
        Service {
            metadata: metadata(&self.component, ETCD_NAME, &self.labels),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                ports: Some(vec![port("client", CLIENT_PORT), port("server", PEER_PORT)]),
                selector: Some(self.labels.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ComponentHandler for Etcd {
    fn check_installable(&self) -> Result<()> {
        if self.cluster.spec.etcd_config.is_some() {
            return Err(Error::not_ready("an external etcd is configured"));
        }
        Ok(())
    }

    async fn before(&mut self, _ctx: &ComponentContext) -> Result<()> {
        Ok(())
    }

    fn resources(&self) -> Result<Vec<ManagedResource>> {
        Ok(vec![
            ManagedResource::from_typed(&self.stateful_set()?)?,
            ManagedResource::from_typed(&self.headless_service())?,
        ])
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

    fn as_storage_rwo_mut(&mut self) -> Option<&mut dyn StorageClassRwo> {
        Some(self)
    }
}

impl ReplicaOverride for Etcd {
    fn replicas(&self) -> Option<i32> {
        Some(self.member_count())
    }
}

impl StorageClassRwo for Etcd {
    fn set_storage_class_name_rwo(&mut self, params: PvcParameters) {
        self.pvc = Some(params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::fixtures;
    use corral_common::crd::{CorralClusterSpec, CorralComponentSpec, EtcdConfig};

    fn etcd(enable_ha: bool) -> Etcd {
        let mut handler = Etcd::new(
            fixtures::component(ETCD_NAME, CorralComponentSpec::default()),
            fixtures::cluster(CorralClusterSpec {
                enable_ha,
                ..Default::default()
            }),
        );
        handler.set_storage_class_name_rwo(PvcParameters {
            storage_class_name: "local".to_string(),
            storage_request: None,
        });
        handler
    }

    #[test]
    fn test_single_member_by_default() {
        let handler = etcd(false);
        assert_eq!(handler.replicas(), Some(1));
        assert_eq!(
            handler.initial_cluster(),
            "corral-etcd-0=http://corral-etcd-0.corral-etcd.corral-system:2380"
        );
    }

    /// Story: enabling HA grows etcd to a three-member cluster
    #[test]
    fn story_ha_runs_three_members() {
        let handler = etcd(true);
        assert_eq!(handler.replicas(), Some(3));
        assert_eq!(handler.initial_cluster().split(',').count(), 3);

        let resources = handler.resources().expect("resources should render");
        let sts = &resources[0].object.data["spec"];
        assert_eq!(sts["replicas"], 3);
        assert_eq!(
            sts["volumeClaimTemplates"][0]["spec"]["accessModes"][0],
            "ReadWriteOnce"
        );
        assert_eq!(resources[1].object.data["spec"]["clusterIP"], "None");
    }

    #[test]
    fn test_external_etcd_skips_self_hosting() {
        let handler = Etcd::new(
            fixtures::component(ETCD_NAME, CorralComponentSpec::default()),
            fixtures::cluster(CorralClusterSpec {
                etcd_config: Some(EtcdConfig::default()),
                ..Default::default()
            }),
        );
        let err = handler
            .check_installable()
            .expect_err("self-hosting should be skipped");
        assert!(err.is_ignorable());
    }
}
