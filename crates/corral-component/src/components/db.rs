//! corral-db: the self-hosted MySQL instance

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, EnvVar, EnvVarSource, ExecAction, Pod, Probe, Secret,
    SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tracing::debug;

use corral_common::crd::{AccessMode, CorralCluster, CorralComponent};
use corral_common::{Error, OperatorConfig};

use super::{
    component_namespace, list_pods_by_labels, merged_container, metadata, pod_template, service,
    ContainerDefaults,
};
use crate::client::ManagedResource;
use crate::handler::{
    ComponentContext, ComponentHandler, CreateIfNotExists, DeleteOnReconcile, ReplicaOverride,
    StorageClassRwo,
};
use crate::prerequisites::{affinity_for_required_nodes, MYSQL_PASSWORD_KEY, MYSQL_USER_KEY};
use crate::storage::{persistent_volume_claim, PvcParameters};
use crate::Result;

/// Component name, also the name of its Service and credentials Secret
pub const DB_NAME: &str = "corral-db";
const MYCNF: &str = "corral-db-mycnf";
const INITDB: &str = "corral-db-initdb";
/// ConfigMap left behind by earlier releases
const LEGACY_CONFIGMAP: &str = "corral-db-config";
const DATA_CLAIM: &str = "data";
const MYSQL_USER: &str = "root";
const DATABASES: [&str; 2] = ["console", "region"];

pub(super) struct Db {
    component: Arc<CorralComponent>,
    cluster: Arc<CorralCluster>,
    labels: BTreeMap<String, String>,
    storage_gib: i64,
    password: Option<String>,
    pvc: Option<PvcParameters>,
}

/// Random hex password for a new database
fn generate_password() -> Result<String> {
    use aws_lc_rs::rand::{SecureRandom, SystemRandom};
    let mut bytes = [0u8; 8];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| Error::internal_with_context(DB_NAME, "failed to generate password"))?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

fn my_cnf() -> String {
    let innodb_dirs = DATABASES
        .iter()
        .map(|db| format!("/var/lib/mysql/{}", db))
        .collect::<Vec<_>>()
        .join(";");
    format!(
        r#"[client]
default-character-set = utf8mb4

[mysqld]
user=mysql
innodb_directories="{}"
character-set-server  = utf8mb4
collation-server      = utf8mb4_unicode_ci
default_authentication_plugin=mysql_native_password
skip-host-cache
skip-name-resolve
"#,
        innodb_dirs
    )
}

impl Db {
    pub(super) fn new(
        component: Arc<CorralComponent>,
        cluster: Arc<CorralCluster>,
        config: &OperatorConfig,
    ) -> Self {
        let labels = component.workload_labels();
        Self {
            component,
            cluster,
            labels,
            storage_gib: config.db_storage_gib,
            password: None,
            pvc: None,
        }
    }

    fn config_map(&self, name: &str, key: &str, content: String) -> ConfigMap {
        ConfigMap {
            metadata: metadata(&self.component, name, &self.labels),
            data: Some(BTreeMap::from([(key.to_string(), content)])),
            ..Default::default()
        }
    }

    fn stateful_set(&self) -> Result<StatefulSet> {
        let pvc = self.pvc.as_ref().ok_or_else(|| {
            Error::internal_with_context(DB_NAME, "storage class was not resolved before rendering")
        })?;
        let claim = persistent_volume_claim(
            &component_namespace(&self.component),
            DATA_CLAIM,
            AccessMode::ReadWriteOnce,
            pvc,
            &self.labels,
            self.storage_gib,
        );

        let value = |name: &str, value: &str| EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        };
        let env = vec![
            value("MYSQL_ROOT_HOST", "%"),
            value("MYSQL_LOG_CONSOLE", "true"),
            EnvVar {
                name: "MYSQL_ROOT_PASSWORD".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: DB_NAME.to_string(),
                        key: MYSQL_PASSWORD_KEY.to_string(),
                        optional: Some(true),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            value("MYSQL_DATABASE", "region"),
        ];
        let config_volume = |name: &str| Volume {
            name: name.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mount = |name: &str, path: &str, sub_path: Option<&str>| VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            sub_path: sub_path.map(String::from),
            ..Default::default()
        };

        let (mut container, volumes) = merged_container(
            &self.component,
            DB_NAME,
            ContainerDefaults {
                env,
                volume_mounts: vec![
                    mount(DATA_CLAIM, "/var/lib/mysql", None),
                    mount(INITDB, "/docker-entrypoint-initdb.d", None),
                    mount(MYCNF, "/etc/my.cnf", Some("my.cnf")),
                ],
                volumes: vec![config_volume(INITDB), config_volume(MYCNF)],
                ..Default::default()
            },
        );
        container.readiness_probe = Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    r#"mysqladmin ping -u root -p"$MYSQL_ROOT_PASSWORD""#.to_string(),
                ]),
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(2),
            timeout_seconds: Some(1),
            ..Default::default()
        });

        let mut template = pod_template(
            &self.component,
            &self.cluster,
            &self.labels,
            container,
            volumes,
        );
        let chaos_nodes: Vec<String> = self
            .cluster
            .spec
            .nodes_for_chaos
            .iter()
            .map(|n| n.name.clone())
            .collect();
        if let Some(spec) = template.spec.as_mut().filter(|_| !chaos_nodes.is_empty()) {
            spec.affinity = Some(affinity_for_required_nodes(&chaos_nodes));
        }

        Ok(StatefulSet {
            metadata: metadata(&self.component, DB_NAME, &self.labels),
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                service_name: Some(DB_NAME.to_string()),
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
}

#[async_trait]
impl ComponentHandler for Db {
    fn check_installable(&self) -> Result<()> {
        if self.cluster.spec.region_database.is_some() && self.cluster.spec.ui_database.is_some() {
            return Err(Error::not_ready("external databases are configured"));
        }
        Ok(())
    }

    async fn before(&mut self, ctx: &ComponentContext) -> Result<()> {
        let existing = ctx
            .get_secret(&component_namespace(&self.component), DB_NAME)
            .await?;
        if existing.is_none() {
            debug!("No database credentials yet, generating a password");
            self.password = Some(generate_password()?);
        }
        Ok(())
    }

    fn resources(&self) -> Result<Vec<ManagedResource>> {
        Ok(vec![
            ManagedResource::from_typed(&self.config_map(MYCNF, "my.cnf", my_cnf()))?,
            ManagedResource::from_typed(&self.config_map(
                INITDB,
                "initdb.sql",
                "CREATE DATABASE IF NOT EXISTS console;\n".to_string(),
            ))?,
            ManagedResource::from_typed(&self.stateful_set()?)?,
            ManagedResource::from_typed(&service(
                &self.component,
                DB_NAME,
                &self.labels,
                "mysql",
                3306,
            ))?,
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

    fn as_create_if_not_exists(&self) -> Option<&dyn CreateIfNotExists> {
        Some(self)
    }

    fn as_delete_on_reconcile(&self) -> Option<&dyn DeleteOnReconcile> {
        Some(self)
    }

    fn as_storage_rwo_mut(&mut self) -> Option<&mut dyn StorageClassRwo> {
        Some(self)
    }
}

impl ReplicaOverride for Db {
    fn replicas(&self) -> Option<i32> {
        Some(1)
    }
}

impl CreateIfNotExists for Db {
    /// The credentials Secret; an existing password is never replaced
    fn resources_create_if_not_exists(&self) -> Result<Vec<ManagedResource>> {
        let Some(password) = &self.password else {
            return Ok(Vec::new());
        };
        let secret = Secret {
            metadata: metadata(&self.component, DB_NAME, &self.labels),
            string_data: Some(BTreeMap::from([
                (MYSQL_USER_KEY.to_string(), MYSQL_USER.to_string()),
                (MYSQL_PASSWORD_KEY.to_string(), password.clone()),
            ])),
            ..Default::default()
        };
        Ok(vec![ManagedResource::from_typed(&secret)?])
    }
}

impl DeleteOnReconcile for Db {
    fn resources_need_delete(&self) -> Result<Vec<ManagedResource>> {
        let legacy = ConfigMap {
            metadata: metadata(&self.component, LEGACY_CONFIGMAP, &BTreeMap::new()),
            ..Default::default()
        };
        Ok(vec![ManagedResource::from_typed(&legacy)?])
    }
}

impl StorageClassRwo for Db {
    fn set_storage_class_name_rwo(&mut self, params: PvcParameters) {
        self.pvc = Some(params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterApi;
    use crate::components::fixtures;
    use crate::handler::testing;
    use corral_common::crd::{CorralClusterSpec, CorralComponentSpec, Database};

    fn db(spec: CorralClusterSpec) -> Db {
        Db::new(
            fixtures::component(DB_NAME, CorralComponentSpec::default()),
            fixtures::cluster(spec),
            &OperatorConfig::default(),
        )
    }

    /// Story: a fresh install generates credentials once and pins one replica
    #[tokio::test]
    async fn story_fresh_install_generates_credentials() {
        let mut api = MockClusterApi::new();
        api.expect_get_secret()
            .withf(|_, name| name == DB_NAME)
            .returning(|_, _| Ok(None));
        let ctx = testing::context(api);

        let mut handler = db(CorralClusterSpec::default());
        handler.before(&ctx).await.expect("before should succeed");
        handler.set_storage_class_name_rwo(PvcParameters {
            storage_class_name: "local".to_string(),
            storage_request: None,
        });

        let created = handler
            .resources_create_if_not_exists()
            .expect("secret should render");
        assert_eq!(created.len(), 1);
        let password = created[0].object.data["stringData"][MYSQL_PASSWORD_KEY]
            .as_str()
            .expect("password should be a string");
        assert_eq!(password.len(), 16);

        assert_eq!(handler.replicas(), Some(1));
        let resources = handler.resources().expect("resources should render");
        assert_eq!(
            fixtures::kinds_and_names(&resources),
            vec![
                ("ConfigMap".to_string(), MYCNF.to_string()),
                ("ConfigMap".to_string(), INITDB.to_string()),
                ("StatefulSet".to_string(), DB_NAME.to_string()),
                ("Service".to_string(), DB_NAME.to_string()),
            ]
        );
        let claim = &resources[2].object.data["spec"]["volumeClaimTemplates"][0]["spec"];
        assert_eq!(claim["accessModes"][0], "ReadWriteOnce");
        assert_eq!(claim["resources"]["requests"]["storage"], "20Gi");
    }

    #[tokio::test]
    async fn test_existing_credentials_are_kept() {
        let mut api = MockClusterApi::new();
        api.expect_get_secret()
            .returning(|_, _| Ok(Some(Secret::default())));
        let ctx = testing::context(api);

        let mut handler = db(CorralClusterSpec::default());
        handler.before(&ctx).await.expect("before should succeed");
        assert!(handler
            .resources_create_if_not_exists()
            .expect("should render")
            .is_empty());
    }

    #[test]
    fn test_external_databases_skip_self_hosting() {
        let handler = db(CorralClusterSpec {
            region_database: Some(Database::default()),
            ui_database: Some(Database::default()),
            ..Default::default()
        });
        let err = handler
            .check_installable()
            .expect_err("self-hosting should be skipped");
        assert!(err.is_ignorable());
    }

    #[test]
    fn test_legacy_config_map_is_deleted() {
        let handler = db(CorralClusterSpec::default());
        let deleted = handler
            .resources_need_delete()
            .expect("delete list should render");
        assert_eq!(
            fixtures::kinds_and_names(&deleted),
            vec![("ConfigMap".to_string(), LEGACY_CONFIGMAP.to_string())]
        );
    }

    #[test]
    fn test_rendering_without_storage_fails() {
        assert!(db(CorralClusterSpec::default()).resources().is_err());
    }
}
