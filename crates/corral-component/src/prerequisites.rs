//! Prerequisite lookups shared by component handlers

use k8s_openapi::api::core::v1::{
    Affinity, LocalObjectReference, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use kube::ResourceExt;

use corral_common::crd::{CorralCluster, CorralComponent, Database};
use corral_common::Error;

use crate::handler::ComponentContext;
use crate::Result;

/// Secret key holding the self-hosted database user
pub const MYSQL_USER_KEY: &str = "mysql-user";
/// Secret key holding the self-hosted database password
pub const MYSQL_PASSWORD_KEY: &str = "mysql-password";
/// Port of the self-hosted database
pub const MYSQL_PORT: i32 = 3306;
/// Mount path of the etcd client TLS material
pub const ETCD_SSL_PATH: &str = "/run/ssl/etcd";

fn secret_value(secret: &Secret, key: &str) -> String {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| String::from_utf8_lossy(&b.0).into_owned())
        .unwrap_or_default()
}

/// The authoritative database for `db_name`
///
/// An explicit database wins. Otherwise the credentials of the
/// self-hosted database are read from its Secret, which must exist.
pub async fn default_db_info(
    ctx: &ComponentContext,
    custom: Option<&Database>,
    db_name: &str,
) -> Result<Database> {
    let mut db = match custom {
        Some(db) => db.clone(),
        None => {
            let secret_name = &ctx.config.db_secret_name;
            let secret = ctx
                .get_secret(ctx.namespace(), secret_name)
                .await?
                .ok_or_else(|| {
                    Error::not_ready(format!(
                        "database secret {}/{} not found",
                        ctx.namespace(),
                        secret_name
                    ))
                })?;
            Database {
                host: secret_name.clone(),
                port: MYSQL_PORT,
                username: secret_value(&secret, MYSQL_USER_KEY),
                password: secret_value(&secret, MYSQL_PASSWORD_KEY),
                name: String::new(),
            }
        }
    };
    if db.name.is_empty() {
        db.name = db_name.to_string();
    }
    if db.name.is_empty() {
        return Err(Error::validation_for_field(
            "CorralCluster",
            "spec.regionDatabase.name",
            "database name is empty",
        ));
    }
    Ok(db)
}

/// Secret with etcd client TLS material, when the cluster configures one
pub async fn etcd_secret(ctx: &ComponentContext, cluster: &CorralCluster) -> Result<Option<Secret>> {
    let Some(secret_name) = cluster
        .spec
        .etcd_config
        .as_ref()
        .and_then(|c| c.secret_name.as_deref())
        .filter(|n| !n.is_empty())
    else {
        return Ok(None);
    };
    let namespace = cluster.namespace().unwrap_or_else(|| ctx.namespace().to_string());
    match ctx.get_secret(&namespace, secret_name).await? {
        Some(secret) => Ok(Some(secret)),
        None => Err(Error::not_ready(format!(
            "etcd secret {}/{} not found",
            namespace, secret_name
        ))),
    }
}

/// Etcd client URLs: the configured ones or the self-hosted default
pub fn etcd_endpoints(cluster: &CorralCluster, default_endpoint: &str) -> Vec<String> {
    match cluster.spec.etcd_config.as_ref() {
        Some(cfg) if !cfg.endpoints.is_empty() => cfg.endpoints.clone(),
        _ => vec![default_endpoint.to_string()],
    }
}

/// Flags pointing the etcd client at the mounted TLS material
pub fn etcd_ssl_args() -> Vec<String> {
    vec![
        format!("--etcd-ca={}/ca-file", ETCD_SSL_PATH),
        format!("--etcd-cert={}/cert-file", ETCD_SSL_PATH),
        format!("--etcd-key={}/key-file", ETCD_SSL_PATH),
    ]
}

/// Volume and mount exposing the etcd TLS Secret at [`ETCD_SSL_PATH`]
pub fn volume_by_etcd(secret: &Secret) -> (Volume, VolumeMount) {
    let volume = Volume {
        name: "etcdssl".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.name_any()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mount = VolumeMount {
        name: "etcdssl".to_string(),
        mount_path: ETCD_SSL_PATH.to_string(),
        ..Default::default()
    };
    (volume, mount)
}

/// Pull secrets for the component's pods
///
/// Priority components start before registry credentials exist and never
/// get them.
pub fn image_pull_secrets(
    component: &CorralComponent,
    cluster: &CorralCluster,
) -> Option<Vec<LocalObjectReference>> {
    if component.spec.priority_component {
        return None;
    }
    cluster.image_pull_secret().map(|name| {
        vec![LocalObjectReference {
            name: name.to_string(),
        }]
    })
}

/// Require scheduling onto one of `node_names`
///
/// Hostname labels are matched under both the upstream and the k3s key;
/// terms are ORed so either labelling works.
pub fn affinity_for_required_nodes(node_names: &[String]) -> Affinity {
    let term = |key: &str| NodeSelectorTerm {
        match_expressions: Some(vec![NodeSelectorRequirement {
            key: key.to_string(),
            operator: "In".to_string(),
            values: Some(node_names.to_vec()),
        }]),
        ..Default::default()
    };
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![term("kubernetes.io/hostname"), term("k3s.io/hostname")],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterApi;
    use crate::handler::testing;
    use corral_common::crd::{CorralClusterSpec, CorralClusterStatus, CorralComponentSpec, EtcdConfig};
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn db_secret() -> Secret {
        Secret {
            data: Some(BTreeMap::from([
                (MYSQL_USER_KEY.to_string(), ByteString(b"root".to_vec())),
                (MYSQL_PASSWORD_KEY.to_string(), ByteString(b"s3cret".to_vec())),
            ])),
            ..Default::default()
        }
    }

    fn cluster(spec: CorralClusterSpec) -> CorralCluster {
        let mut c = CorralCluster::new("corralcluster", spec);
        c.metadata.namespace = Some("corral-system".to_string());
        c
    }

    #[tokio::test]
    async fn test_explicit_database_wins() {
        let mut api = MockClusterApi::new();
        api.expect_get_secret().never();
        let ctx = testing::context(api);
        let custom = Database {
            host: "mysql.example".to_string(),
            port: 3307,
            ..Default::default()
        };

        let db = default_db_info(&ctx, Some(&custom), "region")
            .await
            .expect("explicit database should resolve");
        assert_eq!(db.host, "mysql.example");
        assert_eq!(db.name, "region");
    }

    /// Story: a self-hosted database is found through its credentials secret
    #[tokio::test]
    async fn story_self_hosted_database_from_secret() {
        let mut api = MockClusterApi::new();
        api.expect_get_secret()
            .withf(|ns, name| ns == "corral-system" && name == "corral-db")
            .returning(|_, _| Ok(Some(db_secret())));
        let ctx = testing::context(api);

        let db = default_db_info(&ctx, None, "region")
            .await
            .expect("self-hosted database should resolve");
        assert_eq!(
            db.region_data_source(),
            "--mysql=root:s3cret@tcp(corral-db:3306)/region"
        );
    }

    #[tokio::test]
    async fn test_missing_db_secret_is_not_ready() {
        let mut api = MockClusterApi::new();
        api.expect_get_secret().returning(|_, _| Ok(None));
        let ctx = testing::context(api);

        let err = default_db_info(&ctx, None, "region")
            .await
            .expect_err("missing secret should fail");
        assert!(err.is_ignorable());
    }

    #[tokio::test]
    async fn test_empty_database_name_is_fatal() {
        let ctx = testing::context(MockClusterApi::new());
        let err = default_db_info(&ctx, Some(&Database::default()), "")
            .await
            .expect_err("empty name should fail");
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_etcd_secret_optional_but_required_once_named() {
        let ctx = testing::context(MockClusterApi::new());
        let plain = cluster(CorralClusterSpec::default());
        assert!(etcd_secret(&ctx, &plain)
            .await
            .expect("unconfigured etcd should resolve")
            .is_none());

        let mut api = MockClusterApi::new();
        api.expect_get_secret().returning(|_, _| Ok(None));
        let ctx = testing::context(api);
        let tls = cluster(CorralClusterSpec {
            etcd_config: Some(EtcdConfig {
                endpoints: vec!["https://etcd:2379".to_string()],
                secret_name: Some("etcd-tls".to_string()),
            }),
            ..Default::default()
        });
        let err = etcd_secret(&ctx, &tls)
            .await
            .expect_err("named but missing secret should fail");
        assert!(err.is_ignorable());
        assert_eq!(etcd_endpoints(&tls, "http://corral-etcd:2379"), vec!["https://etcd:2379"]);
        assert_eq!(
            etcd_endpoints(&plain, "http://corral-etcd:2379"),
            vec!["http://corral-etcd:2379"]
        );
    }

    #[test]
    fn test_image_pull_secrets() {
        let mut c = cluster(CorralClusterSpec::default());
        let mut component = CorralComponent::new("corral-api", CorralComponentSpec::default());
        assert!(image_pull_secrets(&component, &c).is_none());

        c.status = Some(CorralClusterStatus {
            image_pull_secret: Some("hub-creds".to_string()),
            ..Default::default()
        });
        assert_eq!(
            image_pull_secrets(&component, &c).map(|s| s[0].name.clone()),
            Some("hub-creds".to_string())
        );

        component.spec.priority_component = true;
        assert!(image_pull_secrets(&component, &c).is_none());
    }

    #[test]
    fn test_affinity_matches_both_hostname_labels() {
        let affinity = affinity_for_required_nodes(&["node-1".to_string()]);
        let terms = affinity
            .node_affinity
            .and_then(|n| n.required_during_scheduling_ignored_during_execution)
            .map(|s| s.node_selector_terms)
            .expect("affinity should require nodes");
        let keys: Vec<String> = terms
            .iter()
            .flat_map(|t| t.match_expressions.clone().unwrap_or_default())
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["kubernetes.io/hostname", "k3s.io/hostname"]);
    }
}
