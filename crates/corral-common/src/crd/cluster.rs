//! CorralCluster CRD: the cluster-wide desired state

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, HasConditions};

/// How platform images reach the cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstallMode {
    /// Images come from a registry but an install package is still unpacked
    Online,
    /// Every image is pulled from the configured registry
    #[default]
    FullOnline,
    /// Images come from a locally loaded package
    Offline,
}

/// Private image registry used by platform components
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageHub {
    /// Registry host
    #[serde(default)]
    pub domain: String,
    /// Repository namespace within the registry
    #[serde(default)]
    pub namespace: String,
    /// Registry user
    #[serde(default)]
    pub username: String,
    /// Registry password
    #[serde(default)]
    pub password: String,
}

/// Connection information of a database
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    /// Database host
    #[serde(default)]
    pub host: String,
    /// Database port
    #[serde(default)]
    pub port: i32,
    /// Database user
    #[serde(default)]
    pub username: String,
    /// Database password
    #[serde(default)]
    pub password: String,
    /// Database (schema) name
    #[serde(default)]
    pub name: String,
}

impl Database {
    /// Render the `--mysql` flag the region services consume
    pub fn region_data_source(&self) -> String {
        format!(
            "--mysql={}:{}@tcp({}:{})/{}",
            self.username, self.password, self.host, self.port, self.name
        )
    }
}

/// Etcd client configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    /// Client URLs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
    /// Secret with TLS material for the etcd client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// A Kubernetes node selected for a platform role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct K8sNode {
    /// Node name
    #[serde(default)]
    pub name: String,
    /// Internal IP address
    #[serde(default, rename = "internalIP")]
    pub internal_ip: String,
    /// External IP address
    #[serde(default, rename = "externalIP")]
    pub external_ip: String,
}

/// Desired state of the platform installation
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "corral.dev",
    version = "v1alpha1",
    kind = "CorralCluster",
    plural = "corralclusters",
    shortname = "cc",
    namespaced,
    status = "CorralClusterStatus",
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.installMode"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CorralClusterSpec {
    /// Run platform components with multiple replicas
    #[serde(default, rename = "enableHA")]
    pub enable_ha: bool,

    /// Repository prefix of component images, e.g. docker.io/corral
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repository: Option<String>,

    /// Suffix of generated default domain names
    #[serde(default, rename = "suffixHTTPHost")]
    pub suffix_http_host: String,

    /// Ingress addresses of the gateway; node addresses are used when empty
    #[serde(default, rename = "gatewayIngressIPs", skip_serializing_if = "Vec::is_empty")]
    pub gateway_ingress_ips: Vec<String>,

    /// Nodes the gateway runs on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes_for_gateway: Vec<K8sNode>,

    /// Nodes the builder runs on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes_for_chaos: Vec<K8sNode>,

    /// Installation mode
    #[serde(default)]
    pub install_mode: InstallMode,

    /// Private registry replacing the default one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_hub: Option<ImageHub>,

    /// External region database; one is provisioned when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_database: Option<Database>,

    /// External console database; one is provisioned when absent
    #[serde(default, rename = "uiDatabase", skip_serializing_if = "Option::is_none")]
    pub ui_database: Option<Database>,

    /// External etcd; one is provisioned when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_config: Option<EtcdConfig>,

    /// Platform version, usually the image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_version: Option<String>,

    /// Set once the installer has filled in the whole spec
    #[serde(default)]
    pub config_completed: bool,
}

/// Observed state of the platform installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorralClusterStatus {
    /// Secret used to pull images from `imageHub`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,

    /// Cluster conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for CorralClusterStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

impl CorralCluster {
    /// All gateway ingress addresses
    ///
    /// Explicit addresses win when the first one is set; otherwise the
    /// internal addresses of the gateway nodes are used.
    pub fn gateway_ingress_ips(&self) -> Vec<String> {
        match self.spec.gateway_ingress_ips.first() {
            Some(first) if !first.is_empty() => self.spec.gateway_ingress_ips.clone(),
            _ => self
                .spec
                .nodes_for_gateway
                .iter()
                .map(|n| n.internal_ip.clone())
                .collect(),
        }
    }

    /// The primary gateway ingress address, if any
    pub fn gateway_ingress_ip(&self) -> Option<String> {
        self.gateway_ingress_ips()
            .into_iter()
            .find(|ip| !ip.is_empty())
    }

    /// Name of the image pull secret the installer created, if any
    pub fn image_pull_secret(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.image_pull_secret.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(ips: Vec<&str>, nodes: Vec<&str>) -> CorralCluster {
        CorralCluster::new(
            "corralcluster",
            CorralClusterSpec {
                gateway_ingress_ips: ips.into_iter().map(String::from).collect(),
                nodes_for_gateway: nodes
                    .into_iter()
                    .enumerate()
                    .map(|(i, ip)| K8sNode {
                        name: format!("node-{i}"),
                        internal_ip: ip.to_string(),
                        external_ip: String::new(),
                    })
                    .collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_explicit_gateway_ips_win() {
        let c = cluster(vec!["1.2.3.4", "5.6.7.8"], vec!["10.0.0.1"]);
        assert_eq!(c.gateway_ingress_ips(), vec!["1.2.3.4", "5.6.7.8"]);
        assert_eq!(c.gateway_ingress_ip().as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_empty_first_ip_falls_back_to_nodes() {
        let c = cluster(vec![""], vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(c.gateway_ingress_ips(), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_no_gateway_addresses() {
        let c = cluster(vec![], vec![]);
        assert!(c.gateway_ingress_ips().is_empty());
        assert!(c.gateway_ingress_ip().is_none());
    }

    #[test]
    fn test_region_data_source() {
        let db = Database {
            host: "corral-db".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: "secret".to_string(),
            name: "region".to_string(),
        };
        assert_eq!(
            db.region_data_source(),
            "--mysql=root:secret@tcp(corral-db:3306)/region"
        );
    }

    #[test]
    fn test_spec_uses_wire_field_names() {
        let c = cluster(vec!["1.2.3.4"], vec![]);
        let json = serde_json::to_value(&c.spec).expect("serialization should succeed");
        assert!(json.get("gatewayIngressIPs").is_some());
        assert!(json.get("enableHA").is_some());
        assert!(json.get("suffixHTTPHost").is_some());
    }
}
