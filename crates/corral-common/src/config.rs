//! Operator configuration
//!
//! Everything the reconcilers read from the process environment is
//! collected here once, at startup, and handed to controllers as an
//! explicit value. Nothing downstream reads environment variables.

use std::time::Duration;

use clap::Args;

/// Runtime configuration threaded through every reconciliation pass
#[derive(Args, Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Namespace the platform components live in
    #[arg(long, env = "CORRAL_NAMESPACE", default_value = crate::CORRAL_SYSTEM_NAMESPACE)]
    pub namespace: String,

    /// Console endpoint that receives region registration after the API is up
    #[arg(long, env = "CONSOLE_DOMAIN")]
    pub console_domain: Option<String>,

    /// Token sent along with region registration
    #[arg(long, env = "HELM_TOKEN")]
    pub helm_token: Option<String>,

    /// Enterprise the region is registered under
    #[arg(long, env = "ENTERPRISE_ID")]
    pub enterprise_id: Option<String>,

    /// Cloud vendor hint used as the region type (aliyun, huawei, tencent)
    #[arg(long, env = "CLOUD_SERVER")]
    pub cloud_server: Option<String>,

    /// Use the embedded database instead of MySQL for the API
    #[arg(long, env = "CORRAL_EMBEDDED_DB", default_value_t = false)]
    pub embedded_database: bool,

    /// Secret holding credentials of the self-hosted database
    #[arg(long, env = "CORRAL_DB_SECRET", default_value = "corral-db")]
    pub db_secret_name: String,

    /// Etcd endpoint used when the cluster does not name one
    #[arg(long, env = "CORRAL_ETCD_ENDPOINT", default_value = "http://corral-etcd:2379")]
    pub etcd_default_endpoint: String,

    /// Size in GiB of the API data claim
    #[arg(long, env = "API_DATA_STORAGE_REQUEST", default_value_t = 1)]
    pub api_data_storage_gib: i64,

    /// Size in GiB of the shared data claim
    #[arg(long, env = "GRDATA_STORAGE_REQUEST", default_value_t = 40)]
    pub grdata_storage_gib: i64,

    /// Size in GiB of database and etcd claims
    #[arg(long, env = "DB_STORAGE_REQUEST", default_value_t = 20)]
    pub db_storage_gib: i64,

    /// Seconds to wait before retrying a pass blocked on a dependency
    #[arg(long, env = "CORRAL_REQUEUE_SECONDS", default_value_t = 3)]
    pub requeue_seconds: u64,
}

impl OperatorConfig {
    /// Short requeue interval for passes waiting on dependencies
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: crate::CORRAL_SYSTEM_NAMESPACE.to_string(),
            console_domain: None,
            helm_token: None,
            enterprise_id: None,
            cloud_server: None,
            embedded_database: false,
            db_secret_name: "corral-db".to_string(),
            etcd_default_endpoint: "http://corral-etcd:2379".to_string(),
            api_data_storage_gib: 1,
            grdata_storage_gib: 40,
            db_storage_gib: 20,
            requeue_seconds: 3,
        }
    }
}
