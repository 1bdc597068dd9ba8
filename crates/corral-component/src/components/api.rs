//! corral-api: the region API server
//!
//! Serves plain HTTP inside the cluster and mTLS towards the console. Its
//! certificates come from the `corral-api` trust domain, signed for the
//! gateway ingress addresses.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaimVolumeSource, Pod,
    Probe, HTTPGetAction, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    Ingress, IngressBackend, IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use serde_json::json;
use tracing::{debug, info, warn};

use corral_common::crd::{AccessMode, CorralCluster, CorralComponent, Database};
use corral_common::{Error, OperatorConfig};

use super::{
    component_namespace, list_pods_by_labels, merged_container, metadata, pod_template, service,
    ContainerDefaults,
};
use crate::certs::{
    ensure_certificate_authority, CertBundle, CertOutcome, TrustDomain, CA_CERT_KEY,
    SERVER_CERT_KEY, SERVER_KEY_KEY,
};
use crate::client::ManagedResource;
use crate::handler::{
    ComponentContext, ComponentHandler, CreateIfNotExists, StorageClassRwo, StorageClassRwx,
};
use crate::prerequisites::{
    default_db_info, etcd_endpoints, etcd_secret, etcd_ssl_args, volume_by_etcd,
};
use crate::storage::{persistent_volume_claim, PvcParameters};
use crate::Result;

/// Component name
pub const API_NAME: &str = "corral-api";
/// Hostname of the TLS service, always present in leaf SANs
const API_TLS_HOSTNAME: &str = "corral-api-api";
/// Schema the region API uses when none is configured
const REGION_DATABASE_NAME: &str = "region";
/// Claim shared by platform components
const GRDATA_CLAIM: &str = "grdata";
/// Where the server Secret is mounted
const SSL_MOUNT_PATH: &str = "/etc/corral/region/ssl";

const HTTPS_PORT: i32 = 8443;
const WEBSOCKET_PORT: i32 = 6060;
const INNER_PORT: i32 = 8888;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) struct Api {
    component: Arc<CorralComponent>,
    cluster: Arc<CorralCluster>,
    labels: BTreeMap<String, String>,
    embedded_database: bool,
    etcd_default_endpoint: String,
    data_storage_gib: i64,
    grdata_storage_gib: i64,
    db: Option<Database>,
    etcd_secret: Option<Secret>,
    pvc: Option<PvcParameters>,
    certs: Option<CertOutcome>,
}

impl Api {
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
            embedded_database: config.embedded_database,
            etcd_default_endpoint: config.etcd_default_endpoint.clone(),
            data_storage_gib: config.api_data_storage_gib,
            grdata_storage_gib: config.grdata_storage_gib,
            db: None,
            etcd_secret: None,
            pvc: None,
            certs: None,
        }
    }

    fn access_mode(&self) -> AccessMode {
        if self.component.wants_rwo_claims() {
            AccessMode::ReadWriteOnce
        } else {
            AccessMode::ReadWriteMany
        }
    }

    fn pvc(&self) -> Result<&PvcParameters> {
        self.pvc.as_ref().ok_or_else(|| {
            Error::internal_with_context(API_NAME, "storage class was not resolved before rendering")
        })
    }

    fn bundle(&self) -> Option<&CertBundle> {
        self.certs.as_ref().map(|c| &c.bundle)
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--api-addr=0.0.0.0:{}", INNER_PORT),
            "--enable-feature=privileged".to_string(),
            format!(
                "--etcd={}",
                etcd_endpoints(&self.cluster, &self.etcd_default_endpoint).join(",")
            ),
        ];
        if let Some(db) = &self.db {
            args.push(db.region_data_source());
        }
        if self.etcd_secret.is_some() {
            args.extend(etcd_ssl_args());
        }
        if self.bundle().is_some() {
            args.extend([
                "--api-ssl-enable=true".to_string(),
                format!("--api-addr-ssl=0.0.0.0:{}", HTTPS_PORT),
                format!("--api-ssl-certfile={}/{}", SSL_MOUNT_PATH, SERVER_CERT_KEY),
                format!("--api-ssl-keyfile={}/{}", SSL_MOUNT_PATH, SERVER_KEY_KEY),
                format!("--client-ca-file={}/{}", SSL_MOUNT_PATH, CA_CERT_KEY),
            ]);
        }
        args
    }

    fn envs(&self) -> Vec<EnvVar> {
        let value = |name: &str, value: &str| EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        };
        vec![
            EnvVar {
                name: "POD_IP".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "status.podIP".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            value("EX_DOMAIN", &self.cluster.spec.suffix_http_host),
            value("SERVICE_ID", API_NAME),
            value("LOGGER_DRIVER_NAME", "streamlog"),
        ]
    }

    fn deployment(&self) -> Deployment {
        let claim = |name: &str, claim_name: &str, path: &str| {
            (
                Volume {
                    name: name.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim_name.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VolumeMount {
                    name: name.to_string(),
                    mount_path: path.to_string(),
                    ..Default::default()
                },
            )
        };
        let (grdata, grdata_mount) = claim("grdata", GRDATA_CLAIM, "/grdata");
        let (data, data_mount) = claim("accesslog", API_NAME, "/logs");
        let mut volumes = vec![grdata, data];
        let mut volume_mounts = vec![grdata_mount, data_mount];

        if let Some(secret) = &self.etcd_secret {
            let (volume, mount) = volume_by_etcd(secret);
            volumes.push(volume);
            volume_mounts.push(mount);
        }
        if self.bundle().is_some() {
            volumes.push(Volume {
                name: "region-api-ssl".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.domain().server_secret_name()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: "region-api-ssl".to_string(),
                mount_path: SSL_MOUNT_PATH.to_string(),
                ..Default::default()
            });
        }

        let (mut container, volumes) = merged_container(
            &self.component,
            API_NAME,
            ContainerDefaults {
                args: self.args(),
                env: self.envs(),
                volume_mounts,
                volumes,
                resources: None,
            },
        );
        container.readiness_probe = Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/v2/health".to_string()),
                port: IntOrString::Int(INNER_PORT),
                ..Default::default()
            }),
            ..Default::default()
        });

        Deployment {
            metadata: metadata(&self.component, API_NAME, &self.labels),
            spec: Some(DeploymentSpec {
                replicas: self.component.spec.replicas,
                selector: LabelSelector {
                    match_labels: Some(self.labels.clone()),
                    ..Default::default()
                },
                template: pod_template(
                    &self.component,
                    &self.cluster,
                    &self.labels,
                    container,
                    volumes,
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ingress(&self, name: &str, service_name: &str, port_name: &str, port: i32) -> Ingress {
        let mut meta = metadata(&self.component, name, &self.labels);
        meta.annotations = Some(BTreeMap::from([
            ("nginx.ingress.kubernetes.io/l4-enable".to_string(), "true".to_string()),
            ("nginx.ingress.kubernetes.io/l4-host".to_string(), "0.0.0.0".to_string()),
            ("nginx.ingress.kubernetes.io/l4-port".to_string(), port.to_string()),
        ]));
        Ingress {
            metadata: meta,
            spec: Some(IngressSpec {
                default_backend: Some(IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service_name.to_string(),
                        port: Some(ServiceBackendPort {
                            name: Some(port_name.to_string()),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Addresses the console reaches the API on
    fn region_config(&self, bundle: &CertBundle) -> ConfigMap {
        let gateway = self.cluster.gateway_ingress_ip().unwrap_or_default();
        ConfigMap {
            metadata: metadata(&self.component, "region-config", &self.labels),
            data: Some(BTreeMap::from([
                ("apiAddress".to_string(), format!("https://{}:{}", gateway, HTTPS_PORT)),
                ("websocketAddress".to_string(), format!("ws://{}:{}", gateway, WEBSOCKET_PORT)),
                ("defaultDomainSuffix".to_string(), self.cluster.spec.suffix_http_host.clone()),
                ("defaultTCPHost".to_string(), gateway),
            ])),
            binary_data: Some(BTreeMap::from([
                ("client.pem".to_string(), ByteString(bundle.client_cert.clone().into_bytes())),
                ("client.key.pem".to_string(), ByteString(bundle.client_key.clone().into_bytes())),
                ("ca.pem".to_string(), ByteString(bundle.ca_pem.clone().into_bytes())),
            ])),
            ..Default::default()
        }
    }

    fn domain(&self) -> TrustDomain {
        TrustDomain::new(API_NAME, API_TLS_HOSTNAME)
    }
}

/// Body registering this region with the console
pub(super) fn region_info(
    cluster: &CorralCluster,
    config: &OperatorConfig,
    bundle: &CertBundle,
    now: i64,
) -> serde_json::Value {
    let gateway = cluster.gateway_ingress_ip().unwrap_or_default();
    let region_type = match config.cloud_server.as_deref() {
        Some(cloud @ ("aliyun" | "huawei" | "tencent")) => cloud,
        _ => "custom",
    };
    let mut info = json!({
        "regionName": now,
        "regionType": [region_type],
        "sslCaCert": bundle.ca_pem,
        "keyFile": bundle.client_key,
        "certFile": bundle.client_cert,
        "url": format!("https://{}:{}", gateway, HTTPS_PORT),
        "wsUrl": format!("ws://{}:{}", gateway, WEBSOCKET_PORT),
        "httpDomain": cluster.spec.suffix_http_host,
        "tcpDomain": gateway,
        "desc": "Helm",
        "regionAlias": "corral",
        "provider": "helm",
        "providerClusterId": "",
    });
    if let Some(token) = config.helm_token.as_deref().filter(|t| !t.is_empty()) {
        info["token"] = json!(token);
    }
    if let Some(id) = config.enterprise_id.as_deref().filter(|t| !t.is_empty()) {
        info["enterpriseId"] = json!(id);
    }
    info
}

async fn register_region(url: &str, body: &serde_json::Value) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(REGISTRATION_TIMEOUT)
        .build()
        .map_err(|e| Error::internal_with_context("register_region", e.to_string()))?;
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| Error::internal_with_context("register_region", e.to_string()))?;
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    debug!(%status, body = %text, "Region registration response");
    if !status.is_success() {
        return Err(Error::internal_with_context(
            "register_region",
            format!("console returned {}", status),
        ));
    }
    Ok(())
}

#[async_trait]
impl ComponentHandler for Api {
    async fn before(&mut self, ctx: &ComponentContext) -> Result<()> {
        if !self.embedded_database {
            self.db = Some(
                default_db_info(
                    ctx,
                    self.cluster.spec.region_database.as_ref(),
                    REGION_DATABASE_NAME,
                )
                .await?,
            );
        }
        self.etcd_secret = etcd_secret(ctx, &self.cluster).await?;
        self.certs = ensure_certificate_authority(
            ctx,
            &self.domain(),
            &self.cluster.gateway_ingress_ips(),
            &self.labels,
        )
        .await?;
        Ok(())
    }

    fn resources(&self) -> Result<Vec<ManagedResource>> {
        let mut resources = Vec::new();
        if let Some(certs) = &self.certs {
            resources.extend(certs.resources.iter().cloned());
            resources.push(ManagedResource::from_typed(&self.region_config(&certs.bundle))?);
        }
        resources.push(ManagedResource::from_typed(&self.deployment())?);
        for svc in [
            service(&self.component, "corral-api-api", &self.labels, "https", HTTPS_PORT),
            service(&self.component, "corral-api-websocket", &self.labels, "ws", WEBSOCKET_PORT),
            service(&self.component, "corral-api-inner", &self.labels, "http", INNER_PORT),
        ] {
            resources.push(ManagedResource::from_typed(&svc)?);
        }
        resources.push(ManagedResource::from_typed(&self.ingress(
            API_NAME,
            "corral-api-api",
            "https",
            HTTPS_PORT,
        ))?);
        resources.push(ManagedResource::from_typed(&self.ingress(
            "corral-api-websocket",
            "corral-api-websocket",
            "ws",
            WEBSOCKET_PORT,
        ))?);
        Ok(resources)
    }

    async fn after(&self, ctx: &ComponentContext) -> Result<()> {
        let Some(url) = ctx.config.console_domain.as_deref().filter(|u| !u.is_empty()) else {
            debug!("No console configured, skipping region registration");
            return Ok(());
        };
        // failures are retried by the next pass
        let Some(certs) = &self.certs else {
            return Ok(());
        };

        let body = region_info(
            &self.cluster,
            &ctx.config,
            &certs.bundle,
            chrono::Utc::now().timestamp(),
        );
        match ctx.guard(register_region(url, &body)).await {
            Ok(()) => info!(url, "Registered region with console"),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!(url, error = %e, "Region registration failed"),
        }
        Ok(())
    }

    async fn list_pods(&self, ctx: &ComponentContext) -> Result<Vec<Pod>> {
        list_pods_by_labels(ctx, &self.component, &self.labels).await
    }

    fn as_create_if_not_exists(&self) -> Option<&dyn CreateIfNotExists> {
        Some(self)
    }

    fn as_storage_rwx_mut(&mut self) -> Option<&mut dyn StorageClassRwx> {
        match self.access_mode() {
            AccessMode::ReadWriteMany => Some(self),
            AccessMode::ReadWriteOnce => None,
        }
    }

    // single-writer claims still fall back to shared storage when absent
    fn as_storage_rwo_mut(&mut self) -> Option<&mut dyn StorageClassRwo> {
        match self.access_mode() {
            AccessMode::ReadWriteOnce => Some(self),
            AccessMode::ReadWriteMany => None,
        }
    }
}

impl CreateIfNotExists for Api {
    fn resources_create_if_not_exists(&self) -> Result<Vec<ManagedResource>> {
        let params = self.pvc()?;
        let namespace = component_namespace(&self.component);
        let mode = self.access_mode();
        [
            (GRDATA_CLAIM, self.grdata_storage_gib),
            (API_NAME, self.data_storage_gib),
        ]
        .into_iter()
        .map(|(name, size)| {
            ManagedResource::from_typed(&persistent_volume_claim(
                &namespace,
                name,
                mode,
                params,
                &self.labels,
                size,
            ))
        })
        .collect()
    }
}

impl StorageClassRwx for Api {
    fn set_storage_class_name_rwx(&mut self, params: PvcParameters) {
        self.pvc = Some(params);
    }
}

impl StorageClassRwo for Api {
    fn set_storage_class_name_rwo(&mut self, params: PvcParameters) {
        self.pvc = Some(params);
    }
}
