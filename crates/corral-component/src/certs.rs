//! Certificate authority management for component mTLS
//!
//! A trust domain persists three Secrets in the component namespace:
//!
//! - `<name>-ca-cert`: the root (`ca.crt`, `ca.key`)
//! - `<name>-server-cert`: the server leaf (`server.crt`, `server.key`, `ca.crt`)
//! - `<name>-client-cert`: the client leaf (`client.crt`, `client.key`, `ca.crt`)
//!
//! The server Secret is labelled with a fingerprint of the address set the
//! leaves were signed for. While the fingerprint matches, the persisted
//! material is returned untouched and nothing is written. When it drifts,
//! both leaves are reissued from the persisted root; the root itself is
//! never rotated.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::{debug, info, warn};

use corral_common::kube_utils::deterministic_hash;
use corral_common::LABEL_ADDRESS_FINGERPRINT;
use corral_infra::pki::{CertificateAuthority, LeafCertificate};

use crate::client::ManagedResource;
use crate::handler::ComponentContext;
use crate::Result;

/// Secret key holding the root certificate
pub const CA_CERT_KEY: &str = "ca.crt";
/// Secret key holding the root private key
pub const CA_KEY_KEY: &str = "ca.key";
/// Secret key holding the server certificate
pub const SERVER_CERT_KEY: &str = "server.crt";
/// Secret key holding the server private key
pub const SERVER_KEY_KEY: &str = "server.key";
/// Secret key holding the client certificate
pub const CLIENT_CERT_KEY: &str = "client.crt";
/// Secret key holding the client private key
pub const CLIENT_KEY_KEY: &str = "client.key";

/// A named set of Secrets sharing one root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustDomain {
    /// Prefix of the Secret names
    pub name: String,
    /// In-cluster service hostname always present in leaf SANs
    pub hostname: String,
}

impl TrustDomain {
    /// Create a trust domain
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
        }
    }

    /// Name of the Secret holding the root
    pub fn ca_secret_name(&self) -> String {
        format!("{}-ca-cert", self.name)
    }

    /// Name of the Secret holding the server leaf
    pub fn server_secret_name(&self) -> String {
        format!("{}-server-cert", self.name)
    }

    /// Name of the Secret holding the client leaf
    pub fn client_secret_name(&self) -> String {
        format!("{}-client-cert", self.name)
    }

    /// SANs for a leaf: the addresses followed by the service hostname
    fn leaf_addresses(&self, addresses: &[String]) -> Vec<String> {
        let mut sans: Vec<String> = normalized(addresses).into_iter().collect();
        if !sans.contains(&self.hostname) {
            sans.push(self.hostname.clone());
        }
        sans
    }
}

/// PEM material served by a trust domain
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertBundle {
    /// Root certificate
    pub ca_pem: String,
    /// Server certificate
    pub server_cert: String,
    /// Server private key
    pub server_key: String,
    /// Client certificate
    pub client_cert: String,
    /// Client private key
    pub client_key: String,
}

/// Result of one certificate pass
#[derive(Clone, Debug)]
pub struct CertOutcome {
    /// Material to mount and publish
    pub bundle: CertBundle,
    /// Whether leaves were signed during this pass
    pub reissued: bool,
    /// Secrets to persist; empty when nothing changed
    pub resources: Vec<ManagedResource>,
}

fn normalized(addresses: &[String]) -> BTreeSet<String> {
    addresses
        .iter()
        .filter(|a| !a.is_empty())
        .cloned()
        .collect()
}

/// Stable fingerprint of an address set and hostname
///
/// Order and duplicates in `addresses` do not affect the result.
pub fn address_fingerprint(addresses: &[String], hostname: &str) -> String {
    let joined = normalized(addresses)
        .into_iter()
        .collect::<Vec<_>>()
        .join(",");
    deterministic_hash(&format!("{}|{}", joined, hostname))
}

fn data_string(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|b| String::from_utf8(b.0.clone()).ok())
}

/// Rebuild a bundle from persisted Secrets when they carry `fingerprint`
fn persisted_bundle(server: &Secret, client: &Secret, fingerprint: &str) -> Option<CertBundle> {
    let labelled = server
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_ADDRESS_FINGERPRINT));
    if labelled.map(String::as_str) != Some(fingerprint) {
        return None;
    }
    Some(CertBundle {
        ca_pem: data_string(server, CA_CERT_KEY)?,
        server_cert: data_string(server, SERVER_CERT_KEY)?,
        server_key: data_string(server, SERVER_KEY_KEY)?,
        client_cert: data_string(client, CLIENT_CERT_KEY)?,
        client_key: data_string(client, CLIENT_KEY_KEY)?,
    })
}

fn secret(
    name: String,
    namespace: &str,
    labels: BTreeMap<String, String>,
    entries: &[(&str, &str)],
) -> Secret {
    let data = entries
        .iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect();
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Load the persisted root, or create one
///
/// Returns the authority and whether it was created in this call.
async fn load_or_create_ca(
    ctx: &ComponentContext,
    domain: &TrustDomain,
) -> Result<Option<(CertificateAuthority, bool)>> {
    let ca_secret = ctx
        .get_secret(ctx.namespace(), &domain.ca_secret_name())
        .await?;

    if let Some(ca_secret) = ca_secret {
        let (Some(cert), Some(key)) = (
            data_string(&ca_secret, CA_CERT_KEY),
            data_string(&ca_secret, CA_KEY_KEY),
        ) else {
            warn!(domain = %domain.name, "CA secret is missing its key pair, skipping certificates");
            return Ok(None);
        };
        return match CertificateAuthority::from_pem(&cert, &key) {
            Ok(ca) => Ok(Some((ca, false))),
            Err(e) => {
                warn!(domain = %domain.name, error = %e, "Failed to parse persisted CA, skipping certificates");
                Ok(None)
            }
        };
    }

    match CertificateAuthority::new() {
        Ok(ca) => {
            info!(domain = %domain.name, "Created certificate authority");
            Ok(Some((ca, true)))
        }
        Err(e) => {
            warn!(domain = %domain.name, error = %e, "Failed to create CA, skipping certificates");
            Ok(None)
        }
    }
}

fn issue(
    ca: &CertificateAuthority,
    sans: &[String],
    domain: &TrustDomain,
    role: &str,
) -> Option<LeafCertificate> {
    match ca.issue_leaf(sans) {
        Ok(leaf) => Some(leaf),
        Err(e) => {
            warn!(domain = %domain.name, role, error = %e, "Failed to issue leaf certificate");
            None
        }
    }
}

/// Ensure the trust domain serves leaves for `addresses`
///
/// `labels` are stamped on every Secret written. Returns `Ok(None)` when
/// certificate generation fails; the failure is logged and the caller
/// proceeds without TLS for this pass. Cluster API errors propagate.
pub async fn ensure_certificate_authority(
    ctx: &ComponentContext,
    domain: &TrustDomain,
    addresses: &[String],
    labels: &BTreeMap<String, String>,
) -> Result<Option<CertOutcome>> {
    let namespace = ctx.namespace();
    let fingerprint = address_fingerprint(addresses, &domain.hostname);

    let server = ctx
        .get_secret(namespace, &domain.server_secret_name())
        .await?;
    let client = ctx
        .get_secret(namespace, &domain.client_secret_name())
        .await?;
    if let (Some(server), Some(client)) = (&server, &client) {
        if let Some(bundle) = persisted_bundle(server, client, &fingerprint) {
            debug!(domain = %domain.name, fingerprint = %fingerprint, "Certificates match address set");
            return Ok(Some(CertOutcome {
                bundle,
                reissued: false,
                resources: Vec::new(),
            }));
        }
    }

    let Some((ca, created)) = load_or_create_ca(ctx, domain).await? else {
        return Ok(None);
    };

    let sans = domain.leaf_addresses(addresses);
    let Some(server_leaf) = issue(&ca, &sans, domain, "server") else {
        return Ok(None);
    };
    let Some(client_leaf) = issue(&ca, &sans, domain, "client") else {
        return Ok(None);
    };

    let mut resources = Vec::with_capacity(3);
    if created {
        resources.push(ManagedResource::from_typed(&secret(
            domain.ca_secret_name(),
            namespace,
            labels.clone(),
            &[
                (CA_CERT_KEY, ca.ca_cert_pem()),
                (CA_KEY_KEY, ca.ca_key_pem()),
            ],
        ))?);
    }

    let mut server_labels = labels.clone();
    server_labels.insert(LABEL_ADDRESS_FINGERPRINT.to_string(), fingerprint.clone());
    resources.push(ManagedResource::from_typed(&secret(
        domain.server_secret_name(),
        namespace,
        server_labels,
        &[
            (SERVER_CERT_KEY, &server_leaf.cert_pem),
            (SERVER_KEY_KEY, &server_leaf.key_pem),
            (CA_CERT_KEY, ca.ca_cert_pem()),
        ],
    ))?);
    resources.push(ManagedResource::from_typed(&secret(
        domain.client_secret_name(),
        namespace,
        labels.clone(),
        &[
            (CLIENT_CERT_KEY, &client_leaf.cert_pem),
            (CLIENT_KEY_KEY, &client_leaf.key_pem),
            (CA_CERT_KEY, ca.ca_cert_pem()),
        ],
    ))?);

    info!(
        domain = %domain.name,
        fingerprint = %fingerprint,
        new_ca = created,
        "Issued leaf certificates"
    );

    Ok(Some(CertOutcome {
        bundle: CertBundle {
            ca_pem: ca.ca_cert_pem().to_string(),
            server_cert: server_leaf.cert_pem,
            server_key: server_leaf.key_pem,
            client_cert: client_leaf.cert_pem,
            client_key: client_leaf.key_pem,
        },
        reissued: true,
        resources,
    }))
}
