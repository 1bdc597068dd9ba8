//! PKI operations for component mTLS
//!
//! A trust domain has one self-signed RSA root that is effectively
//! permanent (~100 years). Leaf certificates are signed for a set of
//! addresses and carry both client and server authentication, so the
//! same issuance path serves the API server and the console client.
//!
//! The trust domain is closed and single-tenant; every certificate uses
//! the same fixed serial number and organization subject.

use std::net::IpAddr;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
    SerialNumber,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Validity of roots and leaves, in years
pub const VALIDITY_YEARS: i64 = 100;

/// Serial number stamped on every certificate of a trust domain
pub const FIXED_SERIAL: u64 = 2019;

/// Organization written into every subject
pub const ORGANIZATION: &str = "Corral, INC.";

// X.520 attribute OIDs rcgen has no named variant for
const OID_STREET_ADDRESS: [u64; 4] = [2, 5, 4, 9];
const OID_POSTAL_CODE: [u64; 4] = [2, 5, 4, 17];

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Compute (not_before, not_after) starting now
fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

/// The fixed organization subject
fn organization_subject() -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn.push(DnType::CountryName, DnValue::Utf8String("CN".to_string()));
    dn.push(
        DnType::StateOrProvinceName,
        DnValue::Utf8String("Beijing".to_string()),
    );
    dn.push(DnType::LocalityName, DnValue::Utf8String("Beijing".to_string()));
    dn.push(
        DnType::CustomDnType(OID_STREET_ADDRESS.to_vec()),
        DnValue::Utf8String("Beijing".to_string()),
    );
    dn.push(
        DnType::CustomDnType(OID_POSTAL_CODE.to_vec()),
        DnValue::Utf8String("000000".to_string()),
    );
    dn
}

/// Base parameters shared by roots and leaves
fn base_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = organization_subject();
    params.serial_number = Some(SerialNumber::from(FIXED_SERIAL));
    let (not_before, not_after) = compute_validity(VALIDITY_YEARS);
    params.not_before = not_before;
    params.not_after = not_after;
    params
}

fn generate_rsa_key(what: &str) -> Result<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256).map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate {} key: {}", what, e))
    })
}

/// Map an address to a SAN: literal IPs become IP SANs, the rest DNS names
fn san_for(address: &str) -> Result<SanType> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(address.to_string())
        .map(SanType::DnsName)
        .map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "invalid DNS name '{}': {}",
                address, e
            ))
        })
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// A signed leaf certificate and its private key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafCertificate {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key
    pub key_pem: String,
}

/// Root of a trust domain
#[derive(Clone)]
pub struct CertificateAuthority {
    /// Serialized key; `KeyPair` isn't `Clone`, so it is reloaded per signing
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed RSA root
    pub fn new() -> Result<Self> {
        let mut params = base_params();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let key_pair = generate_rsa_key("CA")?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a previously persisted root
    ///
    /// Fails when the key is not the one the certificate was issued for.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let der = parse_pem(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;
        if cert.public_key().raw != key_pair.subject_public_key_info().as_slice() {
            return Err(PkiError::ParseError(
                "CA key does not match the CA certificate".to_string(),
            ));
        }

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// PEM-encoded root certificate
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// PEM-encoded root private key
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Sign a leaf certificate covering `addresses`
    ///
    /// Each address becomes an IP SAN when it parses as one and a DNS SAN
    /// otherwise. The leaf authenticates both clients and servers.
    pub fn issue_leaf(&self, addresses: &[String]) -> Result<LeafCertificate> {
        let mut params = base_params();
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.subject_alt_names = addresses
            .iter()
            .map(|a| san_for(a))
            .collect::<Result<Vec<_>>>()?;

        let leaf_key = generate_rsa_key("leaf")?;
        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign leaf cert: {}", e))
        })?;

        Ok(LeafCertificate {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }
}

/// Fields of an issued certificate, as parsed back from PEM
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Serial number
    pub serial: u64,
    /// Subject organization
    pub organization: String,
    /// Whether the basic constraints mark a CA
    pub is_ca: bool,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// IP subject alternative names
    pub ip_addresses: Vec<IpAddr>,
    /// Key usage includes digitalSignature
    pub digital_signature: bool,
    /// Key usage includes keyCertSign
    pub key_cert_sign: bool,
    /// Extended key usage includes serverAuth
    pub server_auth: bool,
    /// Extended key usage includes clientAuth
    pub client_auth: bool,
    /// DER SubjectPublicKeyInfo
    pub public_key: Vec<u8>,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let organization = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .unwrap_or("")
            .to_string();

        let serial = cert
            .raw_serial()
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let (digital_signature, key_cert_sign) = match cert.key_usage() {
            Ok(Some(ku)) => (ku.value.digital_signature(), ku.value.key_cert_sign()),
            _ => (false, false),
        };
        let (server_auth, client_auth) = match cert.extended_key_usage() {
            Ok(Some(eku)) => (eku.value.server_auth, eku.value.client_auth),
            _ => (false, false),
        };

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            serial,
            organization,
            is_ca: cert.is_ca(),
            dns_names,
            ip_addresses,
            digital_signature,
            key_cert_sign,
            server_auth,
            client_auth,
            public_key: cert.public_key().raw.to_vec(),
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}
