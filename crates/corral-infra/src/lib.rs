//! Infrastructure primitives for corral
//!
//! - **PKI**: the long-lived RSA root of a trust domain and the leaf
//!   certificates it signs for servers and clients
//!
//! The crate is stateless. Persisting CA material is left to the caller
//! (corral stores it in Kubernetes Secrets).

pub mod pki;

pub use pki::{CertificateAuthority, CertificateInfo, LeafCertificate, PkiError};
