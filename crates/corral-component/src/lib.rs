//! Component reconciliation for corral
//!
//! This crate owns everything between a `CorralComponent` object and the
//! cluster objects that run it:
//!
//! - [`handler`]: the phase protocol and capability probes
//! - [`client`]: the cluster API seam handlers talk through
//! - [`merge`]: merging generated container settings with user overrides
//! - [`storage`]: storage-class resolution from `CorralVolume` descriptors
//! - [`certs`]: the certificate authority behind component mTLS
//! - [`prerequisites`]: database, etcd and scheduling lookups
//! - [`components`]: the concrete handlers and their registry

#![deny(missing_docs)]

pub mod certs;
pub mod client;
pub mod components;
pub mod handler;
pub mod merge;
pub mod prerequisites;
pub mod storage;

pub use client::{ClusterApi, KubeClusterApi, ManagedResource};
pub use components::new_handler;
pub use handler::{ComponentContext, ComponentHandler};
pub use storage::PvcParameters;

/// Result type alias using the common error type
pub type Result<T> = std::result::Result<T, corral_common::Error>;
