//! Corral operator: converges CorralComponent objects into running platform services
//! and keeps CorralVolume descriptors pointed at a storage class

#![deny(missing_docs)]

/// CorralComponent reconciliation
pub mod controller;
/// Controller wiring for the operator binary
pub mod controller_runner;
/// CorralVolume reconciliation
pub mod volume_controller;
