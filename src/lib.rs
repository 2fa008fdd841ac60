//! Provisioning of test devices over SSH.
//!
//! A run installs a new OS image to the inactive slot of the device, updates
//! its firmware and downloadable content, reboots into the result and
//! verifies it. Every step that changes the device is a reversible
//! [`provision::Command`]; a failing step rolls back what its state already
//! did.
//!
//! The remote side is reached through [`remote::DutAdapter`], which also
//! survives the reboots the run induces. [`service::DutService`] exposes the
//! request-level operations (command execution, crash collection, restart,
//! cache download) on top of it.

pub mod config;
pub mod crash;
pub mod error;
pub mod lro;
pub mod provision;
pub mod remote;
pub mod service;

pub use error::{Error, ErrorKind, ProvisionError, Result};
