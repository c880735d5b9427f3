//! Sfyra - integration tests for Sidero bare-metal provisioning on Talos
//!
//! Sfyra stands up a throwaway Talos cluster in QEMU, installs Cluster API
//! and the Sidero infrastructure provider into it, boots a pool of empty VMs
//! over iPXE and checks that they register and become usable servers.
//!
//! # Modules
//!
//! - [`config`] - Harness settings and command line flags
//! - [`talos`] - talosctl-driven VM provisioning, cluster state, machine config
//! - [`bootstrap`] - Bootstrap cluster and PXE node pool lifecycle
//! - [`capi`] - Cluster API installation, Sidero patches, workload discovery
//! - [`crd`] - Sidero resources (Server, ServerClass, Environment)
//! - [`suite`] - The integration tests and their harness
//! - [`retry`] - Polling and backoff helpers
//! - [`error`] - Error types for the harness

#![warn(missing_docs)]

pub mod bootstrap;
pub mod capi;
pub mod command;
pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod net;
pub mod retry;
pub mod suite;
pub mod talos;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
