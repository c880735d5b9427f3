//! Sidero Custom Resource Definitions (`metal.sidero.dev/v1alpha1`)
//!
//! Only the fields the harness reads or writes are modelled; everything else
//! the controllers store is ignored on deserialization.

mod environment;
mod server;
mod server_class;

pub use environment::{
    AssetCondition, Environment, EnvironmentSpec, EnvironmentStatus, Initrd, Kernel,
};
pub use server::{
    ConfigPatch, CpuInformation, ManagementApi, Server, ServerAddress, ServerSpec, ServerStatus,
    SystemInformation, ADDRESS_INTERNAL_IP,
};
pub use server_class::{Qualifiers, ServerClass, ServerClassSpec, ServerClassStatus};

/// API version shared by all Sidero resources
pub const SIDERO_API_VERSION: &str = "metal.sidero.dev/v1alpha1";
