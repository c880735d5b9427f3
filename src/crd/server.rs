//! Server Custom Resource Definition
//!
//! A Server is registered by Sidero for every machine that PXE boots into the
//! agent environment. Its name is the machine's SMBIOS UUID.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Server
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metal.sidero.dev",
    version = "v1alpha1",
    kind = "Server",
    plural = "servers",
    status = "ServerStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Accepted","type":"boolean","jsonPath":".spec.accepted"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// CPU reported by the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuInformation>,

    /// SMBIOS system information reported by the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInformation>,

    /// Power management endpoint
    #[serde(
        default,
        rename = "managementApi",
        skip_serializing_if = "Option::is_none"
    )]
    pub management_api: Option<ManagementApi>,

    /// JSON patches applied to the generated Talos machine config
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_patches: Vec<ConfigPatch>,

    /// Whether the server may be allocated to clusters
    #[serde(default)]
    pub accepted: bool,
}

/// CPU manufacturer and version
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CpuInformation {
    /// e.g. `QEMU`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manufacturer: String,
    /// e.g. `pc-q35-4.2`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl CpuInformation {
    /// Create CPU information from manufacturer and version
    pub fn new(manufacturer: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            version: version.into(),
        }
    }
}

/// SMBIOS system information
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemInformation {
    /// System manufacturer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manufacturer: String,
    /// Product name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub product_name: String,
    /// Product version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Serial number
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial_number: String,
    /// SKU number
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sku_number: String,
    /// Product family
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub family: String,
}

/// Endpoint of the out-of-band power management API
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ManagementApi {
    /// `host:port` of the API
    pub endpoint: String,
}

/// One RFC 6902 operation against the Talos machine config
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConfigPatch {
    /// `add`, `replace`, `remove`, ...
    pub op: String,
    /// JSON pointer into the machine config
    pub path: String,
    /// Value for `add` / `replace`
    #[serde(default)]
    pub value: serde_json::Value,
}

impl ConfigPatch {
    /// `replace` operation at `path`
    pub fn replace(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            op: "replace".to_string(),
            path: path.into(),
            value,
        }
    }

    /// `add` operation at `path`
    pub fn add(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            op: "add".to_string(),
            path: path.into(),
            value,
        }
    }
}

/// Observed state of a Server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Server passed its power and wipe checks
    #[serde(default)]
    pub ready: bool,

    /// Server is allocated to a MetalMachine
    #[serde(default)]
    pub in_use: bool,

    /// Addresses reported for the server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<ServerAddress>,
}

/// Address type reported for in-cluster node addresses
pub const ADDRESS_INTERNAL_IP: &str = "InternalIP";

/// A typed address of a server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServerAddress {
    /// e.g. `InternalIP`, `Hostname`
    #[serde(rename = "type")]
    pub type_: String,
    /// The address itself
    pub address: String,
}

impl Server {
    /// Whether the server reports ready
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }

    /// Addresses of type `InternalIP`
    pub fn internal_ips(&self) -> Vec<String> {
        self.status
            .iter()
            .flat_map(|s| s.addresses.iter())
            .filter(|a| a.type_ == ADDRESS_INTERNAL_IP)
            .map(|a| a.address.clone())
            .collect()
    }
}
