//! ServerClass Custom Resource Definition
//!
//! A ServerClass groups Servers by hardware qualifiers; Sidero keeps the
//! list of matching, unallocated servers in `status.serversAvailable`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::server::{ConfigPatch, CpuInformation, SystemInformation};

/// Specification for a ServerClass
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metal.sidero.dev",
    version = "v1alpha1",
    kind = "ServerClass",
    plural = "serverclasses",
    status = "ServerClassStatus",
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ServerClassSpec {
    /// Hardware a server must match to belong to the class
    #[serde(default)]
    pub qualifiers: Qualifiers,

    /// Patches applied to machine configs of servers in the class
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_patches: Vec<ConfigPatch>,
}

/// Qualifiers are ORed within a list
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Qualifiers {
    /// CPU qualifiers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu: Vec<CpuInformation>,

    /// SMBIOS system qualifiers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_information: Vec<SystemInformation>,

    /// Server label selectors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_selectors: Vec<BTreeMap<String, String>>,
}

/// Observed state of a ServerClass
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerClassStatus {
    /// Matching servers not yet allocated
    #[serde(default)]
    pub servers_available: Vec<String>,

    /// Matching servers allocated to machines
    #[serde(default)]
    pub servers_in_use: Vec<String>,
}

impl ServerClass {
    /// Names of the available servers, empty before the first reconcile
    pub fn servers_available(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.servers_available.as_slice())
            .unwrap_or_default()
    }
}
