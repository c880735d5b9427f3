//! Cluster state recorded by the qemu provisioner
//!
//! `talosctl cluster create` writes `<state-dir>/<name>/state.yaml` describing
//! the network and VMs it started. Field names in that file are the
//! lower-cased Go field names; older and newer Talos releases differ slightly
//! (`gatewayaddr` vs `gatewayaddrs`, `privateip` vs `ips`), both are accepted.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use uuid::Uuid;

use crate::Error;

/// Name of the state file inside a cluster's state directory
pub const STATE_FILE: &str = "state.yaml";

/// Path of the state file for cluster `name`
pub fn state_file(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join(name).join(STATE_FILE)
}

/// Provisioned cluster as recorded in the state file
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterInfo {
    /// Cluster name
    pub name: String,
    /// Bridge network
    pub network: NetworkInfo,
    /// Nodes that run Talos from the provisioner's kernel
    pub nodes: Vec<NodeInfo>,
    /// Extra VMs attached to the network (e.g. PXE booted)
    pub extra_nodes: Vec<NodeInfo>,
}

/// Bridge network of a cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkInfo {
    /// Bridge name
    pub name: String,
    /// Gateway (bridge) address
    pub gateway: Option<IpAddr>,
    /// Link MTU
    pub mtu: u32,
}

/// A single VM
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeInfo {
    /// Provisioner-internal id
    pub id: String,
    /// Node name, e.g. `sfyra-controlplane-1`
    pub name: String,
    /// SMBIOS UUID, used by Sidero as the Server name
    pub uuid: Option<Uuid>,
    /// Addresses on the bridge network
    pub ips: Vec<IpAddr>,
    /// Port of the VM's power management API on the gateway
    pub api_port: u16,
}

impl NodeInfo {
    /// First address of the node
    pub fn primary_ip(&self) -> Option<IpAddr> {
        self.ips.first().copied()
    }
}

impl ClusterInfo {
    /// Parse a state file's contents
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let state: RawState = serde_yaml::from_str(contents)?;
        Ok(state.clusterinfo.into())
    }

    /// Read `<state_dir>/<name>/state.yaml`
    pub async fn load(state_dir: &Path, name: &str) -> Result<Self, Error> {
        let path = state_file(state_dir, name);
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::provision(format!(
                "failed to read cluster state {}: {}",
                path.display(),
                e
            ))
        })?;

        let info = Self::from_yaml(&contents)?;
        if info.name != name {
            return Err(Error::provision(format!(
                "state file {} describes cluster {:?}, expected {:?}",
                path.display(),
                info.name,
                name
            )));
        }

        Ok(info)
    }
}

#[derive(Deserialize)]
struct RawState {
    clusterinfo: RawClusterInfo,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RawClusterInfo {
    clustername: String,
    network: RawNetwork,
    nodes: Vec<RawNode>,
    extranodes: Vec<RawNode>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RawNetwork {
    name: String,
    #[serde(deserialize_with = "lenient")]
    gatewayaddr: Option<IpAddr>,
    gatewayaddrs: Vec<IpAddr>,
    mtu: u32,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RawNode {
    id: String,
    name: String,
    #[serde(deserialize_with = "lenient")]
    uuid: Option<Uuid>,
    ips: Vec<IpAddr>,
    #[serde(deserialize_with = "lenient")]
    privateip: Option<IpAddr>,
    apiport: u16,
}

/// Missing, null, empty or unparsable values become `None`
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.parse().ok()))
}

impl From<RawClusterInfo> for ClusterInfo {
    fn from(raw: RawClusterInfo) -> Self {
        Self {
            name: raw.clustername,
            network: NetworkInfo {
                gateway: raw
                    .network
                    .gatewayaddr
                    .or_else(|| raw.network.gatewayaddrs.first().copied()),
                name: raw.network.name,
                mtu: raw.network.mtu,
            },
            nodes: raw.nodes.into_iter().map(Into::into).collect(),
            extra_nodes: raw.extranodes.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<RawNode> for NodeInfo {
    fn from(raw: RawNode) -> Self {
        let mut ips = raw.ips;
        if let Some(ip) = raw.privateip {
            if !ips.contains(&ip) {
                ips.insert(0, ip);
            }
        }

        Self {
            id: raw.id,
            name: raw.name,
            uuid: raw.uuid,
            ips,
            api_port: raw.apiport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const NEW_STATE: &str = r#"
provisionername: qemu
bridgename: talossfyra
clusterinfo:
  clusterid: 9f4b2c
  clustername: sfyra
  network:
    name: sfyra
    cidrs:
      - 172.24.0.0/24
    gatewayaddrs:
      - 172.24.0.1
    mtu: 1500
  nodes:
    - id: 1a2b
      uuid: 6e1c2a49-8d4c-4b39-9b0e-0a8f3f9a6f01
      name: bootstrap-master
      type: controlplane
      ips:
        - 172.24.0.2
      apiport: 0
  extranodes: []
"#;

    const OLD_STATE: &str = r#"
provisionername: qemu
clusterinfo:
  clustername: sfyra-pxe
  network:
    name: sfyra-pxe
    gatewayaddr: 172.25.0.1
    mtu: 1500
  nodes: []
  extranodes:
    - id: "3"
      uuid: 2a3f10b4-5b76-4c1f-8d0d-9a1a9d4f2c11
      name: pxe-0
      privateip: 172.25.0.2
      apiport: 40123
    - id: "4"
      uuid: ""
      name: pxe-1
      privateip: ""
      apiport: 40124
"#;

    #[test]
    fn parses_current_state_layout() {
        let info = ClusterInfo::from_yaml(NEW_STATE).unwrap();

        assert_eq!(info.name, "sfyra");
        assert_eq!(info.network.gateway, Some(IpAddr::V4(Ipv4Addr::new(172, 24, 0, 1))));
        assert_eq!(info.network.mtu, 1500);

        let master = info
            .nodes
            .iter()
            .find(|n| n.name == "bootstrap-master")
            .unwrap();
        assert_eq!(master.primary_ip(), Some(IpAddr::V4(Ipv4Addr::new(172, 24, 0, 2))));
        assert_eq!(
            master.uuid.map(|u| u.to_string()).as_deref(),
            Some("6e1c2a49-8d4c-4b39-9b0e-0a8f3f9a6f01")
        );
        assert!(info.extra_nodes.is_empty());
    }

    #[test]
    fn parses_legacy_fields_and_tolerates_blanks() {
        let info = ClusterInfo::from_yaml(OLD_STATE).unwrap();

        assert_eq!(info.network.gateway, Some(IpAddr::V4(Ipv4Addr::new(172, 25, 0, 1))));
        assert_eq!(info.extra_nodes.len(), 2);

        let first = &info.extra_nodes[0];
        assert_eq!(first.api_port, 40123);
        assert_eq!(first.primary_ip(), Some(IpAddr::V4(Ipv4Addr::new(172, 25, 0, 2))));

        let second = &info.extra_nodes[1];
        assert!(second.uuid.is_none());
        assert!(second.ips.is_empty());
    }

    #[test]
    fn missing_cluster_info_is_an_error() {
        assert!(ClusterInfo::from_yaml("provisionername: qemu\n").is_err());
    }

    #[tokio::test]
    async fn load_reads_named_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_dir = dir.path().join("sfyra");
        std::fs::create_dir_all(&cluster_dir).unwrap();
        std::fs::write(cluster_dir.join(STATE_FILE), NEW_STATE).unwrap();

        let info = ClusterInfo::load(dir.path(), "sfyra").await.unwrap();
        assert_eq!(info.nodes.len(), 1);

        let err = ClusterInfo::load(dir.path(), "missing").await.unwrap_err();
        assert!(matches!(err, Error::Provision(_)));
    }

    #[tokio::test]
    async fn load_rejects_mismatched_cluster_name() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_dir = dir.path().join("other");
        std::fs::create_dir_all(&cluster_dir).unwrap();
        std::fs::write(cluster_dir.join(STATE_FILE), NEW_STATE).unwrap();

        let err = ClusterInfo::load(dir.path(), "other").await.unwrap_err();
        assert!(err.to_string().contains("expected \"other\""));
    }
}
