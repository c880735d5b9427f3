//! QEMU cluster provisioning through `talosctl`

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use super::state::ClusterInfo;
use crate::command::CommandSpec;
use crate::config::RegistryMirror;
use crate::Error;

/// Bridge MTU for harness networks
pub const DEFAULT_MTU: u32 = 1500;
/// DNS servers handed to the VMs
pub const DEFAULT_NAMESERVERS: [&str; 2] = ["8.8.8.8", "1.1.1.1"];
/// CNI plugin binaries used to wire up the bridge
pub const DEFAULT_CNI_BIN_PATH: &str = "/opt/cni/bin";
/// CNI network config directory
pub const DEFAULT_CNI_CONF_DIR: &str = "/etc/cni/conf.d";
/// CNI cache directory
pub const DEFAULT_CNI_CACHE_DIR: &str = "/var/lib/cni";

/// CNI configuration for the bridge network
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CniConfig {
    /// Directories searched for CNI plugins
    pub bin_path: Vec<PathBuf>,
    /// CNI config directory
    pub conf_dir: PathBuf,
    /// CNI cache directory
    pub cache_dir: PathBuf,
}

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            bin_path: vec![PathBuf::from(DEFAULT_CNI_BIN_PATH)],
            conf_dir: PathBuf::from(DEFAULT_CNI_CONF_DIR),
            cache_dir: PathBuf::from(DEFAULT_CNI_CACHE_DIR),
        }
    }
}

/// Bridge network of a new cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkRequest {
    /// Network CIDR; the gateway takes the first host address
    pub cidr: Ipv4Net,
    /// Link MTU
    pub mtu: u32,
    /// DNS servers
    pub nameservers: Vec<IpAddr>,
    /// CNI settings
    pub cni: CniConfig,
}

impl NetworkRequest {
    /// Network with default MTU, nameservers and CNI paths
    pub fn new(cidr: Ipv4Net) -> Self {
        Self {
            cidr,
            mtu: DEFAULT_MTU,
            nameservers: DEFAULT_NAMESERVERS
                .iter()
                .filter_map(|ns| ns.parse().ok())
                .collect(),
            cni: CniConfig::default(),
        }
    }
}

/// Resources of every VM in a cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeResources {
    /// Memory in MiB
    pub memory_mb: u64,
    /// Virtual CPUs
    pub cpus: u64,
    /// Disk size in GiB
    pub disk_gb: u64,
}

/// How the VMs of a cluster boot
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootMode {
    /// Boot the given Talos kernel and initramfs and inject a generated config
    Talos {
        /// Kernel image
        kernel_path: PathBuf,
        /// Initramfs image
        initramfs_path: PathBuf,
    },
    /// Network boot from an iPXE script, without any Talos config
    Ipxe {
        /// iPXE script URL, e.g. `http://172.24.0.2:8081/boot.ipxe`
        boot_script: String,
    },
}

/// Everything needed to start a cluster of VMs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterRequest {
    /// Cluster (and bridge) name
    pub name: String,
    /// Bridge network
    pub network: NetworkRequest,
    /// Boot source
    pub boot: BootMode,
    /// Installer image written into the generated config
    pub install_image: Option<String>,
    /// Registry mirrors written into the generated config
    pub registry_mirrors: Vec<RegistryMirror>,
    /// Number of control plane VMs
    pub control_planes: usize,
    /// Number of worker VMs
    pub workers: usize,
    /// Per-VM resources
    pub resources: NodeResources,
    /// Give VMs a disk bootloader
    pub bootloader: bool,
    /// Parent directory for cluster state
    pub state_dir: PathBuf,
    /// talosconfig the new context is merged into
    pub talosconfig: PathBuf,
}

/// How to reach the Talos API of a running cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TalosAccess {
    /// talosconfig file
    pub talosconfig: PathBuf,
    /// Context in the talosconfig; `None` uses the current one
    pub context: Option<String>,
    /// Node the request is sent to
    pub node: IpAddr,
}

/// Starts, inspects and destroys clusters of Talos VMs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the cluster and return its recorded state
    async fn create(&self, request: &ClusterRequest) -> Result<ClusterInfo, Error>;

    /// Load the state of an existing cluster
    async fn reflect(&self, name: &str, state_dir: &Path) -> Result<ClusterInfo, Error>;

    /// Stop the VMs and remove the cluster state
    async fn destroy(&self, name: &str, state_dir: &Path) -> Result<(), Error>;

    /// Write an admin kubeconfig for the cluster to `path`
    async fn kubeconfig(&self, access: &TalosAccess, path: &Path) -> Result<(), Error>;

    /// Run the Talos cluster health checks
    async fn health(
        &self,
        access: &TalosAccess,
        control_plane_nodes: &[IpAddr],
        worker_nodes: &[IpAddr],
        timeout: Duration,
    ) -> Result<(), Error>;
}

/// [`Provisioner`] driving `talosctl cluster` with the qemu backend
pub struct QemuProvisioner {
    talosctl: PathBuf,
}

impl QemuProvisioner {
    /// Use the talosctl binary at `talosctl`
    pub fn new(talosctl: impl Into<PathBuf>) -> Self {
        Self {
            talosctl: talosctl.into(),
        }
    }

    fn talosctl(&self) -> CommandSpec {
        CommandSpec::new(&self.talosctl)
    }

    /// `talosctl cluster create` for `request`
    pub fn create_command(&self, request: &ClusterRequest) -> CommandSpec {
        let network = &request.network;
        let nameservers = network
            .nameservers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let cni_bin_path = network
            .cni
            .bin_path
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = self
            .talosctl()
            .arg("cluster")
            .arg("create")
            .flag("provisioner", "qemu")
            .flag("name", &request.name)
            .flag("state", request.state_dir.display())
            .flag("talosconfig", request.talosconfig.display())
            .flag("cidr", network.cidr)
            .flag("mtu", network.mtu)
            .flag("nameservers", nameservers)
            .flag("cni-bin-path", cni_bin_path)
            .flag("cni-conf-dir", network.cni.conf_dir.display())
            .flag("cni-cache-dir", network.cni.cache_dir.display())
            .flag("controlplanes", request.control_planes)
            .flag("workers", request.workers)
            .flag("memory", request.resources.memory_mb)
            .flag("memory-workers", request.resources.memory_mb)
            .flag("cpus", format!("{}.0", request.resources.cpus))
            .flag("cpus-workers", format!("{}.0", request.resources.cpus))
            .flag("disk", request.resources.disk_gb * 1024)
            .flag_eq("with-bootloader", request.bootloader)
            .flag_eq("wait", false);

        match &request.boot {
            BootMode::Talos {
                kernel_path,
                initramfs_path,
            } => {
                cmd = cmd
                    .flag("vmlinuz-path", kernel_path.display())
                    .flag("initrd-path", initramfs_path.display());
            }
            BootMode::Ipxe { boot_script } => {
                cmd = cmd
                    .flag("ipxe-boot-script", boot_script)
                    .flag_eq("skip-injecting-config", true)
                    .flag_eq("skip-kubeconfig", true);
            }
        }

        if let Some(image) = &request.install_image {
            cmd = cmd.flag("install-image", image);
        }

        for mirror in &request.registry_mirrors {
            cmd = cmd.flag("registry-mirror", mirror);
        }

        cmd
    }

    /// `talosctl cluster destroy`
    pub fn destroy_command(&self, name: &str, state_dir: &Path) -> CommandSpec {
        self.talosctl()
            .arg("cluster")
            .arg("destroy")
            .flag("provisioner", "qemu")
            .flag("name", name)
            .flag("state", state_dir.display())
    }

    fn with_access(&self, access: &TalosAccess) -> CommandSpec {
        let mut cmd = self
            .talosctl()
            .flag("talosconfig", access.talosconfig.display());
        if let Some(context) = &access.context {
            cmd = cmd.flag("context", context);
        }
        cmd.flag("nodes", access.node)
    }

    /// `talosctl kubeconfig <path>`
    pub fn kubeconfig_command(&self, access: &TalosAccess, path: &Path) -> CommandSpec {
        self.with_access(access)
            .arg("kubeconfig")
            .arg(path.display().to_string())
            .flag_eq("force", true)
            .flag_eq("merge", false)
    }

    /// `talosctl health`
    pub fn health_command(
        &self,
        access: &TalosAccess,
        control_plane_nodes: &[IpAddr],
        worker_nodes: &[IpAddr],
        timeout: Duration,
    ) -> CommandSpec {
        let join = |ips: &[IpAddr]| {
            ips.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };

        let mut cmd = self
            .with_access(access)
            .arg("health")
            .flag("wait-timeout", format!("{}s", timeout.as_secs()))
            .flag("control-plane-nodes", join(control_plane_nodes));
        if !worker_nodes.is_empty() {
            cmd = cmd.flag("worker-nodes", join(worker_nodes));
        }
        cmd
    }
}

#[async_trait]
impl Provisioner for QemuProvisioner {
    async fn create(&self, request: &ClusterRequest) -> Result<ClusterInfo, Error> {
        info!(
            cluster = %request.name,
            cidr = %request.network.cidr,
            control_planes = request.control_planes,
            workers = request.workers,
            "Creating qemu cluster"
        );

        tokio::fs::create_dir_all(&request.state_dir).await?;
        self.create_command(request)
            .run()
            .await
            .map_err(|e| Error::provision(format!("failed to create cluster {}: {}", request.name, e)))?;

        self.reflect(&request.name, &request.state_dir).await
    }

    async fn reflect(&self, name: &str, state_dir: &Path) -> Result<ClusterInfo, Error> {
        ClusterInfo::load(state_dir, name).await
    }

    async fn destroy(&self, name: &str, state_dir: &Path) -> Result<(), Error> {
        info!(cluster = %name, "Destroying qemu cluster");
        self.destroy_command(name, state_dir).run().await
    }

    async fn kubeconfig(&self, access: &TalosAccess, path: &Path) -> Result<(), Error> {
        self.kubeconfig_command(access, path).output().await?;
        Ok(())
    }

    async fn health(
        &self,
        access: &TalosAccess,
        control_plane_nodes: &[IpAddr],
        worker_nodes: &[IpAddr],
        timeout: Duration,
    ) -> Result<(), Error> {
        self.health_command(access, control_plane_nodes, worker_nodes, timeout)
            .run()
            .await
    }
}
