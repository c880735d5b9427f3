//! Bootstrap cluster lifecycle
//!
//! The bootstrap cluster is a single Talos control plane running in QEMU. It
//! hosts Cluster API and Sidero. Next to it a pool of empty VMs is started on
//! a second bridge; those VMs network boot from the iPXE endpoint Sidero
//! serves on the control plane and register themselves as Servers.
//!
//! Both clusters are recorded in the provisioner state directory, so a
//! bootstrap cluster left behind with `--skip-teardown` is picked up again by
//! the next run instead of being recreated.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Options;
use crate::kube_utils;
use crate::net::{parse_cidr, AddressPlan};
use crate::talos::{
    BootMode, ClusterInfo, ClusterRequest, NetworkRequest, NodeInfo, NodeResources, Provisioner,
    TalosAccess,
};
use crate::Error;

/// Port of Sidero's iPXE HTTP endpoint on the control plane
pub const IPXE_PORT: u16 = 8081;

/// How long to wait for the bootstrap cluster to become healthy
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Suffix of the PXE pool cluster name
pub const PXE_POOL_SUFFIX: &str = "-pxe";

/// Default Talos state directory, `~/.talos/clusters`
pub fn default_state_dir() -> Result<PathBuf, Error> {
    Ok(talos_dir()?.join("clusters"))
}

/// Default talosconfig, `$TALOSCONFIG` or `~/.talos/config`
pub fn default_talosconfig() -> Result<PathBuf, Error> {
    if let Some(path) = std::env::var_os("TALOSCONFIG") {
        return Ok(PathBuf::from(path));
    }
    Ok(talos_dir()?.join("config"))
}

fn talos_dir() -> Result<PathBuf, Error> {
    dirs::home_dir()
        .map(|home| home.join(".talos"))
        .ok_or_else(|| Error::config("could not determine home directory"))
}

/// Merge patch clearing every taint on a node
pub fn untaint_patch() -> serde_json::Value {
    json!({ "spec": { "taints": null } })
}

/// Kubernetes-side steps that make a fresh control plane usable for workloads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneSetup: Send + Sync {
    /// Wait for the cluster's nodes, then allow scheduling on `node`
    async fn make_schedulable(
        &self,
        kubeconfig: &Path,
        context: &str,
        node: &str,
    ) -> Result<(), Error>;
}

/// [`ControlPlaneSetup`] through the Kubernetes API
pub struct KubeControlPlaneSetup;

#[async_trait]
impl ControlPlaneSetup for KubeControlPlaneSetup {
    async fn make_schedulable(
        &self,
        kubeconfig: &Path,
        context: &str,
        node: &str,
    ) -> Result<(), Error> {
        let client = kube_utils::create_client(kubeconfig, Some(context)).await?;
        kube_utils::wait_for_nodes_ready(&client, HEALTH_TIMEOUT).await?;

        let nodes: Api<Node> = Api::all(client);
        nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(untaint_patch()))
            .await
            .map_err(|e| Error::provision(format!("error patching node {:?}: {}", node, e)))?;

        info!(node = %node, "Removed taints from control plane");
        Ok(())
    }
}

/// The bootstrap Talos cluster and its PXE node pool
pub struct BootstrapCluster {
    options: Options,
    provisioner: Arc<dyn Provisioner>,
    control_plane: Arc<dyn ControlPlaneSetup>,
    state_dir: PathBuf,
    talosconfig: PathBuf,
    cluster: Option<ClusterInfo>,
    pool: Option<ClusterInfo>,
}

impl BootstrapCluster {
    /// Use the default Talos state directory and talosconfig
    pub fn new(options: Options, provisioner: Arc<dyn Provisioner>) -> Result<Self, Error> {
        let state_dir = default_state_dir()?;
        let talosconfig = default_talosconfig()?;
        Ok(Self::with_paths(options, provisioner, state_dir, talosconfig))
    }

    /// Use explicit state directory and talosconfig paths
    pub fn with_paths(
        options: Options,
        provisioner: Arc<dyn Provisioner>,
        state_dir: PathBuf,
        talosconfig: PathBuf,
    ) -> Self {
        Self {
            options,
            provisioner,
            control_plane: Arc::new(KubeControlPlaneSetup),
            state_dir,
            talosconfig,
            cluster: None,
            pool: None,
        }
    }

    /// Bootstrap cluster name
    pub fn name(&self) -> &str {
        &self.options.bootstrap_cluster_name
    }

    /// PXE pool cluster name
    pub fn pool_name(&self) -> String {
        format!("{}{}", self.name(), PXE_POOL_SUFFIX)
    }

    /// Provisioner state directory
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Attach to existing clusters or create them, then wait for health and
    /// make the control plane schedulable
    pub async fn setup(&mut self) -> Result<(), Error> {
        info!(
            state_dir = %self.state_dir.display(),
            name = %self.name(),
            "Setting up bootstrap cluster"
        );

        let cluster = match self.find_existing(self.name()).await {
            Ok(cluster) => cluster,
            Err(e) => {
                info!("Bootstrap cluster not found: {}, creating new one", e);
                let request = self.bootstrap_request()?;
                self.provisioner.create(&request).await?
            }
        };
        self.cluster = Some(cluster);

        self.wait_healthy().await?;

        let kubeconfig = tempfile::Builder::new().prefix("kubeconfig").tempfile()?;
        self.write_kubeconfig(kubeconfig.path()).await?;
        self.control_plane
            .make_schedulable(
                kubeconfig.path(),
                &self.kube_context(),
                self.master_node_name()?,
            )
            .await?;

        let pool_name = self.pool_name();
        let pool = match self.find_existing(&pool_name).await {
            Ok(pool) => pool,
            Err(e) => {
                info!("PXE node pool not found: {}, creating new one", e);
                let request = self.pool_request()?;
                self.provisioner.create(&request).await?
            }
        };
        self.pool = Some(pool);

        info!(
            master = %self.master_ip()?,
            nodes = self.nodes().len(),
            "Bootstrap cluster is ready"
        );
        Ok(())
    }

    /// Attach to already running clusters without creating anything
    pub async fn attach(&mut self) -> Result<(), Error> {
        let cluster = self.find_existing(self.name()).await?;
        self.cluster = Some(cluster);

        let pool_name = self.pool_name();
        match self.find_existing(&pool_name).await {
            Ok(pool) => self.pool = Some(pool),
            Err(e) => warn!("PXE node pool not found: {}", e),
        }

        Ok(())
    }

    async fn find_existing(&self, name: &str) -> Result<ClusterInfo, Error> {
        self.provisioner.reflect(name, &self.state_dir).await
    }

    /// Request for the bootstrap control plane
    pub fn bootstrap_request(&self) -> Result<ClusterRequest, Error> {
        let cidr = parse_cidr(&self.options.cidr)?;
        AddressPlan::allocate(cidr, 1)?;

        Ok(ClusterRequest {
            name: self.name().to_string(),
            network: NetworkRequest::new(cidr),
            boot: BootMode::Talos {
                kernel_path: self.options.bootstrap_talos_vmlinuz.clone(),
                initramfs_path: self.options.bootstrap_talos_initramfs.clone(),
            },
            install_image: Some(self.options.bootstrap_talos_installer.clone()),
            registry_mirrors: self.options.registry_mirrors.clone(),
            control_planes: 1,
            workers: 0,
            resources: self.resources(),
            bootloader: true,
            state_dir: self.state_dir.clone(),
            talosconfig: self.talosconfig.clone(),
        })
    }

    /// Request for the PXE node pool; needs the bootstrap cluster to be known
    pub fn pool_request(&self) -> Result<ClusterRequest, Error> {
        let cidr = parse_cidr(&self.options.pxe_cidr)?;
        AddressPlan::allocate(cidr, self.options.nodes)?;

        let bootstrap = parse_cidr(&self.options.cidr)?;
        if bootstrap.contains(&cidr) || cidr.contains(&bootstrap) {
            return Err(Error::config(format!(
                "PXE network {} overlaps bootstrap network {}",
                cidr, bootstrap
            )));
        }

        let nodes = self.options.nodes;
        if nodes == 0 {
            return Err(Error::config("at least one PXE node is required"));
        }

        Ok(ClusterRequest {
            name: self.pool_name(),
            network: NetworkRequest::new(cidr),
            boot: BootMode::Ipxe {
                boot_script: self.ipxe_boot_script()?,
            },
            install_image: None,
            registry_mirrors: Vec::new(),
            control_planes: 1,
            workers: nodes - 1,
            resources: self.resources(),
            bootloader: true,
            state_dir: self.state_dir.clone(),
            talosconfig: self.talosconfig.clone(),
        })
    }

    fn resources(&self) -> NodeResources {
        NodeResources {
            memory_mb: self.options.mem_mb,
            cpus: self.options.cpus,
            disk_gb: self.options.disk_gb,
        }
    }

    /// URL of the iPXE script PXE nodes chain-load
    pub fn ipxe_boot_script(&self) -> Result<String, Error> {
        Ok(format!(
            "http://{}:{}/boot.ipxe",
            self.master_ip()?,
            IPXE_PORT
        ))
    }

    fn cluster(&self) -> Result<&ClusterInfo, Error> {
        self.cluster
            .as_ref()
            .ok_or_else(|| Error::provision("bootstrap cluster is not set up"))
    }

    fn master(&self) -> Result<&NodeInfo, Error> {
        self.cluster()?
            .nodes
            .first()
            .ok_or_else(|| Error::provision("bootstrap cluster has no control plane node"))
    }

    /// Address of the bootstrap control plane node
    pub fn master_ip(&self) -> Result<IpAddr, Error> {
        self.master()?
            .primary_ip()
            .ok_or_else(|| Error::provision("bootstrap control plane node has no address"))
    }

    /// Kubernetes node name of the bootstrap control plane
    pub fn master_node_name(&self) -> Result<&str, Error> {
        Ok(&self.master()?.name)
    }

    /// Gateway of the PXE network; power management APIs listen there
    pub fn gateway_ip(&self) -> Result<IpAddr, Error> {
        if let Some(gateway) = self.pool.as_ref().and_then(|p| p.network.gateway) {
            return Ok(gateway);
        }

        let cidr = parse_cidr(&self.options.pxe_cidr)?;
        Ok(IpAddr::V4(AddressPlan::allocate(cidr, 0)?.gateway))
    }

    /// PXE booted VMs
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.pool
            .iter()
            .flat_map(|p| p.nodes.iter().chain(p.extra_nodes.iter()))
            .cloned()
            .collect()
    }

    /// SMBIOS UUIDs of the PXE booted VMs
    pub fn node_uuids(&self) -> Result<Vec<String>, Error> {
        self.nodes()
            .iter()
            .map(|n| {
                n.uuid
                    .map(|u| u.to_string())
                    .ok_or_else(|| Error::provision(format!("PXE node {} has no UUID", n.name)))
            })
            .collect()
    }

    /// Talos API access to the control plane
    pub fn talos_access(&self) -> Result<TalosAccess, Error> {
        Ok(TalosAccess {
            talosconfig: self.talosconfig.clone(),
            context: Some(self.name().to_string()),
            node: self.master_ip()?,
        })
    }

    /// Write an admin kubeconfig to `path`
    pub async fn write_kubeconfig(&self, path: &Path) -> Result<(), Error> {
        let access = self.talos_access()?;
        self.provisioner.kubeconfig(&access, path).await
    }

    /// Kube client for the bootstrap cluster
    pub async fn client(&self) -> Result<Client, Error> {
        let kubeconfig = tempfile::Builder::new().prefix("kubeconfig").tempfile()?;
        self.write_kubeconfig(kubeconfig.path()).await?;
        kube_utils::create_client(kubeconfig.path(), Some(&self.kube_context())).await
    }

    /// Context name in the admin kubeconfig
    pub fn kube_context(&self) -> String {
        format!("admin@{}", self.name())
    }

    async fn wait_healthy(&self) -> Result<(), Error> {
        let access = self.talos_access()?;
        let master = self.master_ip()?;

        info!(timeout_secs = HEALTH_TIMEOUT.as_secs(), "Waiting for bootstrap cluster health");
        self.provisioner
            .health(&access, &[master], &[], HEALTH_TIMEOUT)
            .await
    }

    /// Destroy the PXE pool and the bootstrap cluster; safe to call repeatedly
    pub async fn tear_down(&mut self) -> Result<(), Error> {
        let mut result = Ok(());

        if let Some(pool) = self.pool.take() {
            if let Err(e) = self.provisioner.destroy(&pool.name, &self.state_dir).await {
                warn!(cluster = %pool.name, error = %e, "Failed to destroy PXE node pool");
                result = Err(e);
            }
        }

        if let Some(cluster) = self.cluster.take() {
            if let Err(e) = self.provisioner.destroy(&cluster.name, &self.state_dir).await {
                warn!(cluster = %cluster.name, error = %e, "Failed to destroy bootstrap cluster");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }
}
