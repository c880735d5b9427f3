//! Harness settings
//!
//! [`Options`] carries everything the bootstrap cluster, the Cluster API
//! installer and the test suite need. [`OptionsArgs`] is the clap surface
//! that fills it from flags or `SFYRA_*` environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Args;

use crate::Error;

/// Default bootstrap cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "sfyra";

/// Default Talos release used for the bootstrap cluster and PXE environment
pub const DEFAULT_TALOS_VERSION: &str = "v0.7.0-alpha.1";

/// A `registry=endpoint` pair, e.g. `docker.io=http://172.24.0.1:5000`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryMirror {
    /// Registry host being mirrored
    pub registry: String,
    /// Mirror endpoint URL
    pub endpoint: String,
}

impl FromStr for RegistryMirror {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((registry, endpoint)) if !registry.is_empty() && !endpoint.is_empty() => {
                Ok(Self {
                    registry: registry.to_string(),
                    endpoint: endpoint.to_string(),
                })
            }
            _ => Err(Error::config(format!(
                "unexpected registry mirror format: {:?}",
                s
            ))),
        }
    }
}

impl fmt::Display for RegistryMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.registry, self.endpoint)
    }
}

fn parse_registry_mirror(s: &str) -> Result<RegistryMirror, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

/// Settings for a harness run
#[derive(Clone, Debug)]
pub struct Options {
    /// Leave the bootstrap cluster running after the run
    pub skip_teardown: bool,

    /// Name of the bootstrap Talos cluster
    pub bootstrap_cluster_name: String,
    /// Talos kernel used to boot the bootstrap cluster VMs
    pub bootstrap_talos_vmlinuz: PathBuf,
    /// Talos initramfs used to boot the bootstrap cluster VMs
    pub bootstrap_talos_initramfs: PathBuf,
    /// Talos installer image for the bootstrap cluster
    pub bootstrap_talos_installer: String,

    /// Talos kernel URL served by the Sidero `default` Environment
    pub talos_kernel_url: String,
    /// Talos initramfs URL served by the Sidero `default` Environment
    pub talos_initrd_url: String,
    /// Installer image written into each Server's config patches
    pub talos_installer: String,

    /// clusterctl bootstrap providers
    pub bootstrap_providers: Vec<String>,
    /// clusterctl infrastructure providers
    pub infrastructure_providers: Vec<String>,
    /// clusterctl control plane providers
    pub control_plane_providers: Vec<String>,

    /// Registry mirrors for the bootstrap cluster and the PXE servers
    pub registry_mirrors: Vec<RegistryMirror>,

    /// Network CIDR of the bootstrap cluster
    pub cidr: String,
    /// Network CIDR of the PXE node pool
    pub pxe_cidr: String,

    /// Number of PXE-booted nodes
    pub nodes: usize,

    /// Memory per VM in MiB
    pub mem_mb: u64,
    /// CPUs per VM
    pub cpus: u64,
    /// Disk per VM in GiB
    pub disk_gb: u64,

    /// Path to the talosctl binary driving the qemu provisioner
    pub talosctl_path: PathBuf,
    /// Path to the clusterctl binary
    pub clusterctl_path: PathBuf,

    /// Probability of an explicit (reported) simulated power failure
    pub power_simulated_explicit_failure_prob: f64,
    /// Probability of a silent simulated power failure
    pub power_simulated_silent_failure_prob: f64,

    /// Only run tests whose name contains this string
    pub run: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        let installer = format!("docker.io/autonomy/installer:{}", DEFAULT_TALOS_VERSION);
        let release =
            format!("https://github.com/talos-systems/talos/releases/download/{DEFAULT_TALOS_VERSION}");

        Self {
            skip_teardown: false,
            bootstrap_cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            bootstrap_talos_vmlinuz: PathBuf::from("_out/vmlinuz"),
            bootstrap_talos_initramfs: PathBuf::from("_out/initramfs.xz"),
            bootstrap_talos_installer: installer.clone(),
            talos_kernel_url: format!("{release}/vmlinuz"),
            talos_initrd_url: format!("{release}/initramfs.xz"),
            talos_installer: installer,
            bootstrap_providers: vec!["talos".to_string()],
            infrastructure_providers: vec!["sidero".to_string()],
            control_plane_providers: vec!["talos".to_string()],
            registry_mirrors: Vec::new(),
            cidr: "172.24.0.0/24".to_string(),
            pxe_cidr: "172.25.0.0/24".to_string(),
            nodes: 4,
            mem_mb: 2048,
            cpus: 2,
            disk_gb: 4,
            talosctl_path: PathBuf::from("_out/talosctl-linux-amd64"),
            clusterctl_path: PathBuf::from("clusterctl"),
            power_simulated_explicit_failure_prob: 0.0,
            power_simulated_silent_failure_prob: 0.0,
            run: None,
        }
    }
}

/// Command line flags for a harness run
#[derive(Args, Debug, Clone)]
pub struct OptionsArgs {
    /// Skip tearing down the bootstrap cluster
    #[arg(long, env = "SFYRA_SKIP_TEARDOWN")]
    pub skip_teardown: bool,

    /// Bootstrap cluster name
    #[arg(long, env = "SFYRA_BOOTSTRAP_CLUSTER_NAME", default_value = DEFAULT_CLUSTER_NAME)]
    pub bootstrap_cluster_name: String,

    /// Talos kernel image for bootstrap cluster
    #[arg(long = "bootstrap-vmlinuz", env = "SFYRA_BOOTSTRAP_VMLINUZ", default_value = "_out/vmlinuz")]
    pub bootstrap_vmlinuz: PathBuf,

    /// Talos initramfs image for bootstrap cluster
    #[arg(
        long = "bootstrap-initramfs",
        env = "SFYRA_BOOTSTRAP_INITRAMFS",
        default_value = "_out/initramfs.xz"
    )]
    pub bootstrap_initramfs: PathBuf,

    /// Talos install image for bootstrap cluster
    #[arg(long = "bootstrap-installer", env = "SFYRA_BOOTSTRAP_INSTALLER")]
    pub bootstrap_installer: Option<String>,

    /// Talos install image written into the servers' config patches
    #[arg(long, env = "SFYRA_TALOS_INSTALLER")]
    pub talos_installer: Option<String>,

    /// Network CIDR of the bootstrap cluster
    #[arg(long, env = "SFYRA_CIDR", default_value = "172.24.0.0/24")]
    pub cidr: String,

    /// Network CIDR of the PXE node pool
    #[arg(long, env = "SFYRA_PXE_CIDR", default_value = "172.25.0.0/24")]
    pub pxe_cidr: String,

    /// Number of PXE nodes to create
    #[arg(long, env = "SFYRA_NODES", default_value_t = 4)]
    pub nodes: usize,

    /// Memory per VM in MiB
    #[arg(long, env = "SFYRA_MEM_MB", default_value_t = 2048)]
    pub mem_mb: u64,

    /// CPUs per VM
    #[arg(long, env = "SFYRA_CPUS", default_value_t = 2)]
    pub cpus: u64,

    /// Disk per VM in GiB
    #[arg(long, env = "SFYRA_DISK_GB", default_value_t = 4)]
    pub disk_gb: u64,

    /// Path to the talosctl (for qemu provisioner)
    #[arg(long, env = "SFYRA_TALOSCTL_PATH", default_value = "_out/talosctl-linux-amd64")]
    pub talosctl_path: PathBuf,

    /// Path to clusterctl
    #[arg(long, env = "SFYRA_CLUSTERCTL_PATH", default_value = "clusterctl")]
    pub clusterctl_path: PathBuf,

    /// Registry mirrors to use (registry=endpoint, repeatable or comma-separated)
    #[arg(
        long = "registry-mirrors",
        env = "SFYRA_REGISTRY_MIRRORS",
        value_delimiter = ',',
        value_parser = parse_registry_mirror
    )]
    pub registry_mirrors: Vec<RegistryMirror>,

    /// Talos kernel image URL for Cluster API Environment
    #[arg(long, env = "SFYRA_TALOS_KERNEL_URL")]
    pub talos_kernel_url: Option<String>,

    /// Talos initramfs image URL for Cluster API Environment
    #[arg(long, env = "SFYRA_TALOS_INITRD_URL")]
    pub talos_initrd_url: Option<String>,

    /// Probability of explicit simulated power failures in Sidero
    #[arg(long, env = "SFYRA_POWER_EXPLICIT_FAILURE", default_value_t = 0.0)]
    pub power_simulated_explicit_failure_prob: f64,

    /// Probability of silent simulated power failures in Sidero
    #[arg(long, env = "SFYRA_POWER_SILENT_FAILURE", default_value_t = 0.0)]
    pub power_simulated_silent_failure_prob: f64,

    /// Only run tests whose name contains this string
    #[arg(long)]
    pub run: Option<String>,
}

impl From<OptionsArgs> for Options {
    fn from(args: OptionsArgs) -> Self {
        let defaults = Options::default();

        let bootstrap_talos_installer = args
            .bootstrap_installer
            .unwrap_or(defaults.bootstrap_talos_installer);
        let talos_installer = args
            .talos_installer
            .unwrap_or_else(|| bootstrap_talos_installer.clone());

        Self {
            skip_teardown: args.skip_teardown,
            bootstrap_cluster_name: args.bootstrap_cluster_name,
            bootstrap_talos_vmlinuz: args.bootstrap_vmlinuz,
            bootstrap_talos_initramfs: args.bootstrap_initramfs,
            bootstrap_talos_installer,
            talos_kernel_url: args.talos_kernel_url.unwrap_or(defaults.talos_kernel_url),
            talos_initrd_url: args.talos_initrd_url.unwrap_or(defaults.talos_initrd_url),
            talos_installer,
            registry_mirrors: args.registry_mirrors,
            cidr: args.cidr,
            pxe_cidr: args.pxe_cidr,
            nodes: args.nodes,
            mem_mb: args.mem_mb,
            cpus: args.cpus,
            disk_gb: args.disk_gb,
            talosctl_path: args.talosctl_path,
            clusterctl_path: args.clusterctl_path,
            power_simulated_explicit_failure_prob: args.power_simulated_explicit_failure_prob,
            power_simulated_silent_failure_prob: args.power_simulated_silent_failure_prob,
            run: args.run,
            ..defaults
        }
    }
}

impl Options {
    /// Check values clap cannot validate on its own
    pub fn validate(&self) -> Result<(), Error> {
        if self.nodes == 0 {
            return Err(Error::config("at least one PXE node is required"));
        }

        for (name, prob) in [
            ("explicit", self.power_simulated_explicit_failure_prob),
            ("silent", self.power_simulated_silent_failure_prob),
        ] {
            if !(0.0..=1.0).contains(&prob) {
                return Err(Error::config(format!(
                    "{name} power failure probability must be within [0, 1], got {prob}"
                )));
            }
        }

        Ok(())
    }
}
