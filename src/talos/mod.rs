//! Talos building blocks: VM provisioning, cluster state, kernel command
//! lines and machine-config fragments

mod cmdline;
mod machine;
mod provisioner;
mod state;

pub use cmdline::KernelCmdline;
pub use machine::{InstallConfig, RegistriesConfig, RegistryMirrorConfig};
#[cfg(test)]
pub use provisioner::MockProvisioner;
pub use provisioner::{
    BootMode, ClusterRequest, CniConfig, NetworkRequest, NodeResources, Provisioner,
    QemuProvisioner, TalosAccess, DEFAULT_MTU,
};
pub use state::{state_file, ClusterInfo, NetworkInfo, NodeInfo, STATE_FILE};
