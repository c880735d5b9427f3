//! Infrastructure provider setup hooks

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use super::clusterctl::{Clusterctl, InitOptions};
use crate::kube_utils;
use crate::Error;

/// Namespace the Sidero components are installed into
pub const SIDERO_NAMESPACE: &str = "sidero-system";

/// Infrastructure provider kinds known to the harness
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    /// Amazon Web Services
    Aws,
    /// Sidero bare metal
    Sidero,
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(Self::Aws),
            "sidero" => Ok(Self::Sidero),
            _ => Err(Error::capi_installation(format!(
                "failed to set up unknown provider kind {s}"
            ))),
        }
    }
}

/// Tells whether a namespace is present in the management cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceLookup: Send + Sync {
    /// Whether namespace `name` exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;
}

#[async_trait]
impl NamespaceLookup for Client {
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        kube_utils::namespace_exists(self, name).await
    }
}

/// Install hook for one infrastructure provider
#[async_trait]
pub trait InfrastructureProvider: Send + Sync {
    /// Install the provider into the cluster `namespaces` describes
    async fn init(
        &self,
        clusterctl: &dyn Clusterctl,
        namespaces: &dyn NamespaceLookup,
        options: &InitOptions,
    ) -> Result<(), Error>;
}

/// Build the provider for `kind`
pub fn new_provider(
    kind: &str,
    sidero: &SideroOptions,
) -> Result<Box<dyn InfrastructureProvider>, Error> {
    match kind.parse::<ProviderKind>()? {
        ProviderKind::Sidero => Ok(Box::new(SideroProvider::new(sidero.clone()))),
        ProviderKind::Aws => Err(Error::capi_installation(
            "infrastructure provider aws is not supported",
        )),
    }
}

/// Settings substituted into the Sidero manifests
#[derive(Clone, Debug, PartialEq)]
pub struct SideroOptions {
    /// Run the controller manager on the host network
    pub manager_host_network: bool,
    /// Address PXE-booted machines use to reach Sidero
    pub manager_api_endpoint: IpAddr,
    /// How long to wait for a server to reboot
    pub server_reboot_timeout: Duration,
    /// Probability of a reported power management failure
    pub test_power_explicit_failure: f64,
    /// Probability of a silently ignored power management call
    pub test_power_silent_failure: f64,
}

impl SideroOptions {
    /// Harness defaults for the given API endpoint
    pub fn new(manager_api_endpoint: IpAddr) -> Self {
        Self {
            manager_host_network: true,
            manager_api_endpoint,
            // wiping and rebooting VMs is fast
            server_reboot_timeout: Duration::from_secs(30),
            test_power_explicit_failure: 0.0,
            test_power_silent_failure: 0.0,
        }
    }

    /// clusterctl variables for the Sidero templates
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (
                "SIDERO_CONTROLLER_MANAGER_HOST_NETWORK".to_string(),
                self.manager_host_network.to_string(),
            ),
            (
                "SIDERO_CONTROLLER_MANAGER_API_ENDPOINT".to_string(),
                self.manager_api_endpoint.to_string(),
            ),
            (
                "SIDERO_CONTROLLER_MANAGER_SERVER_REBOOT_TIMEOUT".to_string(),
                format!("{}s", self.server_reboot_timeout.as_secs()),
            ),
            (
                "SIDERO_CONTROLLER_MANAGER_TEST_POWER_EXPLICIT_FAILURE".to_string(),
                format!("{:.6}", self.test_power_explicit_failure),
            ),
            (
                "SIDERO_CONTROLLER_MANAGER_TEST_POWER_SILENT_FAILURE".to_string(),
                format!("{:.6}", self.test_power_silent_failure),
            ),
        ]
    }
}

/// Sidero infrastructure provider
pub struct SideroProvider {
    options: SideroOptions,
}

impl SideroProvider {
    /// Provider with the given template settings
    pub fn new(options: SideroOptions) -> Self {
        Self { options }
    }

    /// Run clusterctl unless Sidero is already installed
    pub async fn init_with(
        &self,
        clusterctl: &dyn Clusterctl,
        already_installed: bool,
        options: &InitOptions,
    ) -> Result<(), Error> {
        if already_installed {
            info!(
                namespace = SIDERO_NAMESPACE,
                "Sidero already installed, skipping clusterctl init"
            );
            return Ok(());
        }

        let mut options = options.clone();
        options.env.extend(self.options.env());
        clusterctl.init(&options).await
    }
}

#[async_trait]
impl InfrastructureProvider for SideroProvider {
    async fn init(
        &self,
        clusterctl: &dyn Clusterctl,
        namespaces: &dyn NamespaceLookup,
        options: &InitOptions,
    ) -> Result<(), Error> {
        let installed = namespaces.namespace_exists(SIDERO_NAMESPACE).await?;
        self.init_with(clusterctl, installed, options).await
    }
}
