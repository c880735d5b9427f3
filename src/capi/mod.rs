//! Cluster API installation on the bootstrap cluster
//!
//! [`ClusterApi`] fetches an admin kubeconfig from the bootstrap cluster once,
//! runs `clusterctl init` through each configured infrastructure provider and
//! then adapts the Sidero deployments so PXE-booted machines can reach them.

mod cluster;
mod clusterctl;
mod infrastructure;
mod patch;

pub use cluster::{
    is_running_machine, object_ref, rewrite_talosconfig_endpoints, status_selector, ObjectRef,
    WorkloadCluster, CLUSTER_NAMESPACE, CLUSTER_NAME_LABEL,
};
#[cfg(test)]
pub use clusterctl::MockClusterctl;
pub use clusterctl::{Clusterctl, ClusterctlCli, InitOptions};
#[cfg(test)]
pub use infrastructure::MockNamespaceLookup;
pub use infrastructure::{
    new_provider, InfrastructureProvider, NamespaceLookup, ProviderKind, SideroOptions,
    SideroProvider, SIDERO_NAMESPACE,
};
pub use patch::{
    controller_manager_patch, metadata_server_patch, CONTROLLER_MANAGER, FIELD_MANAGER,
    METADATA_SERVER, METADATA_SERVER_PORT,
};

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tempfile::NamedTempFile;
use tracing::info;

use crate::bootstrap::BootstrapCluster;
use crate::config::Options;
use crate::kube_utils::{self, wait_for_deployment};
use crate::retry::{retry_with_backoff, Backoff};
use crate::Error;

/// How long the patched Sidero deployments get to roll out
pub const DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Run each infrastructure provider's install hook, in order
pub async fn install_providers(
    providers: &[String],
    sidero: &SideroOptions,
    clusterctl: &dyn Clusterctl,
    namespaces: &dyn NamespaceLookup,
    options: &InitOptions,
) -> Result<(), Error> {
    for kind in providers {
        info!(provider = %kind, "Installing infrastructure provider");
        let provider = new_provider(kind, sidero)?;
        provider.init(clusterctl, namespaces, options).await?;
    }
    Ok(())
}

/// Whether the Sidero deployments need the harness patches
pub fn patches_sidero(providers: &[String]) -> bool {
    providers.iter().any(|p| p == "sidero")
}

/// Cluster API management for the bootstrap cluster
pub struct ClusterApi {
    options: Options,
    clusterctl: Arc<dyn Clusterctl>,
    kubeconfig: NamedTempFile,
    context: String,
    client: Client,
    master_ip: IpAddr,
}

impl ClusterApi {
    /// Fetch the admin kubeconfig of `bootstrap` and connect to it
    pub async fn new(
        bootstrap: &BootstrapCluster,
        options: Options,
        clusterctl: Arc<dyn Clusterctl>,
    ) -> Result<Self, Error> {
        let kubeconfig = tempfile::Builder::new().prefix("kubeconfig").tempfile()?;
        bootstrap.write_kubeconfig(kubeconfig.path()).await?;

        let context = bootstrap.kube_context();
        let client = kube_utils::create_client(kubeconfig.path(), Some(&context)).await?;

        Ok(Self {
            options,
            clusterctl,
            kubeconfig,
            context,
            client,
            master_ip: bootstrap.master_ip()?,
        })
    }

    /// Path of the cached admin kubeconfig
    pub fn kubeconfig(&self) -> &Path {
        self.kubeconfig.path()
    }

    /// Kube client for the bootstrap cluster
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Arguments shared by every provider's `clusterctl init`
    pub fn init_options(&self) -> InitOptions {
        InitOptions {
            kubeconfig: self.kubeconfig().to_path_buf(),
            kubeconfig_context: self.context.clone(),
            core_provider: None,
            bootstrap_providers: self.options.bootstrap_providers.clone(),
            control_plane_providers: self.options.control_plane_providers.clone(),
            infrastructure_providers: self.options.infrastructure_providers.clone(),
            env: Vec::new(),
        }
    }

    /// Template settings for the Sidero provider
    pub fn sidero_options(&self) -> SideroOptions {
        SideroOptions {
            test_power_explicit_failure: self.options.power_simulated_explicit_failure_prob,
            test_power_silent_failure: self.options.power_simulated_silent_failure_prob,
            ..SideroOptions::new(self.master_ip)
        }
    }

    /// Install Cluster API and every configured infrastructure provider
    pub async fn install(&self) -> Result<(), Error> {
        let providers = &self.options.infrastructure_providers;
        install_providers(
            providers,
            &self.sidero_options(),
            self.clusterctl.as_ref(),
            &self.client,
            &self.init_options(),
        )
        .await?;

        if patches_sidero(providers) {
            self.patch_sidero().await?;
        }

        Ok(())
    }

    async fn patch_sidero(&self) -> Result<(), Error> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), SIDERO_NAMESPACE);

        let metadata_server = deployments.get(METADATA_SERVER).await?;
        self.apply_patch(
            &deployments,
            METADATA_SERVER,
            metadata_server_patch(&metadata_server)?,
        )
        .await?;

        let controller_manager = deployments.get(CONTROLLER_MANAGER).await?;
        self.apply_patch(
            &deployments,
            CONTROLLER_MANAGER,
            controller_manager_patch(&controller_manager, self.master_ip)?,
        )
        .await?;

        for name in [METADATA_SERVER, CONTROLLER_MANAGER] {
            wait_for_deployment(&self.client, name, SIDERO_NAMESPACE, DEPLOYMENT_TIMEOUT).await?;
        }

        Ok(())
    }

    async fn apply_patch(
        &self,
        deployments: &Api<Deployment>,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), Error> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        retry_with_backoff(
            &Backoff::attempts(5),
            &format!("patch deployment {name}"),
            || async {
                deployments
                    .patch(name, &params, &Patch::Strategic(&patch))
                    .await
            },
        )
        .await
        .map_err(|e| {
            Error::capi_installation(format!("failed to patch deployment {name}: {e}"))
        })?;

        info!(deployment = %name, namespace = SIDERO_NAMESPACE, "Patched Sidero deployment");
        Ok(())
    }
}
