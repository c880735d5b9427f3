//! `clusterctl init` invocation

use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::command::CommandSpec;
use crate::Error;

/// Arguments of a `clusterctl init` run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InitOptions {
    /// Kubeconfig of the management cluster
    pub kubeconfig: PathBuf,
    /// Context inside the kubeconfig
    pub kubeconfig_context: String,
    /// Core provider; clusterctl picks `cluster-api` when unset
    pub core_provider: Option<String>,
    /// Bootstrap providers, e.g. `talos`
    pub bootstrap_providers: Vec<String>,
    /// Control plane providers, e.g. `talos`
    pub control_plane_providers: Vec<String>,
    /// Infrastructure providers, e.g. `sidero`
    pub infrastructure_providers: Vec<String>,
    /// Variables substituted into provider manifests
    pub env: Vec<(String, String)>,
}

/// Runs clusterctl against a management cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Clusterctl: Send + Sync {
    /// Install the core and requested providers
    async fn init(&self, options: &InitOptions) -> Result<(), Error>;
}

/// [`Clusterctl`] backed by the clusterctl binary
pub struct ClusterctlCli {
    path: PathBuf,
}

impl ClusterctlCli {
    /// Use the clusterctl binary at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The `clusterctl init` command for `options`
    pub fn init_command(&self, options: &InitOptions) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.path)
            .arg("init")
            .flag("kubeconfig", options.kubeconfig.display())
            .flag("kubeconfig-context", &options.kubeconfig_context);

        if let Some(core) = &options.core_provider {
            cmd = cmd.flag("core", core);
        }

        for (flag, providers) in [
            ("bootstrap", &options.bootstrap_providers),
            ("control-plane", &options.control_plane_providers),
            ("infrastructure", &options.infrastructure_providers),
        ] {
            if !providers.is_empty() {
                cmd = cmd.flag(flag, providers.join(","));
            }
        }

        for (key, value) in &options.env {
            cmd = cmd.env(key, value);
        }

        cmd
    }
}

#[async_trait]
impl Clusterctl for ClusterctlCli {
    async fn init(&self, options: &InitOptions) -> Result<(), Error> {
        info!(
            infrastructure = %options.infrastructure_providers.join(","),
            "Running clusterctl init"
        );
        self.init_command(options)
            .run()
            .await
            .map_err(|e| Error::capi_installation(format!("clusterctl init failed: {}", e)))
    }
}
