//! Sfyra - Sidero integration test runner

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sfyra::bootstrap::BootstrapCluster;
use sfyra::capi::{ClusterApi, ClusterctlCli, WorkloadCluster};
use sfyra::config::{Options, OptionsArgs};
use sfyra::suite::{self, SuiteContext};
use sfyra::talos::{Provisioner, QemuProvisioner};

/// Sfyra - integration tests for Sidero bare-metal provisioning
#[derive(Parser, Debug)]
#[command(name = "sfyra", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the integration tests
    ///
    /// Provisions the bootstrap cluster and PXE node pool (or reuses ones
    /// left behind by an earlier `--skip-teardown` run), installs Cluster
    /// API with Sidero and runs the test suite.
    Test(OptionsArgs),

    /// Check the health of a cluster created through Cluster API
    ///
    /// Attaches to a running bootstrap cluster without creating anything.
    ClusterHealth {
        /// Name of the Cluster API cluster
        #[arg(long, env = "SFYRA_CLUSTER", default_value = "management-cluster")]
        cluster: String,

        #[command(flatten)]
        options: OptionsArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test(args) => run_tests(args.into()).await,
        Commands::ClusterHealth { cluster, options } => {
            run_cluster_health(&cluster, options.into()).await
        }
    }
}

fn provisioner(options: &Options) -> Arc<dyn Provisioner> {
    Arc::new(QemuProvisioner::new(&options.talosctl_path))
}

/// Provision, install and test; tears down unless asked not to
async fn run_tests(options: Options) -> anyhow::Result<()> {
    options.validate()?;

    let mut bootstrap = BootstrapCluster::new(options.clone(), provisioner(&options))?;

    let result = tokio::select! {
        result = setup_and_test(&mut bootstrap, &options) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, aborting run");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    if options.skip_teardown {
        info!(cluster = %bootstrap.name(), "Skipping teardown");
    } else if let Err(e) = bootstrap.tear_down().await {
        error!(error = %e, "Failed to tear down bootstrap cluster");
    }

    result
}

async fn setup_and_test(bootstrap: &mut BootstrapCluster, options: &Options) -> anyhow::Result<()> {
    bootstrap.setup().await?;

    let clusterctl = Arc::new(ClusterctlCli::new(&options.clusterctl_path));
    let cluster_api = ClusterApi::new(bootstrap, options.clone(), clusterctl).await?;
    cluster_api.install().await?;

    let ctx = SuiteContext::new(options.clone(), bootstrap, &cluster_api)?;
    suite::run(&ctx)
        .await
        .map_err(|e| anyhow::anyhow!("test failure: {}", e))
}

/// Discover a Cluster API cluster on the bootstrap cluster and wait for it
/// to become healthy
async fn run_cluster_health(name: &str, options: Options) -> anyhow::Result<()> {
    let provisioner = provisioner(&options);
    let mut bootstrap = BootstrapCluster::new(options, provisioner.clone())?;
    bootstrap.attach().await?;

    let client = bootstrap.client().await?;
    let cluster =
        WorkloadCluster::discover(&client, name, bootstrap.gateway_ip()?, provisioner).await?;

    cluster.health().await?;
    info!(
        cluster = %cluster.name(),
        control_plane = ?cluster.control_plane_nodes(),
        workers = ?cluster.worker_nodes(),
        bridge = %cluster.bridge_ip(),
        "Cluster is healthy"
    );
    Ok(())
}
