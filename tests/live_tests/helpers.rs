//! Shared setup for the live tests

use std::sync::Arc;

use clap::Parser;

use sfyra::bootstrap::BootstrapCluster;
use sfyra::config::{Options, OptionsArgs};
use sfyra::talos::QemuProvisioner;

#[derive(Parser)]
struct LiveCli {
    #[command(flatten)]
    options: OptionsArgs,
}

/// Harness options from `SFYRA_*` environment variables and defaults
pub fn live_options() -> Options {
    let options: Options = LiveCli::parse_from(["sfyra-live"]).options.into();
    options.validate().expect("invalid SFYRA_* settings");
    options
}

/// Bootstrap cluster handle backed by the real talosctl
pub fn bootstrap_cluster(options: &Options) -> BootstrapCluster {
    let provisioner = Arc::new(QemuProvisioner::new(&options.talosctl_path));
    BootstrapCluster::new(options.clone(), provisioner).expect("no home directory")
}

/// Initialise logging once so `--nocapture` shows harness progress
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
