//! Default Environment

use std::net::IpAddr;
use std::time::Duration;

use kube::api::{Api, ObjectMeta};

use super::{get_or_create, SuiteContext, POLL_INTERVAL};
use crate::capi::METADATA_SERVER_PORT;
use crate::config::Options;
use crate::crd::{Environment, EnvironmentSpec, Initrd, Kernel};
use crate::retry::{Retry, RetryError};
use crate::talos::KernelCmdline;
use crate::Error;

/// Name of the Environment Sidero falls back to
pub const ENVIRONMENT_NAME: &str = "default";

const READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The `default` Environment booting Talos from the configured assets
pub fn default_environment(options: &Options, master_ip: IpAddr) -> Environment {
    let mut cmdline = KernelCmdline::hardened();
    cmdline
        .append("console", "ttyS0")
        .append("reboot", "k")
        .append("panic", "1")
        .append("talos.platform", "metal")
        .append(
            "talos.config",
            format!("http://{master_ip}:{METADATA_SERVER_PORT}/configdata?uuid="),
        );

    Environment {
        metadata: ObjectMeta {
            name: Some(ENVIRONMENT_NAME.to_string()),
            ..Default::default()
        },
        spec: EnvironmentSpec {
            kernel: Kernel {
                url: options.talos_kernel_url.clone(),
                sha512: String::new(),
                args: cmdline.strings(),
            },
            initrd: Initrd {
                url: options.talos_initrd_url.clone(),
                sha512: String::new(),
            },
        },
        status: None,
    }
}

/// The `default` Environment exists and both of its assets are downloaded
pub async fn test_environment_default(ctx: &SuiteContext) -> Result<(), Error> {
    let environments: Api<Environment> = Api::all(ctx.client.clone());
    get_or_create(
        &environments,
        &default_environment(&ctx.options, ctx.master_ip),
    )
    .await?;

    let assets = [
        ctx.options.talos_kernel_url.as_str(),
        ctx.options.talos_initrd_url.as_str(),
    ];

    Retry::constant(READY_TIMEOUT, POLL_INTERVAL)
        .retry("environment assets to be ready", || {
            let environments = environments.clone();
            async move {
                let environment = environments
                    .get(ENVIRONMENT_NAME)
                    .await
                    .map_err(RetryError::unexpected)?;

                let pending = environment.pending_assets(&assets);
                if pending.is_empty() {
                    Ok(())
                } else {
                    Err(RetryError::expected(Error::assertion(format!(
                        "some assets are not ready: {pending:?}"
                    ))))
                }
            }
        })
        .await
}
