//! Server registration, patching and readiness

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use kube::api::{Api, ListParams, Patch, PatchParams};
use serde_json::json;
use tracing::info;

use super::{assert_same_names, SuiteContext, POLL_INTERVAL};
use crate::capi::FIELD_MANAGER;
use crate::config::Options;
use crate::crd::{ConfigPatch, Server};
use crate::kube_utils::is_not_found;
use crate::retry::{Retry, RetryError};
use crate::talos::{InstallConfig, RegistriesConfig};
use crate::Error;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Disk the PXE VMs install Talos to
pub const INSTALL_DISK: &str = "/dev/vda";

/// `host:port` of a node's power management API as seen from the bootstrap
/// cluster
pub fn management_endpoint(gateway: IpAddr, api_port: u16) -> String {
    SocketAddr::new(gateway, api_port).to_string()
}

/// Machine config patches every registered server receives
pub fn server_config_patches(options: &Options) -> Result<Vec<ConfigPatch>, Error> {
    let install = InstallConfig {
        disk: INSTALL_DISK.to_string(),
        image: options.talos_installer.clone(),
        bootloader: true,
        extra_kernel_args: vec![
            "console=ttyS0".to_string(),
            "reboot=k".to_string(),
            "panic=1".to_string(),
        ],
        wipe: false,
    };

    let mut patches = vec![ConfigPatch::replace("/machine/install", install.to_value()?)];

    let registries = RegistriesConfig::from_mirrors(&options.registry_mirrors);
    if !registries.is_empty() {
        patches.push(ConfigPatch::add("/machine/registries", registries.to_value()?));
    }

    Ok(patches)
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn server_names(servers: &[Server]) -> Vec<String> {
    servers
        .iter()
        .map(|s| s.metadata.name.clone().unwrap_or_default())
        .collect()
}

/// Check one listing of Servers against the expected node UUIDs
///
/// Too few or too many Servers means registration is still in progress. The
/// right count with the wrong names is a hard failure.
pub fn check_registration(
    expected_uuids: Vec<String>,
    servers: &[Server],
) -> Result<(), RetryError> {
    if servers.len() != expected_uuids.len() {
        return Err(RetryError::expected(Error::assertion(format!(
            "{} != {}",
            servers.len(),
            expected_uuids.len()
        ))));
    }

    assert_same_names("registered servers", expected_uuids, server_names(servers))
        .map_err(RetryError::unexpected)
}

/// Names of the Servers that have no config patches yet
pub fn servers_needing_patches(servers: &[Server]) -> Vec<String> {
    servers
        .iter()
        .filter(|s| s.spec.config_patches.is_empty())
        .filter_map(|s| s.metadata.name.clone())
        .collect()
}

/// Name of the first Server that is not ready, if any
pub fn first_unready(servers: &[Server]) -> Option<&str> {
    servers
        .iter()
        .find(|s| !s.is_ready())
        .map(|s| s.metadata.name.as_deref().unwrap_or_default())
}

/// Every PXE node registers exactly one Server named by its UUID
pub async fn test_server_registration(ctx: &SuiteContext) -> Result<(), Error> {
    let servers: Api<Server> = Api::all(ctx.client.clone());
    let uuids = ctx.node_uuids()?;

    Retry::constant(REGISTRATION_TIMEOUT, POLL_INTERVAL)
        .retry("servers to register", || {
            let servers = servers.clone();
            let uuids = uuids.clone();
            async move {
                let list = servers
                    .list(&ListParams::default())
                    .await
                    .map_err(RetryError::unexpected)?;

                check_registration(uuids, &list.items)
            }
        })
        .await
}

/// Point each Server at the power management API of its VM
pub async fn test_server_mgmt_api(ctx: &SuiteContext) -> Result<(), Error> {
    let servers: Api<Server> = Api::all(ctx.client.clone());

    for node in &ctx.nodes {
        let Some(uuid) = node.uuid else {
            return Err(Error::assertion(format!("node {} has no UUID", node.name)));
        };
        let name = uuid.to_string();
        servers.get(&name).await.map_err(|e| {
            if is_not_found(&e) {
                Error::assertion(format!("server {name} is not registered"))
            } else {
                Error::from(e)
            }
        })?;

        let endpoint = management_endpoint(ctx.gateway_ip, node.api_port);
        let patch = json!({ "spec": { "managementApi": { "endpoint": endpoint } } });
        servers
            .patch(&name, &patch_params(), &Patch::Merge(&patch))
            .await?;

        info!(server = %name, endpoint = %endpoint, "Set management API");
    }

    Ok(())
}

/// Give servers without config patches the install and registry patches
pub async fn test_server_patch(ctx: &SuiteContext) -> Result<(), Error> {
    let servers: Api<Server> = Api::all(ctx.client.clone());
    let patches = server_config_patches(&ctx.options)?;
    let patch = json!({ "spec": { "configPatches": patches } });

    let list = servers.list(&ListParams::default()).await?;
    for name in servers_needing_patches(&list.items) {
        servers
            .patch(&name, &patch_params(), &Patch::Merge(&patch))
            .await?;

        info!(server = %name, patches = patches.len(), "Patched server config");
    }

    Ok(())
}

/// Every Server eventually reports ready
pub async fn test_servers_ready(ctx: &SuiteContext) -> Result<(), Error> {
    let servers: Api<Server> = Api::all(ctx.client.clone());

    Retry::constant(READY_TIMEOUT, POLL_INTERVAL)
        .retry("servers to be ready", || {
            let servers = servers.clone();
            async move {
                let list = servers
                    .list(&ListParams::default())
                    .await
                    .map_err(RetryError::unexpected)?;

                match first_unready(&list.items) {
                    Some(name) => Err(RetryError::expected(Error::assertion(format!(
                        "server {name:?} is not ready"
                    )))),
                    None => Ok(()),
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryMirror;
    use crate::crd::{ServerSpec, ServerStatus};

    fn server(name: &str) -> Server {
        Server::new(name, ServerSpec::default())
    }

    fn ready(name: &str) -> Server {
        let mut server = server(name);
        server.status = Some(ServerStatus {
            ready: true,
            ..Default::default()
        });
        server
    }

    fn uuids(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn partial_registration_keeps_polling() {
        let err = check_registration(uuids(&["a", "b"]), &[server("a")]).unwrap_err();
        assert!(matches!(err, RetryError::Expected(_)));

        let err = check_registration(uuids(&["a"]), &[server("a"), server("x")]).unwrap_err();
        assert!(matches!(err, RetryError::Expected(_)));
    }

    #[test]
    fn registration_with_foreign_names_fails_hard() {
        let err = check_registration(uuids(&["a", "b"]), &[server("a"), server("c")]).unwrap_err();
        match err {
            RetryError::Unexpected(e) => {
                assert!(e.to_string().contains("registered servers"))
            }
            RetryError::Expected(e) => panic!("expected a hard failure, got {e}"),
        }
    }

    #[test]
    fn registration_ignores_listing_order() {
        check_registration(uuids(&["a", "b"]), &[server("b"), server("a")]).unwrap();
    }

    #[test]
    fn only_unpatched_servers_get_patches() {
        let mut patched = server("patched");
        patched.spec.config_patches = vec![ConfigPatch::replace("/machine/install", json!({}))];

        let servers = vec![server("fresh"), patched, server("other")];
        assert_eq!(servers_needing_patches(&servers), vec!["fresh", "other"]);
    }

    #[test]
    fn first_unready_server_is_named() {
        assert_eq!(first_unready(&[ready("a"), server("b"), server("c")]), Some("b"));
        assert_eq!(first_unready(&[ready("a"), ready("b")]), None);
        assert_eq!(first_unready(&[]), None);
    }

    #[test]
    fn management_endpoint_joins_host_and_port() {
        assert_eq!(
            management_endpoint("172.25.0.1".parse().unwrap(), 40001),
            "172.25.0.1:40001"
        );
        assert_eq!(
            management_endpoint("fd00::1".parse().unwrap(), 40001),
            "[fd00::1]:40001"
        );
    }

    #[test]
    fn install_patch_without_mirrors() {
        let options = Options {
            talos_installer: "docker.io/autonomy/installer:v0.7.0".to_string(),
            ..Default::default()
        };

        let patches = server_config_patches(&options).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].op, "replace");
        assert_eq!(patches[0].path, "/machine/install");
        assert_eq!(
            patches[0].value,
            json!({
                "disk": "/dev/vda",
                "image": "docker.io/autonomy/installer:v0.7.0",
                "bootloader": true,
                "extraKernelArgs": ["console=ttyS0", "reboot=k", "panic=1"]
            })
        );
    }

    #[test]
    fn registry_mirrors_add_a_second_patch() {
        let options = Options {
            registry_mirrors: vec![
                "docker.io=http://172.24.0.1:5000".parse::<RegistryMirror>().unwrap(),
                "k8s.gcr.io=http://172.24.0.1:5001".parse().unwrap(),
            ],
            ..Default::default()
        };

        let patches = server_config_patches(&options).unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1].op, "add");
        assert_eq!(patches[1].path, "/machine/registries");
        assert_eq!(
            patches[1].value["mirrors"]["docker.io"]["endpoints"],
            json!(["http://172.24.0.1:5000"])
        );
        assert_eq!(
            patches[1].value["mirrors"]["k8s.gcr.io"]["endpoints"],
            json!(["http://172.24.0.1:5001"])
        );
    }
}
