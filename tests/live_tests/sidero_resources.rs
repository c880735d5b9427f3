//! Stories about Sidero resources on a running bootstrap cluster
//!
//! Run `sfyra test --skip-teardown` first; these tests reattach to what it
//! left behind.

use kube::api::{Api, ListParams};

use sfyra::crd::{Environment, Server, ServerClass};
use sfyra::suite::{default_server_class, get_or_create, SERVER_CLASS_NAME};

use super::helpers::{bootstrap_cluster, init_tracing, live_options};

/// Every PXE VM is registered as a Server named after its SMBIOS UUID, and
/// each carries the management API endpoint the suite configured.
#[tokio::test]
#[ignore = "requires a bootstrap cluster left by `sfyra test --skip-teardown`"]
async fn story_servers_match_pxe_pool() {
    init_tracing();
    let options = live_options();
    let mut cluster = bootstrap_cluster(&options);
    cluster.attach().await.expect("no bootstrap cluster to attach to");

    let client = cluster.client().await.unwrap();
    let servers: Api<Server> = Api::all(client);
    let list = servers.list(&ListParams::default()).await.unwrap();

    let mut names: Vec<String> = list
        .items
        .iter()
        .filter_map(|s| s.metadata.name.clone())
        .collect();
    let mut uuids = cluster.node_uuids().unwrap();
    names.sort();
    uuids.sort();
    assert_eq!(names, uuids);

    let gateway = cluster.gateway_ip().unwrap().to_string();
    for server in &list.items {
        let endpoint = server
            .spec
            .management_api
            .as_ref()
            .map(|api| api.endpoint.as_str())
            .unwrap_or_default();
        assert!(endpoint.starts_with(&gateway), "unexpected endpoint {endpoint}");
    }
}

/// Creating the default ServerClass twice leaves the existing one in place.
#[tokio::test]
#[ignore = "requires a bootstrap cluster left by `sfyra test --skip-teardown`"]
async fn story_default_server_class_is_reused() {
    init_tracing();
    let options = live_options();
    let mut cluster = bootstrap_cluster(&options);
    cluster.attach().await.expect("no bootstrap cluster to attach to");

    let classes: Api<ServerClass> = Api::all(cluster.client().await.unwrap());
    let first = get_or_create(&classes, &default_server_class()).await.unwrap();
    let second = get_or_create(&classes, &default_server_class()).await.unwrap();

    assert_eq!(first.metadata.uid, second.metadata.uid);
    assert_eq!(second.metadata.name.as_deref(), Some(SERVER_CLASS_NAME));
}

/// The default Environment reports both Talos assets as downloaded.
#[tokio::test]
#[ignore = "requires a bootstrap cluster left by `sfyra test --skip-teardown`"]
async fn story_default_environment_is_ready() {
    init_tracing();
    let options = live_options();
    let mut cluster = bootstrap_cluster(&options);
    cluster.attach().await.expect("no bootstrap cluster to attach to");

    let environments: Api<Environment> = Api::all(cluster.client().await.unwrap());
    let environment = environments.get("default").await.unwrap();

    let pending = environment.pending_assets(&[
        options.talos_kernel_url.as_str(),
        options.talos_initrd_url.as_str(),
    ]);
    assert!(pending.is_empty(), "assets not ready: {pending:?}");
}
