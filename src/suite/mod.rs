//! Sidero integration tests
//!
//! The tests run in a fixed order against the bootstrap cluster; later tests
//! rely on the state earlier ones leave behind (registered and patched
//! servers, the default Environment).

mod environment;
mod harness;
mod server;
mod server_class;

pub use environment::{default_environment, ENVIRONMENT_NAME};
pub use harness::{TestHarness, TestResult};
pub use server::{management_endpoint, server_config_patches};
pub use server_class::{default_server_class, SERVER_CLASS_NAME};

use std::fmt::Debug;
use std::net::IpAddr;
use std::time::Duration;

use kube::api::{Api, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::bootstrap::BootstrapCluster;
use crate::capi::ClusterApi;
use crate::config::Options;
use crate::kube_utils::is_not_found;
use crate::talos::NodeInfo;
use crate::Error;

/// Delay between polls in every wait
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Test names in run order
pub const TESTS: [&str; 6] = [
    "TestServerRegistration",
    "TestServerMgmtAPI",
    "TestServerPatch",
    "TestEnvironmentDefault",
    "TestServerClassDefault",
    "TestServersReady",
];

/// Everything a test needs from the environment under test
pub struct SuiteContext {
    /// Harness settings
    pub options: Options,
    /// Client for the bootstrap cluster
    pub client: Client,
    /// PXE-booted nodes
    pub nodes: Vec<NodeInfo>,
    /// Gateway of the PXE network
    pub gateway_ip: IpAddr,
    /// Bootstrap control plane address
    pub master_ip: IpAddr,
}

impl SuiteContext {
    /// Gather the context from a provisioned bootstrap cluster
    pub fn new(
        options: Options,
        bootstrap: &BootstrapCluster,
        cluster_api: &ClusterApi,
    ) -> Result<Self, Error> {
        Ok(Self {
            options,
            client: cluster_api.client(),
            nodes: bootstrap.nodes(),
            gateway_ip: bootstrap.gateway_ip()?,
            master_ip: bootstrap.master_ip()?,
        })
    }

    /// SMBIOS UUIDs of the PXE nodes
    pub fn node_uuids(&self) -> Result<Vec<String>, Error> {
        self.nodes
            .iter()
            .map(|n| {
                n.uuid
                    .map(|u| u.to_string())
                    .ok_or_else(|| Error::assertion(format!("node {} has no UUID", n.name)))
            })
            .collect()
    }
}

/// Compare two name lists ignoring order
pub fn assert_same_names(
    what: &str,
    mut expected: Vec<String>,
    mut actual: Vec<String>,
) -> Result<(), Error> {
    expected.sort();
    actual.sort();

    if expected == actual {
        Ok(())
    } else {
        Err(Error::assertion(format!(
            "{what}: expected {expected:?}, got {actual:?}"
        )))
    }
}

/// Fetch the cluster-scoped object named like `object`, creating it if absent
pub async fn get_or_create<K>(api: &Api<K>, object: &K) -> Result<K, Error>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let name = object.meta().name.clone().unwrap_or_default();

    match api.get(&name).await {
        Ok(existing) => Ok(existing),
        Err(e) if is_not_found(&e) => {
            info!(kind = %K::kind(&K::DynamicType::default()), name = %name, "Creating");
            Ok(api.create(&PostParams::default(), object).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Run every test in order; fails when any test failed
pub async fn run(ctx: &SuiteContext) -> Result<(), Error> {
    let mut harness = TestHarness::new("sidero", ctx.options.run.clone());

    harness
        .run(TESTS[0], || server::test_server_registration(ctx))
        .await;
    harness
        .run(TESTS[1], || server::test_server_mgmt_api(ctx))
        .await;
    harness.run(TESTS[2], || server::test_server_patch(ctx)).await;
    harness
        .run(TESTS[3], || environment::test_environment_default(ctx))
        .await;
    harness
        .run(TESTS[4], || server_class::test_server_class_default(ctx))
        .await;
    harness
        .run(TESTS[5], || server::test_servers_ready(ctx))
        .await;

    harness.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_compare_without_order() {
        assert_same_names(
            "servers",
            vec!["b".to_string(), "a".to_string()],
            vec!["a".to_string(), "b".to_string()],
        )
        .unwrap();

        let err = assert_same_names("servers", vec!["a".to_string()], vec!["c".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains(r#"servers: expected ["a"], got ["c"]"#));
    }

    #[test]
    fn tests_run_in_registration_first_order() {
        assert_eq!(TESTS[0], "TestServerRegistration");
        assert_eq!(TESTS[5], "TestServersReady");
        assert!(TESTS.iter().position(|t| *t == "TestServerPatch")
            < TESTS.iter().position(|t| *t == "TestServersReady"));
    }
}
