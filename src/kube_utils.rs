//! Shared Kubernetes utilities using kube-rs

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

use crate::retry::{Retry, RetryError};
use crate::Error;

/// Condition status value meaning "true"
pub const STATUS_TRUE: &str = "True";
/// Ready condition type
pub const CONDITION_READY: &str = "Ready";
/// Available condition type (deployments)
pub const CONDITION_AVAILABLE: &str = "Available";

/// Default interval between polls of the API server
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::core::v1::NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for k8s_openapi::api::apps::v1::DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Check if a condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Returns true if the kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Create a kube client from a kubeconfig file, optionally selecting a context
pub async fn create_client(kubeconfig: &Path, context: Option<&str>) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::internal_with_context(
            "create_client",
            format!("failed to read kubeconfig {}: {}", kubeconfig.display(), e),
        )
    })?;

    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let mut config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Check whether a namespace exists
pub async fn namespace_exists(client: &Client, name: &str) -> Result<bool, Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());

    match namespaces.get(name).await {
        Ok(_) => Ok(true),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Wait for all nodes to be ready
pub async fn wait_for_nodes_ready(client: &Client, timeout: Duration) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client.clone());

    Retry::constant(timeout, DEFAULT_POLL_INTERVAL)
        .retry("nodes to be ready", || {
            let nodes = nodes.clone();
            async move {
                let node_list = nodes
                    .list(&ListParams::default())
                    .await
                    .map_err(RetryError::expected)?;

                if node_list.items.is_empty() {
                    return Err(RetryError::expected(Error::assertion("no nodes registered")));
                }

                for node in &node_list.items {
                    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_deref());
                    if !has_condition(conditions, CONDITION_READY) {
                        return Err(RetryError::expected(Error::assertion(format!(
                            "node {:?} is not ready",
                            node.metadata.name.as_deref().unwrap_or_default()
                        ))));
                    }
                }

                Ok(())
            }
        })
        .await
}

/// Wait for a deployment to report the Available condition
pub async fn wait_for_deployment(
    client: &Client,
    name: &str,
    namespace: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);

    Retry::constant(timeout, DEFAULT_POLL_INTERVAL)
        .retry(&format!("deployment {namespace}/{name} to be available"), || {
            let deployments = deployments.clone();
            async move {
                let deployment = match deployments.get(name).await {
                    Ok(d) => d,
                    Err(e) if is_not_found(&e) => return Err(RetryError::expected(e)),
                    Err(e) => return Err(RetryError::unexpected(e)),
                };

                let conditions = deployment
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_deref());
                if has_condition(conditions, CONDITION_AVAILABLE) {
                    info!("Deployment {}/{} is available", namespace, name);
                    Ok(())
                } else {
                    Err(RetryError::expected(Error::assertion(format!(
                        "deployment {name} is not available"
                    ))))
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeCondition;

    fn condition(type_: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn has_condition_requires_matching_type_and_true_status() {
        let conds = vec![
            condition("MemoryPressure", "False"),
            condition("Ready", "True"),
        ];
        assert!(has_condition(Some(conds.as_slice()), CONDITION_READY));
        assert!(!has_condition(Some(conds.as_slice()), "DiskPressure"));

        let not_ready = vec![condition("Ready", "False")];
        assert!(!has_condition(Some(not_ready.as_slice()), CONDITION_READY));
    }

    #[test]
    fn has_condition_handles_missing_conditions() {
        assert!(!has_condition::<NodeCondition>(None, CONDITION_READY));
        assert!(!has_condition::<NodeCondition>(Some(&[]), CONDITION_READY));
    }

    #[test]
    fn is_not_found_only_matches_404() {
        let api_err = |code| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: String::new(),
                reason: String::new(),
                code,
            })
        };
        assert!(is_not_found(&api_err(404)));
        assert!(!is_not_found(&api_err(409)));
    }
}
