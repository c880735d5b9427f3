//! Strategic merge patches adapting the Sidero deployments to the harness
//!
//! Both deployments move to the host network so PXE-booted VMs on the second
//! bridge can reach them through the control plane address, and switch to the
//! Recreate strategy since host ports cannot be shared during a rollout.

use std::net::IpAddr;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;
use serde_json::{json, Value};

use crate::Error;

/// Field manager recorded on harness patches
pub const FIELD_MANAGER: &str = "sfyra";

/// Sidero metadata server deployment
pub const METADATA_SERVER: &str = "sidero-metadata-server";

/// Sidero controller manager deployment
pub const CONTROLLER_MANAGER: &str = "sidero-controller-manager";

/// Port the metadata server listens on in the harness
pub const METADATA_SERVER_PORT: i32 = 9091;

fn container(deployment: &Deployment, index: usize) -> Result<&Container, Error> {
    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.containers.get(index))
        .ok_or_else(|| {
            Error::capi_installation(format!("deployment {name} has no container #{index}"))
        })
}

fn with_args(container: &Container, wanted: &[String]) -> Vec<String> {
    let mut args = container.args.clone().unwrap_or_default();
    for arg in wanted {
        if !args.contains(arg) {
            args.push(arg.clone());
        }
    }
    args
}

fn deployment_patch(container_patch: Value) -> Value {
    json!({
        "spec": {
            "strategy": {
                "type": "Recreate",
                "rollingUpdate": null
            },
            "template": {
                "spec": {
                    "hostNetwork": true,
                    "containers": [container_patch]
                }
            }
        }
    })
}

/// Patch for `sidero-metadata-server`: listen on 9091 on the host
pub fn metadata_server_patch(deployment: &Deployment) -> Result<Value, Error> {
    let container = container(deployment, 0)?;
    let args = with_args(container, &[format!("--port={METADATA_SERVER_PORT}")]);

    Ok(deployment_patch(json!({
        "name": container.name,
        "args": args,
        "ports": [
            { "$patch": "replace" },
            {
                "name": "http",
                "containerPort": METADATA_SERVER_PORT,
                "hostPort": METADATA_SERVER_PORT,
                "protocol": "TCP"
            }
        ]
    })))
}

/// Patch for `sidero-controller-manager`: serve on `api_endpoint`, keep
/// metrics on localhost and enable leader election
pub fn controller_manager_patch(
    deployment: &Deployment,
    api_endpoint: IpAddr,
) -> Result<Value, Error> {
    let container = container(deployment, 1)?;
    let args = with_args(
        container,
        &[
            format!("--api-endpoint={api_endpoint}"),
            "--metrics-addr=127.0.0.1:8080".to_string(),
            "--enable-leader-election".to_string(),
        ],
    );

    Ok(deployment_patch(json!({
        "name": container.name,
        "args": args,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(containers: Value) -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "sidero-test", "namespace": "sidero-system"},
            "spec": {
                "selector": {"matchLabels": {"app": "sidero"}},
                "strategy": {"type": "RollingUpdate"},
                "template": {
                    "metadata": {"labels": {"app": "sidero"}},
                    "spec": {"containers": containers}
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn metadata_server_gets_port_host_network_and_recreate() {
        let d = deployment(json!([
            {"name": "manager", "image": "sidero", "args": ["--metrics-addr=:8081"],
             "ports": [{"containerPort": 8080, "name": "http"}]}
        ]));

        let patch = metadata_server_patch(&d).unwrap();
        assert_eq!(patch["spec"]["strategy"]["type"], "Recreate");
        assert!(patch["spec"]["strategy"]["rollingUpdate"].is_null());
        assert_eq!(patch["spec"]["template"]["spec"]["hostNetwork"], true);

        let container = &patch["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["name"], "manager");
        assert_eq!(container["args"], json!(["--metrics-addr=:8081", "--port=9091"]));
        assert_eq!(container["ports"][0], json!({"$patch": "replace"}));
        assert_eq!(
            container["ports"][1],
            json!({"name": "http", "containerPort": 9091, "hostPort": 9091, "protocol": "TCP"})
        );
    }

    #[test]
    fn metadata_server_port_arg_is_added_once() {
        let d = deployment(json!([
            {"name": "manager", "args": ["--port=9091"]}
        ]));
        let patch = metadata_server_patch(&d).unwrap();
        assert_eq!(
            patch["spec"]["template"]["spec"]["containers"][0]["args"],
            json!(["--port=9091"])
        );
    }

    #[test]
    fn controller_manager_patches_second_container() {
        let d = deployment(json!([
            {"name": "kube-rbac-proxy", "args": ["--secure-listen-address=0.0.0.0:8443"]},
            {"name": "manager", "args": ["--enable-leader-election"]}
        ]));

        let patch = controller_manager_patch(&d, "172.24.0.2".parse().unwrap()).unwrap();
        let container = &patch["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["name"], "manager");
        assert_eq!(
            container["args"],
            json!([
                "--enable-leader-election",
                "--api-endpoint=172.24.0.2",
                "--metrics-addr=127.0.0.1:8080"
            ])
        );
        assert!(container.get("ports").is_none());
        assert_eq!(patch["spec"]["strategy"]["type"], "Recreate");
    }

    #[test]
    fn controller_manager_patch_is_stable_on_reapply() {
        let d = deployment(json!([
            {"name": "proxy"},
            {"name": "manager", "args": [
                "--api-endpoint=172.24.0.2",
                "--metrics-addr=127.0.0.1:8080",
                "--enable-leader-election"
            ]}
        ]));

        let patch = controller_manager_patch(&d, "172.24.0.2".parse().unwrap()).unwrap();
        assert_eq!(
            patch["spec"]["template"]["spec"]["containers"][0]["args"]
                .as_array()
                .map(|a| a.len()),
            Some(3)
        );
    }

    #[test]
    fn missing_container_is_an_error() {
        let d = deployment(json!([{"name": "manager"}]));
        let err = controller_manager_patch(&d, "172.24.0.2".parse().unwrap()).unwrap_err();
        assert!(err.to_string().contains("has no container #1"));
    }
}
