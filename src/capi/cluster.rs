//! Attach to a cluster provisioned through Cluster API on Sidero servers
//!
//! Cluster API objects are read as [`DynamicObject`]s; only a handful of
//! fields are needed to walk from a Cluster to the addresses of its nodes.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

use crate::crd::Server;
use crate::retry::{Retry, RetryError};
use crate::talos::{Provisioner, TalosAccess};
use crate::Error;

/// Namespace workload clusters are created in
pub const CLUSTER_NAMESPACE: &str = "default";

/// Label linking CAPI objects to their cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

const CAPI_VERSION: &str = "v1alpha3";

/// Overall time budget for the workload health check
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Delay between health check attempts
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(10);
/// Timeout of a single health check attempt
pub const HEALTH_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

fn api_resource(group: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: group.to_string(),
        version: CAPI_VERSION.to_string(),
        kind: kind.to_string(),
        api_version: format!("{group}/{CAPI_VERSION}"),
        plural: plural.to_string(),
    }
}

fn cluster_resource() -> ApiResource {
    api_resource("cluster.x-k8s.io", "Cluster", "clusters")
}

fn machine_resource() -> ApiResource {
    api_resource("cluster.x-k8s.io", "Machine", "machines")
}

fn machine_deployment_resource() -> ApiResource {
    api_resource("cluster.x-k8s.io", "MachineDeployment", "machinedeployments")
}

fn control_plane_resource() -> ApiResource {
    api_resource(
        "controlplane.cluster.x-k8s.io",
        "TalosControlPlane",
        "taloscontrolplanes",
    )
}

fn talos_config_resource() -> ApiResource {
    api_resource("bootstrap.cluster.x-k8s.io", "TalosConfig", "talosconfigs")
}

fn metal_machine_resource() -> ApiResource {
    api_resource(
        "infrastructure.cluster.x-k8s.io",
        "MetalMachine",
        "metalmachines",
    )
}

// Machines and MachineDeployments may live outside the Cluster's namespace
fn machines_api(client: &Client) -> Api<DynamicObject> {
    Api::all_with(client.clone(), &machine_resource())
}

fn machine_deployments_api(client: &Client) -> Api<DynamicObject> {
    Api::all_with(client.clone(), &machine_deployment_resource())
}

/// Namespaced reference to another object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    /// Namespace; empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
}

/// Read the reference at JSON pointer `pointer`, defaulting the namespace
pub fn object_ref(
    obj: &DynamicObject,
    pointer: &str,
    default_namespace: &str,
) -> Result<ObjectRef, Error> {
    let reference = obj.data.pointer(pointer).ok_or_else(|| {
        Error::assertion(format!(
            "{} {:?} has no {}",
            kind(obj),
            obj.metadata.name.as_deref().unwrap_or_default(),
            pointer
        ))
    })?;

    let name = reference
        .get("name")
        .and_then(|n| n.as_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::assertion(format!("reference at {pointer} has no name")))?;
    let namespace = reference
        .get("namespace")
        .and_then(|n| n.as_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(default_namespace);

    Ok(ObjectRef {
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}

fn kind(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("object")
}

fn namespace_of(obj: &DynamicObject) -> &str {
    obj.metadata.namespace.as_deref().unwrap_or(CLUSTER_NAMESPACE)
}

/// `status.selector` of a TalosControlPlane or MachineDeployment
pub fn status_selector(obj: &DynamicObject) -> Result<String, Error> {
    obj.data
        .pointer("/status/selector")
        .and_then(|s| s.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::assertion(format!(
                "{} {:?} has no status.selector yet",
                kind(obj),
                obj.metadata.name.as_deref().unwrap_or_default()
            ))
        })
}

/// Whether `obj` is marked for deletion
pub fn is_deleting(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// Machines that are running and not being deleted
pub fn is_running_machine(machine: &DynamicObject) -> bool {
    !is_deleting(machine)
        && machine.data.pointer("/status/phase").and_then(|p| p.as_str()) == Some("Running")
}

/// Point every endpoint of the current talosconfig context at `endpoints`
pub fn rewrite_talosconfig_endpoints(
    talosconfig: &str,
    endpoints: &[IpAddr],
) -> Result<String, Error> {
    let mut config: serde_yaml::Value = serde_yaml::from_str(talosconfig)?;

    let context = config
        .get("context")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::assertion("talosconfig has no current context"))?;

    let entry = config
        .get_mut("contexts")
        .and_then(|c| c.get_mut(context.as_str()))
        .and_then(|c| c.as_mapping_mut())
        .ok_or_else(|| Error::assertion(format!("talosconfig has no context {context:?}")))?;

    entry.insert(
        serde_yaml::Value::String("endpoints".to_string()),
        serde_yaml::Value::Sequence(
            endpoints
                .iter()
                .map(|ip| serde_yaml::Value::String(ip.to_string()))
                .collect(),
        ),
    );

    Ok(serde_yaml::to_string(&config)?)
}

/// A CAPI-provisioned cluster resolved to node addresses
pub struct WorkloadCluster {
    name: String,
    control_plane_nodes: Vec<IpAddr>,
    worker_nodes: Vec<IpAddr>,
    bridge_ip: IpAddr,
    talosconfig: String,
    provisioner: Arc<dyn Provisioner>,
}

impl std::fmt::Debug for WorkloadCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadCluster")
            .field("name", &self.name)
            .field("control_plane_nodes", &self.control_plane_nodes)
            .field("worker_nodes", &self.worker_nodes)
            .field("bridge_ip", &self.bridge_ip)
            .finish_non_exhaustive()
    }
}

impl WorkloadCluster {
    /// Walk the CAPI objects of cluster `name` in the management cluster
    pub async fn discover(
        client: &Client,
        name: &str,
        bridge_ip: IpAddr,
        provisioner: Arc<dyn Provisioner>,
    ) -> Result<Self, Error> {
        let clusters: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), CLUSTER_NAMESPACE, &cluster_resource());
        let cluster = clusters.get(name).await?;

        let cp_ref = object_ref(&cluster, "/spec/controlPlaneRef", namespace_of(&cluster))?;
        let control_planes: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &cp_ref.namespace, &control_plane_resource());
        let control_plane = control_planes.get(&cp_ref.name).await?;

        let machines = machines_api(client);
        let cp_machines = machines
            .list(&ListParams::default().labels(&status_selector(&control_plane)?))
            .await?
            .items;

        let first = cp_machines
            .first()
            .ok_or_else(|| Error::assertion("not enough machines found"))?;

        let config_ref = object_ref(first, "/spec/bootstrap/configRef", namespace_of(first))?;
        let talos_configs: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &config_ref.namespace, &talos_config_resource());
        let talos_config = talos_configs.get(&config_ref.name).await?;
        let talosconfig = talos_config
            .data
            .pointer("/status/talosConfig")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::assertion(format!("TalosConfig {} has no talosConfig", config_ref.name))
            })?;

        let control_plane_nodes = resolve_machines_to_ips(client, &cp_machines).await?;
        if control_plane_nodes.is_empty() {
            return Err(Error::assertion("failed to find control plane nodes"));
        }

        let deployment_list = machine_deployments_api(client)
            .list(&ListParams::default().labels(&format!("{CLUSTER_NAME_LABEL}={name}")))
            .await?
            .items;
        let [deployment] = deployment_list.as_slice() else {
            return Err(Error::assertion(format!(
                "unexpected number of machine deployments: {}",
                deployment_list.len()
            )));
        };

        let worker_machines = machines
            .list(&ListParams::default().labels(&status_selector(deployment)?))
            .await?
            .items;
        let worker_nodes = resolve_machines_to_ips(client, &worker_machines).await?;

        let talosconfig = rewrite_talosconfig_endpoints(talosconfig, &control_plane_nodes)?;

        debug!(
            cluster = %name,
            control_plane = ?control_plane_nodes,
            workers = ?worker_nodes,
            "Discovered workload cluster"
        );

        Ok(Self {
            name: name.to_string(),
            control_plane_nodes,
            worker_nodes,
            bridge_ip,
            talosconfig,
            provisioner,
        })
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bridge the cluster's machines are attached to
    pub fn bridge_ip(&self) -> IpAddr {
        self.bridge_ip
    }

    /// Control plane addresses
    pub fn control_plane_nodes(&self) -> &[IpAddr] {
        &self.control_plane_nodes
    }

    /// Worker addresses
    pub fn worker_nodes(&self) -> &[IpAddr] {
        &self.worker_nodes
    }

    /// Run the Talos health checks until they pass; early failures are
    /// expected while the cluster is still converging
    pub async fn health(&self) -> Result<(), Error> {
        let talosconfig = tempfile::Builder::new().prefix("talosconfig").tempfile()?;
        tokio::fs::write(talosconfig.path(), &self.talosconfig).await?;

        let access = TalosAccess {
            talosconfig: talosconfig.path().to_path_buf(),
            context: None,
            node: self.control_plane_nodes[0],
        };

        Retry::constant(HEALTH_TIMEOUT, HEALTH_INTERVAL)
            .retry(&format!("cluster {} health", self.name), || {
                let access = access.clone();
                async move {
                    self.provisioner
                        .health(
                            &access,
                            &self.control_plane_nodes,
                            &self.worker_nodes,
                            HEALTH_ATTEMPT_TIMEOUT,
                        )
                        .await
                        .map_err(RetryError::expected)
                }
            })
            .await
    }
}

async fn resolve_machines_to_ips(
    client: &Client,
    machines: &[DynamicObject],
) -> Result<Vec<IpAddr>, Error> {
    let servers: Api<Server> = Api::all(client.clone());
    let mut endpoints = Vec::new();

    for machine in machines.iter().filter(|m| is_running_machine(m)) {
        let infra_ref = object_ref(machine, "/spec/infrastructureRef", namespace_of(machine))?;
        let metal_machines: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &infra_ref.namespace, &metal_machine_resource());
        let metal_machine = metal_machines.get(&infra_ref.name).await?;

        if is_deleting(&metal_machine) {
            continue;
        }
        let Some(server_ref) = metal_machine
            .data
            .pointer("/spec/serverRef/name")
            .and_then(|n| n.as_str())
        else {
            debug!(machine = %infra_ref.name, "MetalMachine has no server yet");
            continue;
        };

        let server = servers.get(server_ref).await?;
        for address in server.internal_ips() {
            let ip = address.parse().map_err(|e| {
                Error::assertion(format!(
                    "server {server_ref} reports invalid address {address:?}: {e}"
                ))
            })?;
            endpoints.push(ip);
        }
    }

    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn machines_are_listed_across_namespaces() {
        let config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
        let client = Client::try_from(config).unwrap();

        assert_eq!(
            machines_api(&client).resource_url(),
            "/apis/cluster.x-k8s.io/v1alpha3/machines"
        );
        assert_eq!(
            machine_deployments_api(&client).resource_url(),
            "/apis/cluster.x-k8s.io/v1alpha3/machinedeployments"
        );
    }

    #[test]
    fn object_ref_defaults_namespace() {
        let cluster = object(json!({
            "apiVersion": "cluster.x-k8s.io/v1alpha3",
            "kind": "Cluster",
            "metadata": {"name": "management-cluster", "namespace": "default"},
            "spec": {"controlPlaneRef": {
                "apiVersion": "controlplane.cluster.x-k8s.io/v1alpha3",
                "kind": "TalosControlPlane",
                "name": "management-cluster-cp"
            }}
        }));

        let reference = object_ref(&cluster, "/spec/controlPlaneRef", "default").unwrap();
        assert_eq!(
            reference,
            ObjectRef {
                namespace: "default".to_string(),
                name: "management-cluster-cp".to_string()
            }
        );

        let err = object_ref(&cluster, "/spec/infrastructureRef", "default").unwrap_err();
        assert!(err.to_string().contains("/spec/infrastructureRef"));
    }

    #[test]
    fn object_ref_keeps_explicit_namespace() {
        let machine = object(json!({
            "apiVersion": "cluster.x-k8s.io/v1alpha3",
            "kind": "Machine",
            "metadata": {"name": "m-0", "namespace": "default"},
            "spec": {"bootstrap": {"configRef": {"name": "cfg-0", "namespace": "capi"}}}
        }));
        let reference = object_ref(&machine, "/spec/bootstrap/configRef", "default").unwrap();
        assert_eq!(reference.namespace, "capi");
        assert_eq!(reference.name, "cfg-0");
    }

    #[test]
    fn only_running_live_machines_are_resolved() {
        let running = object(json!({
            "apiVersion": "cluster.x-k8s.io/v1alpha3",
            "kind": "Machine",
            "metadata": {"name": "m-0"},
            "status": {"phase": "Running"}
        }));
        let provisioning = object(json!({
            "apiVersion": "cluster.x-k8s.io/v1alpha3",
            "kind": "Machine",
            "metadata": {"name": "m-1"},
            "status": {"phase": "Provisioning"}
        }));
        let deleting = object(json!({
            "apiVersion": "cluster.x-k8s.io/v1alpha3",
            "kind": "Machine",
            "metadata": {"name": "m-2", "deletionTimestamp": "2020-10-01T00:00:00Z"},
            "status": {"phase": "Running"}
        }));

        assert!(is_running_machine(&running));
        assert!(!is_running_machine(&provisioning));
        assert!(!is_running_machine(&deleting));
    }

    #[test]
    fn selector_must_be_reported() {
        let cp = object(json!({
            "apiVersion": "controlplane.cluster.x-k8s.io/v1alpha3",
            "kind": "TalosControlPlane",
            "metadata": {"name": "cp"},
            "status": {"selector": "cluster.x-k8s.io/cluster-name=management-cluster,cluster.x-k8s.io/control-plane="}
        }));
        assert!(status_selector(&cp).unwrap().starts_with("cluster.x-k8s.io/cluster-name="));

        let pending = object(json!({
            "apiVersion": "controlplane.cluster.x-k8s.io/v1alpha3",
            "kind": "TalosControlPlane",
            "metadata": {"name": "cp"}
        }));
        assert!(status_selector(&pending).is_err());
    }

    #[test]
    fn talosconfig_endpoints_point_at_control_plane() {
        let talosconfig = r#"
context: management-cluster
contexts:
  management-cluster:
    endpoints: []
    ca: Y2E=
    crt: Y3J0
    key: a2V5
"#;
        let ips: Vec<IpAddr> = vec!["172.25.0.3".parse().unwrap(), "172.25.0.4".parse().unwrap()];

        let rewritten = rewrite_talosconfig_endpoints(talosconfig, &ips).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rewritten).unwrap();
        let endpoints = &value["contexts"]["management-cluster"]["endpoints"];

        assert_eq!(endpoints[0].as_str(), Some("172.25.0.3"));
        assert_eq!(endpoints[1].as_str(), Some("172.25.0.4"));
        assert_eq!(
            value["contexts"]["management-cluster"]["ca"].as_str(),
            Some("Y2E=")
        );
    }

    #[test]
    fn talosconfig_without_current_context_is_rejected() {
        let err = rewrite_talosconfig_endpoints("contexts: {}\n", &[]).unwrap_err();
        assert!(err.to_string().contains("no current context"));

        let err =
            rewrite_talosconfig_endpoints("context: other\ncontexts: {}\n", &[]).unwrap_err();
        assert!(err.to_string().contains("\"other\""));
    }

    #[test]
    fn capi_resources_use_v1alpha3() {
        assert_eq!(cluster_resource().api_version, "cluster.x-k8s.io/v1alpha3");
        assert_eq!(metal_machine_resource().plural, "metalmachines");
        assert_eq!(talos_config_resource().group, "bootstrap.cluster.x-k8s.io");
    }
}
