//! Default ServerClass

use std::time::Duration;

use kube::api::{Api, ObjectMeta};

use super::{assert_same_names, get_or_create, SuiteContext, POLL_INTERVAL};
use crate::crd::{CpuInformation, Qualifiers, ServerClass, ServerClassSpec};
use crate::retry::{Retry, RetryError};
use crate::Error;

/// Name of the ServerClass matching every harness VM
pub const SERVER_CLASS_NAME: &str = "default";

const GATHER_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// ServerClass qualifying the QEMU q35 machines the PXE pool runs
pub fn default_server_class() -> ServerClass {
    ServerClass {
        metadata: ObjectMeta {
            name: Some(SERVER_CLASS_NAME.to_string()),
            ..Default::default()
        },
        spec: ServerClassSpec {
            qualifiers: Qualifiers {
                cpu: vec![CpuInformation::new("QEMU", "pc-q35-4.2")],
                ..Default::default()
            },
            ..Default::default()
        },
        status: None,
    }
}

/// The `default` ServerClass gathers every PXE node
pub async fn test_server_class_default(ctx: &SuiteContext) -> Result<(), Error> {
    let classes: Api<ServerClass> = Api::all(ctx.client.clone());
    get_or_create(&classes, &default_server_class()).await?;

    let expected = ctx.options.nodes;
    let class = Retry::constant(GATHER_TIMEOUT, POLL_INTERVAL)
        .retry("server class to gather all servers", || {
            let classes = classes.clone();
            async move {
                let class = classes
                    .get(SERVER_CLASS_NAME)
                    .await
                    .map_err(RetryError::unexpected)?;

                let available = class.servers_available().len();
                if available != expected {
                    return Err(RetryError::expected(Error::assertion(format!(
                        "{available} != {expected}"
                    ))));
                }

                Ok(class)
            }
        })
        .await?;

    assert_same_names(
        "available servers",
        ctx.node_uuids()?,
        class.servers_available().to_vec(),
    )
}
