//! Environment Custom Resource Definition
//!
//! An Environment names the kernel and initrd Sidero serves to PXE-booting
//! machines. Sidero downloads both assets and reports a `Ready` condition per
//! asset URL.

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for an Environment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metal.sidero.dev",
    version = "v1alpha1",
    kind = "Environment",
    plural = "environments",
    status = "EnvironmentStatus",
    namespaced = false
)]
pub struct EnvironmentSpec {
    /// Kernel image and command line
    #[serde(default)]
    pub kernel: Kernel,

    /// Initial ramdisk image
    #[serde(default)]
    pub initrd: Initrd,
}

/// Kernel asset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Kernel {
    /// Download URL
    #[serde(default)]
    pub url: String,
    /// Empty disables checksum verification
    #[serde(default)]
    pub sha512: String,
    /// Kernel command line arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Initrd asset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Initrd {
    /// Download URL
    #[serde(default)]
    pub url: String,
    /// Empty disables checksum verification
    #[serde(default)]
    pub sha512: String,
}

/// Observed state of an Environment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EnvironmentStatus {
    /// One condition per asset
    #[serde(default)]
    pub conditions: Vec<AssetCondition>,
}

/// Readiness of a single downloaded asset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AssetCondition {
    /// Condition type, `Ready`
    #[serde(rename = "type")]
    pub type_: String,
    /// `True` / `False`
    pub status: String,
    /// Asset the condition refers to
    #[serde(default)]
    pub url: String,
}

impl Environment {
    /// Asset URLs from `expected` that do not have a `Ready=True` condition yet
    pub fn pending_assets<'a>(&self, expected: &[&'a str]) -> BTreeSet<&'a str> {
        let mut pending: BTreeSet<&str> = expected.iter().copied().collect();

        for cond in self.status.iter().flat_map(|s| s.conditions.iter()) {
            if cond.type_ == crate::kube_utils::CONDITION_READY
                && cond.status == crate::kube_utils::STATUS_TRUE
            {
                pending.remove(cond.url.as_str());
            }
        }

        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KERNEL: &str = "https://example.com/vmlinuz";
    const INITRD: &str = "https://example.com/initramfs.xz";

    fn environment(conditions: serde_json::Value) -> Environment {
        serde_json::from_value(json!({
            "apiVersion": "metal.sidero.dev/v1alpha1",
            "kind": "Environment",
            "metadata": {"name": "default"},
            "spec": {
                "kernel": {"url": KERNEL, "sha512": "", "args": ["console=ttyS0"]},
                "initrd": {"url": INITRD, "sha512": ""}
            },
            "status": {"conditions": conditions}
        }))
        .unwrap()
    }

    #[test]
    fn all_assets_pending_without_status() {
        let env = Environment::new("default", EnvironmentSpec::default());
        let pending = env.pending_assets(&[KERNEL, INITRD]);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn only_ready_true_conditions_clear_assets() {
        let env = environment(json!([
            {"type": "Ready", "status": "True", "url": KERNEL},
            {"type": "Ready", "status": "False", "url": INITRD}
        ]));
        assert_eq!(
            env.pending_assets(&[KERNEL, INITRD]).into_iter().collect::<Vec<_>>(),
            vec![INITRD]
        );

        let env = environment(json!([
            {"type": "Ready", "status": "True", "url": KERNEL},
            {"type": "Ready", "status": "True", "url": INITRD}
        ]));
        assert!(env.pending_assets(&[KERNEL, INITRD]).is_empty());
    }

    #[test]
    fn conditions_for_other_urls_are_ignored() {
        let env = environment(json!([
            {"type": "Ready", "status": "True", "url": "https://elsewhere/vmlinuz"}
        ]));
        assert_eq!(env.pending_assets(&[KERNEL, INITRD]).len(), 2);
    }

    #[test]
    fn spec_round_trips_to_api_shape() {
        let env = environment(json!([]));
        let value = serde_json::to_value(&env.spec).unwrap();
        assert_eq!(value["kernel"]["sha512"], "");
        assert_eq!(value["initrd"]["url"], INITRD);
    }
}
