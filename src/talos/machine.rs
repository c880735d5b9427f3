//! Talos machine-config fragments used as Server config patches

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::RegistryMirror;
use crate::Error;

/// `machine.install` section
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfig {
    /// Target disk, e.g. `/dev/vda`
    pub disk: String,
    /// Installer container image
    pub image: String,
    /// Install the bootloader
    pub bootloader: bool,
    /// Extra arguments for the installed kernel
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_kernel_args: Vec<String>,
    /// Wipe the disk before installing
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub wipe: bool,
}

impl InstallConfig {
    /// Render as a JSON patch value
    pub fn to_value(&self) -> Result<serde_json::Value, Error> {
        Ok(serde_json::to_value(self)?)
    }
}

/// `machine.registries` section
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistriesConfig {
    /// Mirrors per registry host
    pub mirrors: BTreeMap<String, RegistryMirrorConfig>,
}

/// Endpoints serving one registry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryMirrorConfig {
    /// Mirror URLs tried in order
    pub endpoints: Vec<String>,
}

impl RegistriesConfig {
    /// Collect `registry=endpoint` flags, grouping endpoints by registry
    pub fn from_mirrors(mirrors: &[RegistryMirror]) -> Self {
        let mut config = Self::default();
        for mirror in mirrors {
            config
                .mirrors
                .entry(mirror.registry.clone())
                .or_default()
                .endpoints
                .push(mirror.endpoint.clone());
        }
        config
    }

    /// True when no mirror is configured
    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    /// Render as a JSON patch value
    pub fn to_value(&self) -> Result<serde_json::Value, Error> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn install_config_uses_talos_field_names() {
        let install = InstallConfig {
            disk: "/dev/vda".to_string(),
            image: "docker.io/autonomy/installer:v0.7.0-alpha.1".to_string(),
            bootloader: true,
            extra_kernel_args: vec!["console=ttyS0".to_string()],
            wipe: false,
        };

        assert_eq!(
            install.to_value().unwrap(),
            json!({
                "disk": "/dev/vda",
                "image": "docker.io/autonomy/installer:v0.7.0-alpha.1",
                "bootloader": true,
                "extraKernelArgs": ["console=ttyS0"]
            })
        );
    }

    #[test]
    fn registries_group_endpoints_per_host() {
        let mirrors: Vec<RegistryMirror> = [
            "docker.io=http://172.24.0.1:5000",
            "k8s.gcr.io=http://172.24.0.1:5001",
            "docker.io=http://172.24.0.1:5002",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();

        let registries = RegistriesConfig::from_mirrors(&mirrors);
        assert_eq!(
            registries.to_value().unwrap(),
            json!({
                "mirrors": {
                    "docker.io": {"endpoints": ["http://172.24.0.1:5000", "http://172.24.0.1:5002"]},
                    "k8s.gcr.io": {"endpoints": ["http://172.24.0.1:5001"]}
                }
            })
        );
    }

    #[test]
    fn no_mirrors_is_empty() {
        assert!(RegistriesConfig::from_mirrors(&[]).is_empty());
    }
}
