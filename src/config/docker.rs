//! Container runtime section of the daemon config.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// IPv4/IPv6 subnet pair used when the managed network has to be created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub gateway: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterfaces {
    #[serde(default = "default_v4")]
    pub v4: SubnetConfig,
    #[serde(default = "default_v6")]
    pub v6: SubnetConfig,
}

impl Default for NetworkInterfaces {
    fn default() -> Self {
        Self {
            v4: default_v4(),
            v6: default_v6(),
        }
    }
}

fn default_v4() -> SubnetConfig {
    SubnetConfig {
        subnet: "172.17.0.0/16".into(),
        gateway: "172.17.0.1".into(),
    }
}

fn default_v6() -> SubnetConfig {
    SubnetConfig {
        subnet: "fd00:17f2:8ca3::/64".into(),
        gateway: "fd00:17f2:8ca3::1".into(),
    }
}

/// Managed container network settings.
///
/// `ispn` flags an overlay/mesh driven network; loopback port bindings are
/// dropped instead of rewritten when it is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_interface")]
    pub interface: String,

    #[serde(default = "default_dns")]
    pub dns: Vec<String>,

    #[serde(default = "default_network_name")]
    pub name: String,

    #[serde(default)]
    pub ispn: bool,

    #[serde(default = "default_true")]
    pub ipv6: bool,

    #[serde(default = "default_driver")]
    pub driver: String,

    #[serde(default = "default_mode", rename = "network_mode")]
    pub mode: String,

    #[serde(default, rename = "internal")]
    pub is_internal: bool,

    #[serde(default = "default_true", rename = "icc")]
    pub enable_icc: bool,

    #[serde(default = "default_mtu", rename = "network_mtu")]
    pub mtu: i64,

    #[serde(default)]
    pub interfaces: NetworkInterfaces,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            dns: default_dns(),
            name: default_network_name(),
            ispn: false,
            ipv6: true,
            driver: default_driver(),
            mode: default_mode(),
            is_internal: false,
            enable_icc: true,
            mtu: default_mtu(),
            interfaces: NetworkInterfaces::default(),
        }
    }
}

fn default_interface() -> String {
    "0.0.0.0".into()
}

fn default_dns() -> Vec<String> {
    vec!["1.1.1.1".into(), "1.0.0.1".into()]
}

fn default_network_name() -> String {
    "zephyr".into()
}

fn default_driver() -> String {
    "bridge".into()
}

fn default_mode() -> String {
    "zephyr".into()
}

fn default_mtu() -> i64 {
    1500
}

fn default_true() -> bool {
    true
}

/// Credentials for a private image registry, keyed by registry host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub domain_name: String,

    #[serde(default)]
    pub registries: HashMap<String, RegistryConfig>,

    #[serde(default = "default_tmpfs_size", rename = "tmpfs_size_mb")]
    pub tmpfs_size: u64,

    #[serde(default)]
    pub userns_mode: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            domain_name: String::new(),
            registries: HashMap::new(),
            tmpfs_size: default_tmpfs_size(),
            userns_mode: String::new(),
        }
    }
}

fn default_tmpfs_size() -> u64 {
    100
}
