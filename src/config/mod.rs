//! Daemon configuration: YAML file loading, defaults, and path resolution.

mod config;
mod docker;

pub use config::{Config, ServerConfig, SystemConfig, TlsConfig, DEFAULT_PATH};
pub use docker::{DockerConfig, NetworkConfig, NetworkInterfaces, RegistryConfig, SubnetConfig};
