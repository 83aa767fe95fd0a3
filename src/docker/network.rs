//! Managed bridge network
//!
//! Creates the daemon's container network when absent and records the
//! resolved driver and host-binding interface back into the config.

use std::collections::HashMap;

use bollard::models::{Ipam, IpamConfig};
use bollard::network::CreateNetworkOptions;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;

use super::service::DockerService;

/// Ensure the configured network exists, creating it if needed.
///
/// The resolved driver and the chosen host-binding interface are written
/// back into `config` and persisted.
pub async fn ensure_network(docker: &DockerService, config: &mut Config) -> Result<()> {
    let net = config.docker.network.clone();
    let client = docker.client();

    let existing = match client
        .inspect_network::<String>(&net.name, None)
        .await
    {
        Ok(response) => Some(response),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => None,
        Err(e) => return Err(e.into()),
    };

    let driver = match existing {
        Some(response) => {
            let driver = response.driver.unwrap_or_else(|| net.driver.clone());
            info!("network {} already exists ({})", net.name, driver);
            driver
        }
        None => {
            let mut ipam_config = vec![IpamConfig {
                subnet: Some(net.interfaces.v4.subnet.clone()),
                gateway: Some(net.interfaces.v4.gateway.clone()),
                ..Default::default()
            }];
            if net.ipv6 {
                ipam_config.push(IpamConfig {
                    subnet: Some(net.interfaces.v6.subnet.clone()),
                    gateway: Some(net.interfaces.v6.gateway.clone()),
                    ..Default::default()
                });
            }

            let mut options = HashMap::new();
            options.insert(
                "com.docker.network.bridge.enable_icc".to_string(),
                net.enable_icc.to_string(),
            );
            options.insert(
                "com.docker.network.driver.mtu".to_string(),
                net.mtu.to_string(),
            );

            let create = CreateNetworkOptions {
                name: net.name.clone(),
                driver: net.driver.clone(),
                internal: net.is_internal,
                enable_ipv6: net.ipv6,
                ipam: Ipam {
                    config: Some(ipam_config),
                    ..Default::default()
                },
                options,
                ..Default::default()
            };

            client.create_network(create).await?;
            info!("created network {}", net.name);
            net.driver.clone()
        }
    };

    config.docker.network.driver = driver;
    if config.docker.network.interface == "0.0.0.0" && !net.ispn {
        config.docker.network.interface = net.interfaces.v4.gateway.clone();
    }

    if let Err(e) = config.save() {
        warn!("failed to persist resolved network settings: {}", e);
    }

    Ok(())
}
