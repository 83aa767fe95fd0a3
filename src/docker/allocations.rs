//! Port allocation mapping
//!
//! Translates a server's port allocations into runtime port bindings and
//! exposed ports, honoring the managed network's binding policy.

use std::collections::HashMap;
use std::net::IpAddr;

use bollard::models::PortBinding;
use serde::{Deserialize, Serialize};

use crate::config::NetworkConfig;

/// Bindings keyed by `<port>/<proto>`.
pub type PortMap = HashMap<String, Vec<PortBinding>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultMapping {
    pub ip: String,
    pub port: u16,
}

/// A port-allocation description for one server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allocations {
    #[serde(default)]
    pub force_outgoing_ip: bool,

    #[serde(default, rename = "default")]
    pub default_mapping: DefaultMapping,

    #[serde(default)]
    pub mappings: HashMap<String, Vec<u16>>,
}

impl Allocations {
    /// Raw bindings: one TCP and one UDP entry per (ip, port) pair.
    pub fn bindings(&self) -> PortMap {
        let mut out = PortMap::new();

        for (ip, ports) in &self.mappings {
            for port in ports {
                if *port == 0 {
                    continue;
                }

                let binding = PortBinding {
                    host_ip: Some(ip.clone()),
                    host_port: Some(port.to_string()),
                };

                out.entry(format!("{port}/tcp"))
                    .or_default()
                    .push(binding.clone());
                out.entry(format!("{port}/udp")).or_default().push(binding);
            }
        }

        out
    }

    /// Bindings as handed to the runtime: loopback entries are rewritten to
    /// the managed bridge interface, or dropped entirely on an overlay/mesh
    /// network.
    pub fn docker_bindings(&self, net: &NetworkConfig) -> PortMap {
        let mut out = PortMap::new();

        for (port, bindings) in self.bindings() {
            let rewritten: Vec<PortBinding> = bindings
                .into_iter()
                .filter_map(|binding| {
                    if binding.host_ip.as_deref() != Some("127.0.0.1") {
                        return Some(binding);
                    }
                    if net.ispn {
                        return None;
                    }
                    Some(PortBinding {
                        host_ip: Some(net.interface.clone()),
                        host_port: binding.host_port,
                    })
                })
                .collect();

            if !rewritten.is_empty() {
                out.insert(port, rewritten);
            }
        }

        out
    }

    /// The set of `<port>/<proto>` keys to expose on the container.
    pub fn exposed(&self, net: &NetworkConfig) -> Vec<String> {
        self.docker_bindings(net).into_keys().collect()
    }
}

/// Whether traffic from `ip` should be forced out through the node's
/// outgoing interface: true only for non-loopback RFC1918 addresses on a
/// non-overlay network.
pub fn should_force_outgoing(ip: &str, net: &NetworkConfig) -> bool {
    let addr: IpAddr = match ip.parse() {
        Ok(addr) => addr,
        Err(_) => return false,
    };

    if addr.is_loopback() || net.ispn {
        return false;
    }

    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(ip: &str, ports: &[u16]) -> Allocations {
        let mut mappings = HashMap::new();
        mappings.insert(ip.to_string(), ports.to_vec());
        Allocations {
            mappings,
            ..Default::default()
        }
    }

    fn net(interface: &str, ispn: bool) -> NetworkConfig {
        NetworkConfig {
            interface: interface.into(),
            ispn,
            ..Default::default()
        }
    }

    #[test]
    fn bindings_cover_tcp_and_udp() {
        let bindings = alloc("10.0.0.5", &[25565]).bindings();
        assert_eq!(bindings.len(), 2);

        for key in ["25565/tcp", "25565/udp"] {
            let entries = &bindings[key];
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].host_ip.as_deref(), Some("10.0.0.5"));
            assert_eq!(entries[0].host_port.as_deref(), Some("25565"));
        }
    }

    #[test]
    fn loopback_rewrites_to_bridge_interface() {
        let bindings = alloc("127.0.0.1", &[8080]).docker_bindings(&net("172.17.0.1", false));

        assert_eq!(bindings.len(), 2);
        for key in ["8080/tcp", "8080/udp"] {
            let entries = &bindings[key];
            assert_eq!(entries[0].host_ip.as_deref(), Some("172.17.0.1"));
            assert_eq!(entries[0].host_port.as_deref(), Some("8080"));
        }
    }

    #[test]
    fn loopback_drops_on_ispn() {
        let bindings = alloc("127.0.0.1", &[8080]).docker_bindings(&net("172.17.0.1", true));
        assert!(bindings.is_empty());
    }

    #[test]
    fn non_loopback_passes_through() {
        let bindings = alloc("192.168.1.2", &[7777]).docker_bindings(&net("172.17.0.1", false));
        assert_eq!(bindings["7777/tcp"][0].host_ip.as_deref(), Some("192.168.1.2"));
    }

    #[test]
    fn exposed_matches_docker_bindings_keyset() {
        for ispn in [false, true] {
            let a = alloc("127.0.0.1", &[8080, 9090]);
            let n = net("172.17.0.1", ispn);

            let mut exposed = a.exposed(&n);
            let mut keys: Vec<String> = a.docker_bindings(&n).into_keys().collect();
            exposed.sort();
            keys.sort();
            assert_eq!(exposed, keys);
        }
    }

    #[test]
    fn zero_port_is_skipped() {
        assert!(alloc("10.0.0.5", &[0]).bindings().is_empty());
    }

    #[test]
    fn force_outgoing_boundaries() {
        let plain = net("172.17.0.1", false);
        let ispn = net("172.17.0.1", true);

        assert!(!should_force_outgoing("127.0.0.1", &plain));
        assert!(!should_force_outgoing("127.0.0.1", &ispn));
        assert!(should_force_outgoing("10.0.0.5", &plain));
        assert!(!should_force_outgoing("10.0.0.5", &ispn));
        assert!(should_force_outgoing("172.16.4.1", &plain));
        assert!(should_force_outgoing("192.168.1.9", &plain));
        assert!(!should_force_outgoing("8.8.8.8", &plain));
        assert!(!should_force_outgoing("8.8.8.8", &ispn));
        assert!(!should_force_outgoing("not-an-ip", &plain));
    }
}
