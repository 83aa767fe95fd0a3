//! Configuration loading and persistence.

use std::path::PathBuf;

use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};
use crate::system::normalize;

use super::docker::DockerConfig;

pub const DEFAULT_PATH: &str = "config.yml";

/// Main daemon configuration, read from a YAML file at startup.
///
/// The file may be rewritten: `ensure_network` stores the resolved driver
/// and host-binding interface back into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where this config was loaded from; used by `save`.
    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub debug: bool,

    /// Node token presented by the control panel.
    pub token: String,

    /// Control panel base URL.
    #[serde(default = "default_remote")]
    pub remote: String,

    #[serde(default)]
    pub system: SystemConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub docker: DockerConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub cert: String,

    #[serde(default)]
    pub key: String,
}

/// System directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_root")]
    pub root: String,

    #[serde(default = "default_log")]
    pub log: String,

    /// Directory holding workload data volumes.
    #[serde(default = "default_volumes")]
    pub volumes: String,

    /// Directory holding daemon records (servers, templates).
    #[serde(default = "default_data")]
    pub data: String,

    #[serde(default = "default_backup")]
    pub backup: String,

    #[serde(default = "default_temp")]
    pub temp: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            log: default_log(),
            volumes: default_volumes(),
            data: default_data(),
            backup: default_backup(),
            temp: default_temp(),
        }
    }
}

fn default_remote() -> String {
    "http://127.0.0.1:8792".into()
}

fn default_volumes() -> String {
    "~/zephyr/volumes".into()
}

fn default_data() -> String {
    "~/zephyr/data".into()
}

fn default_bind() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8083
}

fn default_root() -> String {
    "~/zephyr".into()
}

fn default_log() -> String {
    "~/zephyr/logs".into()
}

fn default_backup() -> String {
    "~/zephyr/backups".into()
}

fn default_temp() -> String {
    "~/zephyr/tmp".into()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let mut config: Config =
            serde_yaml::from_str(&content).map_err(|e| DaemonError::Decode(e.to_string()))?;
        config.path = PathBuf::from(path);

        Ok(config)
    }

    /// Build the default configuration, including a fresh node token.
    pub fn default_config(path: &str) -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);

        Self {
            path: PathBuf::from(path),
            debug: false,
            token: base64::engine::general_purpose::STANDARD.encode(token),
            remote: default_remote(),
            system: SystemConfig::default(),
            server: ServerConfig::default(),
            docker: DockerConfig::default(),
        }
    }

    /// Write the config back to the file it was loaded from.
    pub fn save(&self) -> Result<()> {
        let body =
            serde_yaml::to_string(self).map_err(|e| DaemonError::Internal(e.to_string()))?;
        std::fs::write(&self.path, body)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        normalize(&self.system.data)
    }

    pub fn volumes_dir(&self) -> PathBuf {
        normalize(&self.system.volumes)
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.data_dir().join("servers")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.data_dir().join("templates")
    }

    pub fn temp_dir(&self) -> PathBuf {
        normalize(&self.system.temp)
    }

    /// Volume directory for one server.
    pub fn volume_dir(&self, uuid: &str) -> PathBuf {
        self.volumes_dir().join(uuid)
    }

    /// Ephemeral install staging directory for one server.
    pub fn install_dir(&self, uuid: &str) -> PathBuf {
        self.volumes_dir().join(format!("install_{uuid}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_token_is_32_random_bytes() {
        let a = Config::default_config("config.yml");
        let b = Config::default_config("config.yml");

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&a.token)
            .unwrap();
        assert_eq!(decoded.len(), 32);
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = Config::default_config("config.yml");
        let body = serde_yaml::to_string(&config).unwrap();
        let reloaded: Config = serde_yaml::from_str(&body).unwrap();

        assert_eq!(reloaded.token, config.token);
        assert_eq!(reloaded.server.port, 8083);
        assert_eq!(reloaded.docker.network.name, "zephyr");
        assert_eq!(reloaded.docker.network.interfaces.v4.subnet, "172.17.0.0/16");
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("token: abc\n").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.docker.tmpfs_size, 100);
        assert!(!config.docker.network.ispn);
        assert_eq!(config.docker.network.dns.len(), 2);
    }

    #[test]
    fn install_dir_is_sibling_of_volume() {
        let config = Config::default_config("config.yml");
        let install = config.install_dir("abcd");
        assert!(install.ends_with("install_abcd"));
        assert_eq!(install.parent(), config.volume_dir("abcd").parent());
    }
}
