//! The managed server entity and its on-disk record.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::docker::{Allocations, DockerService};
use crate::error::{DaemonError, Result};
use crate::events::EventBus;
use crate::system::Locker;
use crate::templates::TemplateStore;

/// Lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Installing,
    Unknown,
}

impl Default for PowerState {
    fn default() -> Self {
        PowerState::Stopped
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerState::Running => "running",
            PowerState::Stopped => "stopped",
            PowerState::Starting => "starting",
            PowerState::Stopping => "stopping",
            PowerState::Installing => "installing",
            PowerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub image: String,
    pub startup_command: String,
    pub installed: bool,

    #[serde(default)]
    pub variables: HashMap<String, String>,
}

/// Resource limits in runtime-native units: memory in bytes, CPU in shares,
/// disk in bytes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Resources {
    pub memory: i64,
    pub cpu: i64,
    pub disk: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allocation {
    pub ip: String,
    pub port: u16,

    #[serde(default)]
    pub primary: bool,
}

/// Canonical on-disk form of a server, persisted as
/// `<data>/servers/<uuid>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Short handle: the first 8 characters of `uuid`.
    pub id: String,
    pub uuid: String,

    /// Runtime container handle; empty until installed.
    #[serde(default)]
    pub docker_id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    pub template: i64,

    pub container: ContainerDetails,

    #[serde(default)]
    pub resources: Resources,

    #[serde(default)]
    pub allocations: Vec<Allocation>,

    pub created_at: i64,
    pub updated_at: i64,

    #[serde(default)]
    pub state: PowerState,
}

impl ServerRecord {
    /// The allocation injected into the container environment: the flagged
    /// primary, or the first entry when none is flagged.
    pub fn primary_allocation(&self) -> Option<&Allocation> {
        self.allocations
            .iter()
            .find(|a| a.primary)
            .or_else(|| self.allocations.first())
    }

    /// Environment for the workload: injected identity first, then user
    /// variables, which may shadow the injected keys.
    pub fn environment(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();

        if let Some(primary) = self.primary_allocation() {
            env.insert("IP".to_string(), primary.ip.clone());
            env.insert("PORT".to_string(), primary.port.to_string());
        }
        env.insert("UUID".to_string(), self.uuid.clone());
        env.insert("NAME".to_string(), self.name.clone());
        env.insert("DESCRIPTION".to_string(), self.description.clone());
        env.insert("IMAGE".to_string(), self.container.image.clone());

        for (k, v) in &self.container.variables {
            env.insert(k.clone(), v.clone());
        }

        env
    }

    /// The same environment as `environment`, formatted `KEY=value`.
    pub fn environment_vars(&self) -> Vec<String> {
        self.environment()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }

    /// Port-allocation description for the runtime mapper.
    pub fn port_allocations(&self) -> Allocations {
        let mut mappings: HashMap<String, Vec<u16>> = HashMap::new();
        for allocation in &self.allocations {
            mappings
                .entry(allocation.ip.clone())
                .or_default()
                .push(allocation.port);
        }

        let default_mapping = self
            .primary_allocation()
            .map(|a| crate::docker::DefaultMapping {
                ip: a.ip.clone(),
                port: a.port,
            })
            .unwrap_or_default();

        Allocations {
            force_outgoing_ip: false,
            default_mapping,
            mappings,
        }
    }
}

/// A managed server: the record plus its live runtime companions.
///
/// The record is guarded by its own lock; power transitions are serialized
/// by the `Locker`. The stdin sender exists exactly while the server is in
/// Starting, Running, or Stopping.
pub struct Server {
    uuid: String,

    record: RwLock<ServerRecord>,

    pub(crate) power_lock: Locker,

    stdin: RwLock<Option<mpsc::Sender<String>>>,

    /// Guards the single console pump per server.
    pub(crate) tailing: AtomicBool,

    /// Bumped whenever a new pump takes over; a pump that observes a newer
    /// epoch stops writing and exits.
    pub(crate) pump_epoch: AtomicU64,

    /// Cancelled when the server is deleted or the daemon shuts down;
    /// watchers and pumps exit on it.
    pub(crate) ctx: CancellationToken,

    pub(crate) events: EventBus,
    pub(crate) config: Arc<Config>,
    pub(crate) docker: DockerService,
    pub(crate) templates: Arc<TemplateStore>,
}

impl Server {
    pub fn new(
        record: ServerRecord,
        config: Arc<Config>,
        events: EventBus,
        docker: DockerService,
        templates: Arc<TemplateStore>,
    ) -> Self {
        Self {
            uuid: record.uuid.clone(),
            record: RwLock::new(record),
            power_lock: Locker::new(),
            stdin: RwLock::new(None),
            tailing: AtomicBool::new(false),
            pump_epoch: AtomicU64::new(0),
            ctx: CancellationToken::new(),
            events,
            config,
            docker,
            templates,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn short_id(&self) -> String {
        self.record.read().id.clone()
    }

    pub fn state(&self) -> PowerState {
        self.record.read().state
    }

    pub fn docker_id(&self) -> String {
        self.record.read().docker_id.clone()
    }

    pub fn record(&self) -> ServerRecord {
        self.record.read().clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn volume_dir(&self) -> PathBuf {
        self.config.volume_dir(&self.uuid)
    }

    /// Mutate the record in place and bump `updated_at`.
    pub fn update_record<F: FnOnce(&mut ServerRecord)>(&self, f: F) {
        let mut record = self.record.write();
        f(&mut record);
        record.updated_at = chrono::Utc::now().timestamp();
    }

    pub fn set_state(&self, state: PowerState) {
        let mut record = self.record.write();
        if record.state != state {
            debug!(server = %self.uuid, from = %record.state, to = %state, "state change");
            record.state = state;
            record.updated_at = chrono::Utc::now().timestamp();
        }
    }

    /// Persist the record to `<data>/servers/<uuid>.json` atomically
    /// (write-temp + rename).
    pub fn save(&self) -> Result<()> {
        let snapshot = self.record.read().clone();
        let dir = self.config.servers_dir();

        let body = serde_json::to_string_pretty(&snapshot)?;
        let tmp = dir.join(format!("{}.json.tmp", self.uuid));
        let path = dir.join(format!("{}.json", self.uuid));

        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Persist, logging instead of failing: durability is best-effort,
    /// runtime truth is canonical.
    pub fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(server = %self.uuid, "failed to persist record: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Hijacked stdin
    // ------------------------------------------------------------------

    /// Install a stdin writer backed by the given attach stream. The pump
    /// task ends when the sender side is dropped or the stream dies.
    pub(crate) fn set_stdin(&self, mut input: std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>) {
        let (tx, mut rx) = mpsc::channel::<String>(32);
        *self.stdin.write() = Some(tx);

        let uuid = self.uuid.clone();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = input.write_all(line.as_bytes()).await {
                    warn!(server = %uuid, "error writing to stdin: {}", e);
                    break;
                }
                if let Err(e) = input.flush().await {
                    warn!(server = %uuid, "error flushing stdin: {}", e);
                    break;
                }
            }
            debug!(server = %uuid, "stdin pump ended");
        });
    }

    pub(crate) fn close_stdin(&self) {
        *self.stdin.write() = None;
    }

    pub fn has_stdin(&self) -> bool {
        self.stdin.read().is_some()
    }

    /// Write one command line to the container's stdin.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        let sender = self.stdin.read().as_ref().cloned();

        match sender {
            Some(sender) => sender
                .send(format!("{command}\n"))
                .await
                .map_err(|_| DaemonError::invalid_state("send command", self.state())),
            None => Err(DaemonError::invalid_state("send command", self.state())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_record() -> ServerRecord {
        let uuid = "0c32f280-1a6c-4e7f-9d4e-7f3ce2b0a111".to_string();
        ServerRecord {
            id: uuid[..8].to_string(),
            uuid,
            docker_id: String::new(),
            name: "S".into(),
            description: "test server".into(),
            template: 1,
            container: ContainerDetails {
                image: "alpine:3".into(),
                startup_command: "sh -c 'echo ready; sleep 3600'".into(),
                installed: false,
                variables: HashMap::new(),
            },
            resources: Resources {
                memory: 64 * 1024 * 1024,
                cpu: 256,
                disk: 0,
            },
            allocations: vec![Allocation {
                ip: "127.0.0.1".into(),
                port: 25565,
                primary: true,
            }],
            created_at: 1_700_000_000,
            updated_at: 1_700_000_000,
            state: PowerState::Stopped,
        }
    }

    #[test]
    fn short_id_prefixes_uuid() {
        let record = sample_record();
        assert_eq!(record.id.len(), 8);
        assert!(record.uuid.starts_with(&record.id));
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = sample_record();
        let body = serde_json::to_string_pretty(&record).unwrap();
        let reloaded: ServerRecord = serde_json::from_str(&body).unwrap();

        assert_eq!(reloaded.id, record.id);
        assert_eq!(reloaded.uuid, record.uuid);
        assert_eq!(reloaded.name, record.name);
        assert_eq!(reloaded.template, record.template);
        assert_eq!(reloaded.container.image, record.container.image);
        assert_eq!(reloaded.container.installed, record.container.installed);
        assert_eq!(reloaded.resources.memory, record.resources.memory);
        assert_eq!(reloaded.allocations.len(), 1);
        assert_eq!(reloaded.created_at, record.created_at);
        assert_eq!(reloaded.state, record.state);
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PowerState::Installing).unwrap(),
            "\"installing\""
        );
        assert_eq!(
            serde_json::from_str::<PowerState>("\"stopped\"").unwrap(),
            PowerState::Stopped
        );
    }

    #[test]
    fn primary_allocation_prefers_flag_then_first() {
        let mut record = sample_record();
        record.allocations = vec![
            Allocation {
                ip: "10.0.0.1".into(),
                port: 1000,
                primary: false,
            },
            Allocation {
                ip: "10.0.0.2".into(),
                port: 2000,
                primary: true,
            },
        ];
        assert_eq!(record.primary_allocation().unwrap().port, 2000);

        record.allocations[1].primary = false;
        assert_eq!(record.primary_allocation().unwrap().port, 1000);
    }

    #[test]
    fn environment_injects_identity_and_lets_variables_shadow() {
        let mut record = sample_record();
        record
            .container
            .variables
            .insert("K".to_string(), "V".to_string());
        record
            .container
            .variables
            .insert("PORT".to_string(), "9999".to_string());

        let env = record.environment();
        assert_eq!(env["IP"], "127.0.0.1");
        assert_eq!(env["PORT"], "9999");
        assert_eq!(env["UUID"], record.uuid);
        assert_eq!(env["NAME"], "S");
        assert_eq!(env["IMAGE"], "alpine:3");
        assert_eq!(env["K"], "V");
    }

    #[test]
    fn port_allocations_group_by_ip() {
        let mut record = sample_record();
        record.allocations.push(Allocation {
            ip: "127.0.0.1".into(),
            port: 25566,
            primary: false,
        });

        let allocations = record.port_allocations();
        assert_eq!(allocations.mappings["127.0.0.1"], vec![25565, 25566]);
        assert_eq!(allocations.default_mapping.port, 25565);
    }
}
