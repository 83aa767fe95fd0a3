//! Server registry
//!
//! Owns the in-memory set of server records: load-from-disk with a state
//! refresh against the runtime, lookup by short id or full uuid, creation,
//! and deletion.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::docker::DockerService;
use crate::error::{DaemonError, Result};
use crate::events::{Event, EventBus, EventName};
use crate::templates::TemplateStore;

use super::server::{Allocation, ContainerDetails, PowerState, Resources, Server, ServerRecord};
use super::stream::spawn_console_pump;

/// Request body for creating a server.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateServer {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub template: i64,
    pub image: String,
    pub startup_command: String,

    #[serde(default)]
    pub resources: Resources,

    #[serde(default)]
    pub allocations: Vec<Allocation>,

    #[serde(default)]
    pub variables: HashMap<String, String>,
}

/// Registry of all servers managed by this node.
pub struct Manager {
    servers: DashMap<String, Arc<Server>>,

    config: Arc<Config>,
    events: EventBus,
    docker: DockerService,
    templates: Arc<TemplateStore>,
}

impl Manager {
    pub fn new(
        config: Arc<Config>,
        events: EventBus,
        docker: DockerService,
        templates: Arc<TemplateStore>,
    ) -> Self {
        Self {
            servers: DashMap::new(),
            config,
            events,
            docker,
            templates,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    /// Load every record from `<data>/servers`, refresh its state against
    /// the runtime, persist the refreshed record, and register it.
    pub async fn load(&self) -> Result<usize> {
        let dir = self.config.servers_dir();
        let mut records = Vec::new();

        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<ServerRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping server record {}: {}", path.display(), e),
            }
        }

        let semaphore = Arc::new(Semaphore::new(num_cpus::get()));
        let mut handles = Vec::new();

        for record in records {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| DaemonError::Cancelled)?;

            let config = self.config.clone();
            let events = self.events.clone();
            let docker = self.docker.clone();
            let templates = self.templates.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;

                let mut record = record;
                record.state = refreshed_state(&docker, &record.docker_id).await;

                let server = Arc::new(Server::new(record, config, events, docker, templates));
                server.persist();

                // Re-attach to containers that kept running across the
                // daemon restart so console input and stop detection work.
                if server.state() == PowerState::Running {
                    match server.docker.attach(&server.docker_id()).await {
                        Ok(io) => {
                            server.set_stdin(io.input);
                            spawn_console_pump(server.clone(), io.output, String::new());
                        }
                        Err(e) => {
                            warn!(server = %server.uuid(), "failed to re-attach: {}", e)
                        }
                    }
                }

                debug!(server = %server.uuid(), state = %server.state(), "loaded server");
                server
            }));
        }

        let mut loaded = 0;
        for handle in handles {
            if let Ok(server) = handle.await {
                self.servers.insert(server.uuid().to_string(), server);
                loaded += 1;
            }
        }

        info!("loaded {} servers", loaded);
        Ok(loaded)
    }

    /// Resolve a server by short id (8 chars or fewer) or full uuid.
    pub fn get(&self, id: &str) -> Result<Arc<Server>> {
        if id.len() <= 8 {
            self.servers
                .iter()
                .find(|entry| entry.value().short_id() == id)
                .map(|entry| entry.value().clone())
        } else {
            self.servers.get(id).map(|entry| entry.value().clone())
        }
        .ok_or_else(|| DaemonError::NotFound(format!("server {id}")))
    }

    /// Snapshot of all servers; safe to iterate while records mutate.
    pub fn all(&self) -> Vec<Arc<Server>> {
        self.servers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.servers.len()
    }

    /// Create a server record and seed its volume directory. Returns before
    /// installation begins; the caller drives the install pipeline.
    pub fn create(&self, spec: CreateServer) -> Result<Arc<Server>> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        let record = ServerRecord {
            id: uuid[..8].to_string(),
            uuid: uuid.clone(),
            docker_id: String::new(),
            name: spec.name,
            description: spec.description,
            template: spec.template,
            container: ContainerDetails {
                image: spec.image,
                startup_command: spec.startup_command,
                installed: false,
                variables: spec.variables,
            },
            resources: spec.resources,
            allocations: spec.allocations,
            created_at: now,
            updated_at: now,
            state: PowerState::Stopped,
        };

        std::fs::create_dir_all(self.config.volume_dir(&uuid))?;

        let server = Arc::new(Server::new(
            record,
            self.config.clone(),
            self.events.clone(),
            self.docker.clone(),
            self.templates.clone(),
        ));
        server.save()?;

        self.servers.insert(uuid.clone(), server.clone());
        self.events.publish(Event::new(
            EventName::ServerCreated,
            json!({ "server": uuid }),
        ));

        info!(server = %uuid, "created server");
        Ok(server)
    }

    /// Remove a server: its runtime container, volume directory, and
    /// on-disk record.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let server = self.get(id)?;
        let uuid = server.uuid().to_string();

        server.ctx.cancel();

        let docker_id = server.docker_id();
        if !docker_id.is_empty() {
            if let Err(e) = self.docker.remove(&docker_id, true, false).await {
                warn!(server = %uuid, "failed to remove container: {}", e);
            }
        }

        let volume_dir = server.volume_dir();
        if volume_dir.exists() {
            std::fs::remove_dir_all(&volume_dir)?;
        }

        let record_path = self.config.servers_dir().join(format!("{uuid}.json"));
        if record_path.exists() {
            std::fs::remove_file(&record_path)?;
        }

        self.servers.remove(&uuid);
        self.events.publish(Event::new(
            EventName::ServerDeleted,
            json!({ "server": uuid }),
        ));

        info!(server = %uuid, "deleted server");
        Ok(())
    }

    /// Best-effort stop of everything that is up, then tear down the bus.
    pub async fn shutdown(&self) {
        info!("shutting down all servers");

        for server in self.all() {
            if matches!(
                server.state(),
                PowerState::Starting | PowerState::Running | PowerState::Stopping
            ) {
                if let Err(e) = server.clone().power(super::power::PowerAction::Stop).await {
                    warn!(server = %server.uuid(), "error stopping server: {}", e);
                }
                server.close_stdin();
            }
            server.ctx.cancel();
        }

        self.events.close();
    }
}

/// Map the runtime's view of a container onto a lifecycle state.
async fn refreshed_state(docker: &DockerService, docker_id: &str) -> PowerState {
    if docker_id.is_empty() {
        return PowerState::Stopped;
    }

    match docker.inspect(docker_id).await {
        Ok(status) => state_from_status(&status.status),
        Err(e) => {
            debug!("inspect during load failed: {}", e);
            PowerState::Unknown
        }
    }
}

fn state_from_status(status: &str) -> PowerState {
    match status {
        "running" => PowerState::Running,
        "exited" | "created" | "dead" => PowerState::Stopped,
        _ => PowerState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(dir: &std::path::Path) -> Manager {
        let mut config = Config::default_config("config.yml");
        config.system.data = dir.join("data").to_string_lossy().into_owned();
        config.system.volumes = dir.join("volumes").to_string_lossy().into_owned();
        std::fs::create_dir_all(config.servers_dir()).unwrap();
        std::fs::create_dir_all(config.templates_dir()).unwrap();
        std::fs::create_dir_all(config.volumes_dir()).unwrap();

        let config = Arc::new(config);
        let templates = Arc::new(TemplateStore::new(&config));

        Manager::new(
            config,
            EventBus::new(),
            DockerService::new().unwrap(),
            templates,
        )
    }

    fn create_spec(name: &str) -> CreateServer {
        CreateServer {
            name: name.into(),
            description: String::new(),
            template: 1,
            image: "alpine:3".into(),
            startup_command: "sh -c 'sleep 1'".into(),
            resources: Resources::default(),
            allocations: vec![Allocation {
                ip: "127.0.0.1".into(),
                port: 25565,
                primary: true,
            }],
            variables: HashMap::new(),
        }
    }

    #[test]
    fn status_mapping_matches_runtime_view() {
        assert_eq!(state_from_status("running"), PowerState::Running);
        assert_eq!(state_from_status("exited"), PowerState::Stopped);
        assert_eq!(state_from_status("created"), PowerState::Stopped);
        assert_eq!(state_from_status("dead"), PowerState::Stopped);
        assert_eq!(state_from_status("paused"), PowerState::Unknown);
        assert_eq!(state_from_status(""), PowerState::Unknown);
    }

    #[tokio::test]
    async fn create_persists_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        let mut rx = manager.events().subscribe("test");

        let server = manager.create(create_spec("S")).unwrap();
        let uuid = server.uuid().to_string();

        assert_eq!(&uuid[..8], server.short_id().as_str());
        assert!(!server.record().container.installed);

        let record_path = manager.config.servers_dir().join(format!("{uuid}.json"));
        assert!(record_path.exists());
        assert!(manager.config.volume_dir(&uuid).exists());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, EventName::ServerCreated);
        assert_eq!(event.server(), Some(uuid.as_str()));
    }

    #[tokio::test]
    async fn get_resolves_short_id_and_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());

        let server = manager.create(create_spec("S")).unwrap();
        let uuid = server.uuid().to_string();

        assert_eq!(manager.get(&uuid).unwrap().uuid(), uuid);
        assert_eq!(manager.get(&uuid[..8]).unwrap().uuid(), uuid);
        assert!(matches!(
            manager.get("ffffffff"),
            Err(DaemonError::NotFound(_))
        ));
        assert!(matches!(
            manager.get("ffffffff-ffff-ffff-ffff-ffffffffffff"),
            Err(DaemonError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn saved_record_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());

        let server = manager.create(create_spec("S")).unwrap();
        let uuid = server.uuid().to_string();

        let record_path = manager.config.servers_dir().join(format!("{uuid}.json"));
        let reloaded: ServerRecord =
            serde_json::from_str(&std::fs::read_to_string(record_path).unwrap()).unwrap();

        let original = server.record();
        assert_eq!(reloaded.uuid, original.uuid);
        assert_eq!(reloaded.id, original.id);
        assert_eq!(reloaded.name, original.name);
        assert_eq!(reloaded.template, original.template);
        assert_eq!(reloaded.allocations.len(), original.allocations.len());
        assert_eq!(reloaded.state, original.state);
    }
}
