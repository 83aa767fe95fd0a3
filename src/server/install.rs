//! Server installation pipeline
//!
//! Runs the template's install script in an ephemeral container, then
//! creates the runtime container. Idempotent: a reinstall tears down the
//! old runtime container first and replays the same steps.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::docker::ContainerSpec;
use crate::error::Result;
use crate::events::{Event, EventName};

use super::power::PowerAction;
use super::server::{PowerState, Server};

/// Installation process for one server.
pub struct InstallProcess {
    server: Arc<Server>,
}

impl InstallProcess {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// Run the installation. Steps are all-or-nothing from the caller's
    /// perspective: an error aborts, leaves the last persisted intermediate
    /// state on disk, and reinstall is the prescribed recovery.
    pub async fn run(&self, reinstall: bool) -> Result<()> {
        let uuid = self.server.uuid().to_string();
        info!(server = %uuid, reinstall, "starting installation");

        let result = self.execute(reinstall).await;

        if let Err(e) = &result {
            error!(server = %uuid, "installation failed: {}", e);
            self.server.update_record(|r| {
                r.state = PowerState::Stopped;
                r.container.installed = false;
            });
            self.server.persist();
        }

        self.finalize().await;
        result
    }

    async fn execute(&self, reinstall: bool) -> Result<()> {
        let server = &self.server;
        let config = &server.config;
        let docker = &server.docker;

        if reinstall {
            let docker_id = server.docker_id();
            if !docker_id.is_empty() {
                docker.remove(&docker_id, true, true).await?;
            }
            server.update_record(|r| {
                r.docker_id.clear();
                r.container.installed = false;
            });
            server.persist();
        }

        server.set_state(PowerState::Installing);
        server.persist();

        let record = server.record();

        docker
            .pull(&record.container.image, &config.docker.registries)
            .await?;

        let volume_dir = server.volume_dir();
        std::fs::create_dir_all(&volume_dir)?;
        set_mode(&volume_dir, 0o755)?;

        let template = server.templates.get(record.template)?;

        server.events.publish(Event::new(
            EventName::ServerInstallStarted,
            json!({ "server": server.uuid() }),
        ));

        let env = record.environment_vars();

        let install_dir = config.install_dir(server.uuid());
        std::fs::create_dir_all(&install_dir)?;
        let script_path = install_dir.join("install.sh");
        std::fs::write(&script_path, &template.install_script)?;
        set_mode(&script_path, 0o644)?;
        debug!(server = %server.uuid(), "wrote install script to {}", script_path.display());

        let installer_spec = ContainerSpec {
            name: format!("{}_install", server.uuid()),
            image: record.container.image.clone(),
            hostname: "installer".into(),
            env: env.clone(),
            cmd: vec!["sh".into(), "/mnt/install/install.sh".into()],
            memory: record.resources.memory,
            cpu_shares: record.resources.cpu,
            tmpfs_size_mb: config.docker.tmpfs_size,
            userns_mode: userns_mode(config),
            ..Default::default()
        }
        .mount(&volume_dir.to_string_lossy(), "/mnt/data", false)
        .mount(&install_dir.to_string_lossy(), "/mnt/install", false);

        let installer_id = docker.create(installer_spec).await?;
        docker.start(&installer_id).await?;

        self.siphon_output(&installer_id, volume_dir.join("install.log"));

        docker.wait_not_running(&installer_id).await?;
        debug!(server = %server.uuid(), "install script finished");
        docker.remove(&installer_id, true, true).await?;

        let net = &config.docker.network;
        let allocations = record.port_allocations();

        let runtime_spec = ContainerSpec {
            name: server.uuid().to_string(),
            image: record.container.image.clone(),
            hostname: server.uuid().to_string(),
            env,
            cmd: record
                .container
                .startup_command
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            working_dir: Some("/mnt/data".into()),
            memory: record.resources.memory,
            cpu_shares: record.resources.cpu,
            port_bindings: allocations.docker_bindings(net),
            exposed: allocations.exposed(net),
            network_mode: Some(net.mode.clone()),
            dns: net.dns.clone(),
            tmpfs_size_mb: config.docker.tmpfs_size,
            userns_mode: userns_mode(config),
            ..Default::default()
        }
        .mount(&volume_dir.to_string_lossy(), "/mnt/data", false);

        let docker_id = docker.create(runtime_spec).await?;

        server.update_record(|r| {
            r.docker_id = docker_id;
            r.container.installed = true;
            r.state = PowerState::Stopped;
        });
        server.persist();

        info!(server = %server.uuid(), "installation complete");
        Ok(())
    }

    /// Append the installer's output line-by-line to `install.log`.
    fn siphon_output(&self, installer_id: &str, log_path: PathBuf) {
        let server = self.server.clone();
        let installer_id = installer_id.to_string();

        tokio::spawn(async move {
            let mut stream = Box::pin(server.docker.logs(&installer_id, true, None));

            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    warn!(server = %server.uuid(), "cannot open install log: {}", e);
                    return;
                }
            };

            let mut buffer: Vec<u8> = Vec::new();
            while let Some(item) = stream.next().await {
                let chunk = match item {
                    Ok(output) => output.into_bytes(),
                    Err(_) => break,
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if file.write_all(&line).await.is_err() {
                        return;
                    }
                }
            }

            if !buffer.is_empty() {
                buffer.push(b'\n');
                let _ = file.write_all(&buffer).await;
            }
        });
    }

    /// Deferred finalizer: announce completion, drop the staging tree, and
    /// hand off to a fire-and-forget start.
    async fn finalize(&self) {
        let server = &self.server;

        server.events.publish(Event::new(
            EventName::ServerInstallFinished,
            json!({ "server": server.uuid() }),
        ));

        let install_dir = server.config.install_dir(server.uuid());
        if install_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&install_dir) {
                warn!(server = %server.uuid(), "failed to remove install staging dir: {}", e);
            }
        }

        let server = self.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.clone().power(PowerAction::Start).await {
                let line = format!("failed to start server after install: {e}\n");
                let log_path = server.volume_dir().join("install.log");
                if let Ok(mut file) = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
                    .await
                {
                    let _ = file.write_all(line.as_bytes()).await;
                }
            }
        });
    }
}

fn userns_mode(config: &Config) -> Option<String> {
    (!config.docker.userns_mode.is_empty()).then(|| config.docker.userns_mode.clone())
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &std::path::Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
