//! Power state machine
//!
//! Transitions between `Stopped ↔ Starting ↔ Running ↔ Stopping`, with the
//! log-watching started detector and the stop watcher. Every action holds
//! the per-server lock while it issues the runtime primitive and mutates
//! state; watchers reacquire the lock before mutating.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};
use crate::events::Event;

use super::server::{PowerState, Server};
use super::stream::spawn_console_pump;

/// Graceful-stop timeout handed to the runtime, in seconds.
const STOP_TIMEOUT_SECS: i64 = 30;

/// Power actions a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "start" => Some(PowerAction::Start),
            "stop" => Some(PowerAction::Stop),
            "restart" => Some(PowerAction::Restart),
            "kill" => Some(PowerAction::Kill),
            _ => None,
        }
    }
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Restart => "restart",
            PowerAction::Kill => "kill",
        };
        f.write_str(s)
    }
}

impl Server {
    /// Execute a power action. Transitions for one server are totally
    /// ordered by the per-server lock.
    pub async fn power(self: Arc<Self>, action: PowerAction) -> Result<()> {
        let _guard = self
            .power_lock
            .acquire()
            .await
            .map_err(|_| DaemonError::Cancelled)?;

        info!(server = %self.uuid(), %action, state = %self.state(), "power action");

        match action {
            PowerAction::Start => start_locked(&self).await,
            PowerAction::Stop => stop_locked(&self).await,
            PowerAction::Restart => restart_locked(&self).await,
            PowerAction::Kill => kill_locked(&self).await,
        }
    }

    /// `Starting → Running`, once. Returns whether this call performed the
    /// transition.
    pub(crate) fn note_running(&self) -> bool {
        if self.state() != PowerState::Starting {
            return false;
        }

        self.set_state(PowerState::Running);
        self.persist();
        self.events
            .publish(Event::power(self.uuid(), "start", "running"));
        true
    }
}

async fn start_locked(server: &Arc<Server>) -> Result<()> {
    match server.state() {
        // Already on the way up.
        PowerState::Starting | PowerState::Running => return Ok(()),
        PowerState::Installing | PowerState::Stopping => {
            return Err(DaemonError::invalid_state("start", server.state()))
        }
        PowerState::Stopped | PowerState::Unknown => {}
    }

    let record = server.record();
    if !record.container.installed || record.docker_id.is_empty() {
        return Err(DaemonError::invalid_state("start", "not installed"));
    }

    let marker = server
        .templates
        .get(record.template)
        .map(|t| t.start_config().started)
        .unwrap_or_default();

    server.set_state(PowerState::Starting);
    server.persist();
    server
        .events
        .publish(Event::power(server.uuid(), "start", "starting"));

    // Attach before starting so no early output is lost.
    let io = server.docker.attach(&record.docker_id).await?;
    server.set_stdin(io.input);

    if let Err(e) = server.docker.start(&record.docker_id).await {
        server.close_stdin();
        server.set_state(PowerState::Stopped);
        server.persist();
        return Err(e);
    }

    spawn_console_pump(server.clone(), io.output, marker.clone());
    watch_started(server, &record.docker_id, marker);

    Ok(())
}

/// Spawn the started detector, or transition immediately when the template
/// carries no marker.
fn watch_started(server: &Arc<Server>, docker_id: &str, marker: String) {
    if marker.is_empty() {
        server.note_running();
        return;
    }

    let server = server.clone();
    let docker_id = docker_id.to_string();

    tokio::spawn(async move {
        let since = chrono::Utc::now().timestamp();
        let mut stream = Box::pin(server.docker.logs(&docker_id, true, Some(since)));

        let needle = marker.as_bytes();
        let mut window: Vec<u8> = Vec::new();

        loop {
            let item = tokio::select! {
                item = stream.next() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = server.ctx.cancelled() => return,
            };

            let chunk = match item {
                Ok(output) => output.into_bytes(),
                Err(e) => {
                    debug!(server = %server.uuid(), "started watcher stream error: {}", e);
                    break;
                }
            };

            window.extend_from_slice(&chunk);

            if window
                .windows(needle.len())
                .any(|candidate| candidate == needle)
            {
                let _guard = match server.power_lock.acquire().await {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                server.note_running();
                return;
            }

            // Only the tail can still complete a straddled marker.
            if window.len() >= needle.len() {
                window.drain(..window.len() - (needle.len() - 1));
            }
        }

        // Reader closed before the marker was seen: abandon the transition;
        // the console pump reports eventual termination.
        debug!(server = %server.uuid(), "started watcher ended without marker");
    });
}

async fn stop_locked(server: &Arc<Server>) -> Result<()> {
    match server.state() {
        // Already down or on the way down.
        PowerState::Stopped | PowerState::Stopping => return Ok(()),
        PowerState::Installing => {
            return Err(DaemonError::invalid_state("stop", server.state()))
        }
        PowerState::Starting | PowerState::Running | PowerState::Unknown => {}
    }

    let record = server.record();
    if record.docker_id.is_empty() {
        server.set_state(PowerState::Stopped);
        server.persist();
        server
            .events
            .publish(Event::power(server.uuid(), "stop", "stopped"));
        return Ok(());
    }

    let stop_command = server
        .templates
        .get(record.template)
        .map(|t| t.docker.stop_command)
        .unwrap_or_default();

    server.set_state(PowerState::Stopping);
    server.persist();
    server
        .events
        .publish(Event::power(server.uuid(), "stop", "stopping"));

    if !stop_command.is_empty() && server.has_stdin() {
        server.send_command(&stop_command).await?;
        server
            .events
            .publish(Event::log(server.uuid(), false, &stop_command));
    } else {
        // The runtime stop blocks until the container is down; run it off
        // the lock so a follow-up kill is not queued behind it.
        let docker = server.docker.clone();
        let docker_id = record.docker_id.clone();
        let uuid = server.uuid().to_string();
        tokio::spawn(async move {
            if let Err(e) = docker.stop(&docker_id, STOP_TIMEOUT_SECS).await {
                warn!(server = %uuid, "runtime stop failed: {}", e);
            }
        });
    }

    watch_stopped(server, &record.docker_id);
    Ok(())
}

/// Wait for the container to leave the running state, then finish the
/// `Stopping → Stopped` transition.
fn watch_stopped(server: &Arc<Server>, docker_id: &str) {
    let server = server.clone();
    let docker_id = docker_id.to_string();

    tokio::spawn(async move {
        let waited = tokio::select! {
            waited = server.docker.wait_not_running(&docker_id) => waited,
            _ = server.ctx.cancelled() => return,
        };

        if let Err(e) = waited {
            // Transient runtime errors are not reflected in state; the next
            // inspect reconciles truth.
            warn!(server = %server.uuid(), "stop watcher wait failed: {}", e);
            return;
        }

        let _guard = match server.power_lock.acquire().await {
            Ok(guard) => guard,
            Err(_) => return,
        };

        if server.state() == PowerState::Stopped {
            return;
        }

        server.close_stdin();
        server.set_state(PowerState::Stopped);
        server.persist();
        server
            .events
            .publish(Event::power(server.uuid(), "stop", "stopped"));
    });
}

async fn kill_locked(server: &Arc<Server>) -> Result<()> {
    if server.state() != PowerState::Stopping {
        return Err(DaemonError::invalid_state("kill", server.state()));
    }

    let docker_id = server.docker_id();
    server.docker.kill(&docker_id, "KILL").await?;

    server.close_stdin();
    server.set_state(PowerState::Stopped);
    server.persist();
    server
        .events
        .publish(Event::power(server.uuid(), "kill", "stopped"));

    Ok(())
}

async fn restart_locked(server: &Arc<Server>) -> Result<()> {
    match server.state() {
        PowerState::Installing | PowerState::Stopping => {
            return Err(DaemonError::invalid_state("restart", server.state()))
        }
        // From a dead stop a restart is just a start.
        PowerState::Stopped | PowerState::Unknown => return start_locked(server).await,
        PowerState::Starting | PowerState::Running => {}
    }

    let record = server.record();
    let marker = server
        .templates
        .get(record.template)
        .map(|t| t.start_config().started)
        .unwrap_or_default();

    server.set_state(PowerState::Starting);
    server.persist();
    server
        .events
        .publish(Event::power(server.uuid(), "restart", "starting"));

    server.close_stdin();
    server
        .docker
        .restart(&record.docker_id, STOP_TIMEOUT_SECS)
        .await?;

    let io = server.docker.attach(&record.docker_id).await?;
    server.set_stdin(io.input);

    spawn_console_pump(server.clone(), io.output, marker.clone());
    watch_started(server, &record.docker_id, marker);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::docker::DockerService;
    use crate::events::EventBus;
    use crate::server::server::ServerRecord;
    use crate::templates::TemplateStore;

    #[test]
    fn parse_accepts_known_actions() {
        assert_eq!(PowerAction::parse("start"), Some(PowerAction::Start));
        assert_eq!(PowerAction::parse("STOP"), Some(PowerAction::Stop));
        assert_eq!(PowerAction::parse("Restart"), Some(PowerAction::Restart));
        assert_eq!(PowerAction::parse("kill"), Some(PowerAction::Kill));
        assert_eq!(PowerAction::parse("reboot"), None);
    }

    #[test]
    fn action_displays_lowercase() {
        assert_eq!(PowerAction::Kill.to_string(), "kill");
        assert_eq!(PowerAction::Start.to_string(), "start");
    }

    fn server_in_state(state: PowerState) -> Arc<Server> {
        let uuid = "11112222-3333-4444-5555-666677778888".to_string();
        let record = ServerRecord {
            id: uuid[..8].to_string(),
            uuid,
            state,
            ..Default::default()
        };

        let config = Arc::new(Config::default_config("config.yml"));
        let templates = Arc::new(TemplateStore::new(&config));

        Arc::new(Server::new(
            record,
            config,
            EventBus::new(),
            DockerService::new().unwrap(),
            templates,
        ))
    }

    #[tokio::test]
    async fn kill_is_rejected_outside_stopping() {
        for state in [PowerState::Running, PowerState::Stopped, PowerState::Starting] {
            let server = server_in_state(state);
            let result = server.clone().power(PowerAction::Kill).await;
            assert!(
                matches!(result, Err(DaemonError::InvalidState { .. })),
                "kill from {state} should be invalid"
            );
        }
    }

    #[tokio::test]
    async fn start_is_rejected_while_installing() {
        let server = server_in_state(PowerState::Installing);
        let result = server.clone().power(PowerAction::Start).await;
        assert!(matches!(result, Err(DaemonError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn start_from_starting_is_a_no_op() {
        let server = server_in_state(PowerState::Starting);
        server.clone().power(PowerAction::Start).await.unwrap();
        assert_eq!(server.state(), PowerState::Starting);
    }

    #[tokio::test]
    async fn stop_from_stopped_is_a_no_op() {
        let server = server_in_state(PowerState::Stopped);
        server.clone().power(PowerAction::Stop).await.unwrap();
        assert_eq!(server.state(), PowerState::Stopped);
    }

    #[tokio::test]
    async fn start_requires_an_installed_container() {
        let server = server_in_state(PowerState::Stopped);
        let result = server.clone().power(PowerAction::Start).await;
        assert!(matches!(result, Err(DaemonError::InvalidState { .. })));
        assert!(!server.has_stdin());
    }
}
