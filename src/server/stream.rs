//! Console stream pump
//!
//! One pump per server reads container output, splits it into lines, fans
//! the lines out as `server.log` events, and couples the stream back into
//! the state machine: a line carrying the started marker drives
//! `Starting → Running`, and stream termination drives the stopped path.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::LogOutput;
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::Event;

use super::server::{PowerState, Server};

/// Grace period between stream termination and the stopped report, giving
/// an in-flight stop watcher time to land first.
const TERMINATION_GRACE: Duration = Duration::from_millis(500);

/// Spawn the per-server console pump over a container output stream.
///
/// A newer pump supersedes an older one: the old task notices the epoch
/// moved on and exits without touching state.
pub fn spawn_console_pump<S>(server: Arc<Server>, output: S, marker: String)
where
    S: Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send + 'static,
{
    let epoch = server.pump_epoch.fetch_add(1, Ordering::SeqCst) + 1;
    server.tailing.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        let mut output = Box::pin(output);
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let item = tokio::select! {
                item = output.next() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = server.ctx.cancelled() => return,
            };

            if server.pump_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }

            match item {
                Ok(chunk) => {
                    buffer.extend_from_slice(&chunk.into_bytes());

                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let raw: Vec<u8> = buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&raw[..pos]);
                        handle_line(&server, line.trim_end_matches('\r'), &marker).await;
                    }
                }
                Err(e) => {
                    debug!(server = %server.uuid(), "console stream error: {}", e);
                    break;
                }
            }
        }

        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).to_string();
            handle_line(&server, line.trim_end_matches('\r'), &marker).await;
        }

        if server.pump_epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        server.tailing.store(false, Ordering::SeqCst);

        report_termination(&server, epoch).await;
    });
}

async fn handle_line(server: &Arc<Server>, line: &str, marker: &str) {
    server.events.publish(Event::log(server.uuid(), false, line));

    if server.state() == PowerState::Starting && !marker.is_empty() && line.contains(marker) {
        let _guard = match server.power_lock.acquire().await {
            Ok(guard) => guard,
            Err(_) => return,
        };

        if server.note_running() {
            server
                .events
                .publish(Event::log(server.uuid(), true, "Server is now running"));
            server.persist();
        }
    }
}

/// The stream ended: unless the server was already stopped (or still
/// installing), report the termination and land in `Stopped`.
async fn report_termination(server: &Arc<Server>, epoch: u64) {
    if matches!(
        server.state(),
        PowerState::Installing | PowerState::Stopped
    ) {
        return;
    }

    tokio::time::sleep(TERMINATION_GRACE).await;

    let _guard = match server.power_lock.acquire().await {
        Ok(guard) => guard,
        Err(_) => return,
    };

    // A restart may have taken over while this pump waited for the lock.
    if server.pump_epoch.load(Ordering::SeqCst) != epoch {
        return;
    }

    if matches!(
        server.state(),
        PowerState::Installing | PowerState::Stopped
    ) {
        return;
    }

    let uuid = server.uuid().to_string();
    server.events.publish(Event::power(&uuid, "stop", "stopped"));
    server
        .events
        .publish(Event::log(&uuid, true, "Server is no longer running"));

    let docker_id = server.docker_id();
    if !docker_id.is_empty() {
        match server.docker.inspect(&docker_id).await {
            Ok(status) if status.exit_code != 0 => {
                server.events.publish(Event::log(
                    &uuid,
                    true,
                    &format!("Server crashed with exit code {}", status.exit_code),
                ));
            }
            Ok(_) => {}
            Err(e) => warn!(server = %uuid, "failed to inspect exited container: {}", e),
        }
    }

    server.close_stdin();
    server.set_state(PowerState::Stopped);
    server.persist();
}

/// All output lines since the container last started, for the
/// `{previous: true, lines}` preamble sent to a fresh console subscriber.
pub async fn preamble(server: &Server) -> Result<Vec<String>> {
    let docker_id = server.docker_id();
    if docker_id.is_empty() {
        return Ok(Vec::new());
    }

    let status = server.docker.inspect(&docker_id).await?;
    let since = status
        .started_at
        .as_deref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.timestamp());

    let mut stream = Box::pin(server.docker.logs(&docker_id, false, since));
    let mut buffer = String::new();

    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => buffer.push_str(&String::from_utf8_lossy(&chunk.into_bytes())),
            Err(e) => {
                debug!(server = %server.uuid(), "preamble read error: {}", e);
                break;
            }
        }
    }

    Ok(buffer
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect())
}

/// Make sure a pump is tailing this server, opening a fresh log follow when
/// none is. Used when a console subscriber arrives after a daemon restart.
pub fn ensure_console_pump(server: &Arc<Server>) {
    if server.tailing.load(Ordering::SeqCst) {
        return;
    }

    if !matches!(
        server.state(),
        PowerState::Starting | PowerState::Running | PowerState::Stopping
    ) {
        return;
    }

    let docker_id = server.docker_id();
    if docker_id.is_empty() {
        return;
    }

    let marker = server
        .templates
        .get(server.record().template)
        .map(|t| t.start_config().started)
        .unwrap_or_default();

    let since = chrono::Utc::now().timestamp();
    let stream = server.docker.logs(&docker_id, true, Some(since));
    spawn_console_pump(server.clone(), stream, marker);
}
