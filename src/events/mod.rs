//! Event bus for pub/sub messaging
//!
//! Lifecycle, console, and telemetry events fan out from here to WebSocket
//! subscribers.

mod bus;

pub use bus::{Event, EventBus, EventName};

use serde_json::json;

impl Event {
    /// A power-action event: `{server, action, status}`.
    pub fn power(uuid: &str, action: &str, status: &str) -> Self {
        Event::new(
            EventName::ServerPowerAction,
            json!({ "server": uuid, "action": action, "status": status }),
        )
    }

    /// A console/daemon log line: `{server, daemon, message}`.
    pub fn log(uuid: &str, daemon: bool, message: &str) -> Self {
        Event::new(
            EventName::ServerLog,
            json!({ "server": uuid, "daemon": daemon, "message": message }),
        )
    }
}
