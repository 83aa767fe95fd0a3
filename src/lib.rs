//! Zephyr Daemon Library
//!
//! Node-level container-workload daemon: manages the lifecycle of user
//! servers (long-lived container instances with volumes, resource limits,
//! and port allocations) on a single host over a Docker-compatible runtime.

pub mod config;
pub mod docker;
pub mod error;
pub mod events;
pub mod router;
pub mod server;
pub mod system;
pub mod templates;

// Re-export commonly used types
pub use config::Config;
pub use error::DaemonError;
pub use events::EventBus;
pub use server::{Manager, Server};
