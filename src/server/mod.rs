//! Server lifecycle engine: the managed entity, its registry, the power
//! state machine, the install pipeline, and the console stream pump.

mod install;
mod manager;
mod power;
mod server;
mod stats;
mod stream;

pub use install::InstallProcess;
pub use manager::{CreateServer, Manager};
pub use power::PowerAction;
pub use server::{Allocation, ContainerDetails, PowerState, Resources, Server, ServerRecord};
pub use stats::StatsSnapshot;
pub use stream::{ensure_console_pump, preamble, spawn_console_pump};
