//! Container runtime layer: the shared Docker client wrapper, port
//! allocation mapping, and the managed bridge network.

mod allocations;
mod network;
mod service;

pub use allocations::{should_force_outgoing, Allocations, DefaultMapping, PortMap};
pub use network::ensure_network;
pub use service::{AttachedIo, ContainerSpec, ContainerStatus, DockerService, MountSpec};
