//! Shared runtime primitives: power locking and path handling.

mod locker;
mod path;

pub use locker::{Locker, LockerError, LockerGuard};
pub use path::normalize;
