//! Control plane of a socket-activated system daemon.
//!
//! - `overlord`: persisted state, the ensure loop and its managers
//! - `state`: the JSON state container and its changes
//! - `daemon`: the API socket, access-checked request routing and lifecycle
//! - `paths`: file locations under the daemon root

pub mod daemon;
pub mod overlord;
pub mod paths;
pub mod state;

pub use daemon::{Daemon, DaemonConfig, DaemonError};
pub use overlord::{Overlord, OverlordError, Timings};
pub use paths::Paths;
pub use state::{Change, State, Status};
