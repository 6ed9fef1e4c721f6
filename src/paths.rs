//! Well-known file locations, all derived from a single root directory.

use std::path::{Path, PathBuf};

/// Locations used by the daemon under a given root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Root directory everything else is relative to
    pub root: PathBuf,
    /// API socket
    pub socket: PathBuf,
    /// Directory holding the persisted state and its lock
    pub state_dir: PathBuf,
    /// Persisted state (mode 0600)
    pub state_file: PathBuf,
    /// Exclusive lock guarding the state file (mode 0644)
    pub lock_file: PathBuf,
    /// Optional KEY=value configuration
    pub config_file: PathBuf,
}

impl Paths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let state_dir = root.join("var/lib/fdemanagerd");

        Self {
            socket: root.join("run/fdemanagerd.socket"),
            state_file: state_dir.join("state.json"),
            lock_file: state_dir.join("state.lock"),
            config_file: root.join("etc/fdemanagerd.conf"),
            state_dir,
            root,
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new("/")
    }
}
