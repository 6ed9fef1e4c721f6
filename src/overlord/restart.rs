use crate::overlord::engine::StateManager;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Kinds of restart the daemon can be asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    /// Plain daemon restart
    Daemon,
    /// Stop, keeping the socket, and wait for socket activation
    Socket,
}

impl fmt::Display for RestartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartKind::Daemon => write!(f, "daemon"),
            RestartKind::Socket => write!(f, "socket"),
        }
    }
}

/// Acts on restart requests, typically by putting the daemon into its dying state
pub trait RestartHandler: Send + Sync {
    fn handle_restart(&self, kind: RestartKind);
}

/// Tracks the pending restart request, if any
pub struct RestartManager {
    handler: Option<Arc<dyn RestartHandler>>,
    pending: Mutex<Option<RestartKind>>,
}

impl RestartManager {
    pub fn new(handler: Option<Arc<dyn RestartHandler>>) -> Self {
        Self {
            handler,
            pending: Mutex::new(None),
        }
    }

    pub fn request(&self, kind: RestartKind) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if *pending != Some(kind) {
                info!(kind = %kind, "Requested restart");
            }
            *pending = Some(kind);
        }
        if let Some(handler) = &self.handler {
            handler.handle_restart(kind);
        }
    }

    pub fn pending(&self) -> Option<RestartKind> {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the pending request, returning it
    pub fn clear(&self) -> Option<RestartKind> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl StateManager for RestartManager {
    fn ensure(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
