use crate::state::State;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::error;

/// A participant in the ensure cycle
pub trait StateManager: Send + Sync {
    /// Reconcile towards the desired state. Errors are logged by the engine
    /// and never abort the cycle.
    fn ensure(&self) -> anyhow::Result<()>;

    /// Block until background activities started by `ensure` are idle
    fn wait(&self) {}

    /// Stop background activities; called once at shutdown
    fn stop(&self) {}
}

/// Errors collected from one or more ensure cycles
#[derive(Debug, Error)]
#[error("state ensure errors: [{}]", join(.errors))]
pub struct EnsureError {
    pub errors: Vec<anyhow::Error>,
}

fn join(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs the registered managers, in registration order
pub struct StateEngine {
    state: State,
    managers: RwLock<Vec<Arc<dyn StateManager>>>,
    stopped: AtomicBool,
}

impl StateEngine {
    pub fn new(state: State) -> Self {
        Self {
            state,
            managers: RwLock::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn add_manager(&self, manager: Arc<dyn StateManager>) {
        self.managers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(manager);
    }

    fn snapshot(&self) -> Vec<Arc<dyn StateManager>> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One ensure cycle over every manager
    pub fn ensure(&self) -> Result<(), EnsureError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EnsureError {
                errors: vec![anyhow::anyhow!("state engine already stopped")],
            });
        }
        let mut errors = Vec::new();
        for manager in self.snapshot() {
            if let Err(err) = manager.ensure() {
                error!(error = %err, "state ensure error");
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EnsureError { errors })
        }
    }

    pub fn wait(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        for manager in self.snapshot() {
            manager.wait();
        }
    }

    /// Stop every manager. Subsequent ensures fail.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for manager in self.snapshot() {
            manager.stop();
        }
    }
}

impl fmt::Debug for StateEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateEngine")
            .field("managers", &self.snapshot().len())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Backend;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NullBackend;

    impl Backend for NullBackend {
        fn checkpoint(&self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn ensure_before(&self, _d: Duration) {}
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl StateManager for Recorder {
        fn ensure(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("ensure:{}", self.name));
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(())
        }

        fn wait(&self) {
            self.log.lock().unwrap().push(format!("wait:{}", self.name));
        }

        fn stop(&self) {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
        }
    }

    fn engine_with(fail: [bool; 2]) -> (StateEngine, Arc<Mutex<Vec<String>>>) {
        let engine = StateEngine::new(State::new(NullBackend));
        let log = Arc::new(Mutex::new(Vec::new()));
        for (name, fail) in ["one", "two"].into_iter().zip(fail) {
            engine.add_manager(Arc::new(Recorder {
                name,
                log: Arc::clone(&log),
                fail,
            }));
        }
        (engine, log)
    }

    #[test]
    fn test_ensure_runs_managers_in_order() {
        let (engine, log) = engine_with([false, false]);
        engine.ensure().unwrap();
        engine.wait();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["ensure:one", "ensure:two", "wait:one", "wait:two"]
        );
    }

    #[test]
    fn test_ensure_collects_errors_without_aborting() {
        let (engine, log) = engine_with([true, true]);
        let err = engine.ensure().unwrap_err();
        assert_eq!(err.errors.len(), 2);
        assert_eq!(err.to_string(), "state ensure errors: [one failed two failed]");
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_stop_once() {
        let (engine, log) = engine_with([false, false]);
        engine.stop();
        engine.stop();
        assert_eq!(*log.lock().unwrap(), vec!["stop:one", "stop:two"]);
        assert!(engine.ensure().is_err());
    }
}
