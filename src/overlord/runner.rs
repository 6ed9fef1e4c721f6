//! Drives pending changes to completion.
//!
//! Handlers are looked up by change kind and run synchronously from the
//! ensure cycle, with the state unlocked. A kind without a handler completes
//! immediately. Once a change is ready its cleanup (if any) runs on a later
//! cycle, after which it is marked clean.

use crate::overlord::engine::StateManager;
use crate::state::{Change, State, Status};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Longest retry delay honored; handlers asking for more wait this long
const MAX_RETRY_DELAY: Duration = Duration::from_secs(365 * 24 * 3600);

/// How a handler invocation ended, when it did not succeed
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Run the handler again after the given delay
    #[error("retry requested in {after:?}")]
    Retry { after: Duration },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type HandlerFn = Arc<dyn Fn(&State, &Change) -> Result<(), HandlerError> + Send + Sync>;
pub type CleanupFn = Arc<dyn Fn(&State, &Change) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    run: HashMap<String, HandlerFn>,
    cleanup: HashMap<String, CleanupFn>,
}

pub struct TaskRunner {
    state: State,
    handlers: RwLock<Handlers>,
    retry_at: Mutex<HashMap<String, Instant>>,
    hold_cleanups: AtomicBool,
}

impl TaskRunner {
    pub fn new(state: State) -> Self {
        Self {
            state,
            handlers: RwLock::new(Handlers::default()),
            retry_at: Mutex::new(HashMap::new()),
            hold_cleanups: AtomicBool::new(false),
        }
    }

    /// Register the handler for changes of `kind`
    pub fn add_handler<F>(&self, kind: &str, handler: F)
    where
        F: Fn(&State, &Change) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .run
            .insert(kind.to_string(), Arc::new(handler));
    }

    /// Register the cleanup run once a change of `kind` is ready
    pub fn add_cleanup<F>(&self, kind: &str, cleanup: F)
    where
        F: Fn(&State, &Change) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .cleanup
            .insert(kind.to_string(), Arc::new(cleanup));
    }

    /// Keep ready changes dirty until released. Used by settle to observe
    /// the state before any cleanup runs.
    pub(crate) fn hold_cleanups(&self, hold: bool) {
        self.hold_cleanups.store(hold, Ordering::SeqCst);
    }

    fn handler(&self, kind: &str) -> Option<HandlerFn> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .run
            .get(kind)
            .cloned()
    }

    fn cleanup(&self, kind: &str) -> Option<CleanupFn> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cleanup
            .get(kind)
            .cloned()
    }

    fn run_change(&self, change: Change) {
        {
            let mut st = self.state.lock();
            match st.change_mut(&change.id) {
                // aborted since we looked
                Some(chg) if chg.is_ready() => return,
                Some(chg) => chg.set_status(Status::Doing),
                None => return,
            }
        }

        let outcome = match self.handler(&change.kind) {
            Some(handler) => handler(&self.state, &change),
            None => {
                debug!(
                    id = %change.id,
                    kind = %change.kind,
                    "no handler for change kind, completing it"
                );
                Ok(())
            }
        };

        let mut retry_at = self.retry_at.lock().unwrap_or_else(PoisonError::into_inner);
        let mut st = self.state.lock();
        let Some(chg) = st.change_mut(&change.id) else {
            retry_at.remove(&change.id);
            return;
        };
        if chg.is_ready() {
            retry_at.remove(&change.id);
            return;
        }
        match outcome {
            Ok(()) => {
                chg.set_status(Status::Done);
                retry_at.remove(&change.id);
                st.ensure_before(Duration::ZERO);
            }
            Err(HandlerError::Retry { after }) => {
                let after = after.min(MAX_RETRY_DELAY);
                retry_at.insert(change.id.clone(), Instant::now() + after);
                st.ensure_before(after);
            }
            Err(HandlerError::Failed(err)) => {
                warn!(id = %change.id, kind = %change.kind, error = %err, "change failed");
                chg.fail(err.to_string());
                retry_at.remove(&change.id);
                st.ensure_before(Duration::ZERO);
            }
        }
    }

    fn clean_change(&self, change: Change) {
        if let Some(cleanup) = self.cleanup(&change.kind) {
            if let Err(err) = cleanup(&self.state, &change) {
                warn!(id = %change.id, kind = %change.kind, error = %err, "change cleanup failed");
            }
        }
        let mut st = self.state.lock();
        if let Some(chg) = st.change_mut(&change.id) {
            chg.mark_clean();
        }
    }
}

impl StateManager for TaskRunner {
    fn ensure(&self) -> anyhow::Result<()> {
        let now = Instant::now();
        let (due, dirty): (Vec<Change>, Vec<Change>) = {
            let retry_at = self.retry_at.lock().unwrap_or_else(PoisonError::into_inner);
            let st = self.state.lock();
            let mut due = Vec::new();
            let mut dirty = Vec::new();
            let mut earliest: Option<Instant> = None;
            for chg in st.changes() {
                if chg.is_ready() {
                    if !chg.is_clean() {
                        dirty.push(chg.clone());
                    }
                    continue;
                }
                match retry_at.get(&chg.id) {
                    Some(at) if *at > now => {
                        earliest = Some(earliest.map_or(*at, |e| e.min(*at)));
                    }
                    _ => due.push(chg.clone()),
                }
            }
            // retries still waiting need their own cycle
            if let Some(at) = earliest {
                st.ensure_before(at.saturating_duration_since(now));
            }
            (due, dirty)
        };

        if !self.hold_cleanups.load(Ordering::SeqCst) {
            for change in dirty {
                self.clean_change(change);
            }
        }
        for change in due {
            self.run_change(change);
        }
        Ok(())
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Backend;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Duration>>);

    impl Backend for Recorder {
        fn checkpoint(&self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn ensure_before(&self, d: Duration) {
            self.0.lock().unwrap().push(d);
        }
    }

    fn setup() -> (State, Arc<Recorder>, TaskRunner) {
        let backend = Arc::new(Recorder::default());
        let st = State::new(backend.clone());
        let runner = TaskRunner::new(st.clone());
        (st, backend, runner)
    }

    #[test]
    fn test_unknown_kind_completes() {
        let (st, backend, runner) = setup();
        let id = st.lock().new_change("mystery", "unknown");

        runner.ensure().unwrap();
        let guard = st.lock();
        let chg = guard.change(&id).unwrap();
        assert_eq!(chg.status, Status::Done);
        assert!(!chg.is_clean());
        assert_eq!(*backend.0.lock().unwrap(), vec![Duration::ZERO]);
    }

    #[test]
    fn test_cleanup_runs_on_next_cycle() {
        let (st, _backend, runner) = setup();
        let cleaned = Arc::new(AtomicUsize::new(0));
        {
            let cleaned = Arc::clone(&cleaned);
            runner.add_cleanup("unlock", move |_, _| {
                cleaned.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let id = st.lock().new_change("unlock", "Unlock");

        runner.ensure().unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);
        runner.ensure().unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert!(st.lock().change(&id).unwrap().is_clean());

        runner.ensure().unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_held_cleanups_wait_for_release() {
        let (st, _backend, runner) = setup();
        let id = st.lock().new_change("unlock", "Unlock");

        runner.hold_cleanups(true);
        runner.ensure().unwrap();
        runner.ensure().unwrap();
        assert!(!st.lock().change(&id).unwrap().is_clean());

        runner.hold_cleanups(false);
        runner.ensure().unwrap();
        assert!(st.lock().change(&id).unwrap().is_clean());
    }

    #[test]
    fn test_failed_handler_records_error() {
        let (st, _backend, runner) = setup();
        runner.add_handler("unlock", |_, _| Err(anyhow::anyhow!("no key").into()));
        let id = st.lock().new_change("unlock", "Unlock");

        runner.ensure().unwrap();
        let guard = st.lock();
        let chg = guard.change(&id).unwrap();
        assert_eq!(chg.status, Status::Error);
        assert_eq!(chg.err.as_deref(), Some("no key"));
    }

    #[test]
    fn test_retry_waits_and_requests_ensure() {
        let (st, backend, runner) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            runner.add_handler("slow", move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Retry { after: Duration::from_secs(3600) })
            });
        }
        let id = st.lock().new_change("slow", "Slow");

        runner.ensure().unwrap();
        runner.ensure().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(st.lock().change(&id).unwrap().status, Status::Doing);
        let requests = backend.0.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], Duration::from_secs(3600));
        assert!(requests[1] <= Duration::from_secs(3600));
        assert!(requests[1] > Duration::from_secs(3500));
    }

    #[test]
    fn test_waiting_retry_asks_for_earliest_cycle() {
        let (st, backend, runner) = setup();
        runner.add_handler("slow", |_, _| {
            Err(HandlerError::Retry { after: Duration::from_secs(600) })
        });
        runner.add_handler("fast", |_, _| {
            Err(HandlerError::Retry { after: Duration::from_secs(60) })
        });
        st.lock().new_change("slow", "Slow");
        st.lock().new_change("fast", "Fast");

        runner.ensure().unwrap();
        backend.0.lock().unwrap().clear();

        runner.ensure().unwrap();
        let requests = backend.0.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert!(requests[0] <= Duration::from_secs(60));
        assert!(requests[0] > Duration::from_secs(50));
    }

    #[test]
    fn test_huge_retry_is_clamped() {
        let (st, backend, runner) = setup();
        runner.add_handler("stuck", |_, _| Err(HandlerError::Retry { after: Duration::MAX }));
        let id = st.lock().new_change("stuck", "Stuck");

        runner.ensure().unwrap();
        runner.ensure().unwrap();
        assert_eq!(st.lock().change(&id).unwrap().status, Status::Doing);
        let requests = backend.0.lock().unwrap().clone();
        assert_eq!(requests[0], MAX_RETRY_DELAY);
        assert!(requests[1] <= MAX_RETRY_DELAY);
    }

    #[test]
    fn test_aborted_change_is_not_run() {
        let (st, _backend, runner) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            runner.add_handler("unlock", move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let id = st.lock().new_change("unlock", "Unlock");
        st.lock().change_mut(&id).unwrap().abort();

        runner.ensure().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(st.lock().change(&id).unwrap().status, Status::Hold);
    }
}
