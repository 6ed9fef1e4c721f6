//! The overlord owns the persisted state and the managers reconciling it.
//!
//! It holds an exclusive lock on the state for the whole process lifetime,
//! drives the managers from a dedicated ensure-loop thread and prunes old
//! changes on an independent tick. Tests and tools use [`Overlord::settle`]
//! instead of the free-running loop.

pub mod engine;
pub mod patch;
pub mod restart;
pub mod runner;
pub(crate) mod schedule;
pub mod standby;

pub use engine::{EnsureError, StateEngine, StateManager};
pub use restart::{RestartHandler, RestartKind, RestartManager};
pub use runner::{HandlerError, TaskRunner};
pub use standby::{StandbyOpinion, StandbyOpinions};

use crate::paths::Paths;
use crate::state::{Backend, State, StateError};
use chrono::Utc;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use patch::{PatchError, Patcher};
use schedule::{EnsureSchedule, Wake};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, BufReader, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Cadences and thresholds of the ensure loop and pruning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Time between two ensure cycles when nobody asks for an earlier one
    pub ensure_interval: Duration,
    /// Time between two prune passes
    pub prune_interval: Duration,
    /// Age after which ready changes are removed
    pub prune_wait: Duration,
    /// Age after which pending changes are aborted
    pub abort_wait: Duration,
    /// Most changes removed by a single prune pass
    pub prune_max_changes: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            ensure_interval: Duration::from_secs(5 * 60),
            prune_interval: Duration::from_secs(10 * 60),
            prune_wait: Duration::from_secs(24 * 3600),
            abort_wait: Duration::from_secs(72 * 3600),
            prune_max_changes: 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum OverlordError {
    #[error("fatal: error opening lock file: {0}")]
    LockFile(#[source] io::Error),

    #[error("fatal: could not lock state file: {0}")]
    Locked(#[source] Errno),

    #[error("fatal: directory {0:?} must be present")]
    MissingStateDir(PathBuf),

    #[error("cannot read the state file: {0}")]
    OpenState(#[source] io::Error),

    #[error(transparent)]
    ReadState(StateError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("cannot start ensure loop: {0}")]
    Spawn(#[source] io::Error),

    #[error("ensure loop panicked")]
    LoopPanicked,

    #[error(transparent)]
    Ensure(EnsureError),

    #[error("Settle is not converging{}", not_converging_detail(.0))]
    NotConverging(EnsureError),

    #[error("daemon stop requested to wait for socket activation")]
    RestartSocket,
}

fn not_converging_detail(err: &EnsureError) -> String {
    if err.errors.is_empty() {
        String::new()
    } else {
        format!(": {err}")
    }
}

/// Checkpoints to the state file and forwards early-ensure requests to the loop
struct OverlordBackend {
    path: Option<PathBuf>,
    schedule: Arc<EnsureSchedule>,
}

impl Backend for OverlordBackend {
    fn checkpoint(&self, data: &[u8]) -> io::Result<()> {
        match &self.path {
            Some(path) => atomic_write(path, data, 0o600),
            None => Ok(()),
        }
    }

    fn ensure_before(&self, d: Duration) {
        // in-memory overlords tolerate requests while neither looping nor settling
        if self.path.is_none() && !self.schedule.is_armed() {
            return;
        }
        self.schedule.ensure_before(d);
    }
}

fn atomic_write(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .open(&tmp)?;
    fs::set_permissions(&tmp, Permissions::from_mode(mode))?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

fn acquire_lock(path: &Path) -> Result<Flock<File>, OverlordError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(OverlordError::LockFile)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
        .map_err(OverlordError::LockFile)?;

    info!("Acquiring state lock file");
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => {
            info!("Acquired state lock file");
            Ok(lock)
        }
        Err((_, errno)) => {
            info!("Failed to lock state file");
            Err(OverlordError::Locked(errno))
        }
    }
}

fn prune(state: &State, timings: &Timings, did_prune: &AtomicBool) {
    let report = state.lock().prune(
        Utc::now(),
        timings.prune_wait,
        timings.abort_wait,
        timings.prune_max_changes,
    );
    if report.removed > 0 || report.aborted > 0 {
        info!(removed = report.removed, aborted = report.aborted, "Pruned changes");
    }
    did_prune.store(true, Ordering::SeqCst);
}

/// Disarms the schedule when settling ends, however it ends
struct Disarm<'a>(&'a EnsureSchedule);

impl Drop for Disarm<'_> {
    fn drop(&mut self) {
        self.0.disarm();
    }
}

struct ReleaseCleanups<'a>(&'a TaskRunner);

impl Drop for ReleaseCleanups<'_> {
    fn drop(&mut self) {
        self.0.hold_cleanups(false);
    }
}

pub struct Overlord {
    timings: Timings,
    engine: Arc<StateEngine>,
    schedule: Arc<EnsureSchedule>,
    runner: Arc<TaskRunner>,
    restart: Arc<RestartManager>,
    state_lock: Mutex<Option<Flock<File>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    ensure_ran: Arc<AtomicBool>,
    did_prune: Arc<AtomicBool>,
    inited: bool,
}

impl std::fmt::Debug for Overlord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlord").finish_non_exhaustive()
    }
}

impl Overlord {
    /// Lock and load (or create) the persisted state and set up the managers.
    ///
    /// Fails if another process holds the state lock, if the state cannot be
    /// decoded, or if the directory meant to hold a fresh state is missing.
    pub fn new(
        paths: &Paths,
        timings: Timings,
        restart_handler: Option<Arc<dyn RestartHandler>>,
    ) -> Result<Self, OverlordError> {
        let schedule = Arc::new(EnsureSchedule::new());
        let state_lock = acquire_lock(&paths.lock_file)?;

        let backend = OverlordBackend {
            path: Some(paths.state_file.clone()),
            schedule: Arc::clone(&schedule),
        };
        let state = if paths.state_file.exists() {
            let file = File::open(&paths.state_file).map_err(OverlordError::OpenState)?;
            let state =
                State::read(backend, BufReader::new(file)).map_err(OverlordError::ReadState)?;
            Patcher::current().apply(&state)?;
            state
        } else {
            let dir = paths
                .state_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            if !dir.is_dir() {
                return Err(OverlordError::MissingStateDir(dir));
            }
            let state = State::new(backend);
            Patcher::current().init(&state)?;
            state
        };

        let overlord = Self::assemble(
            timings,
            state,
            schedule,
            restart_handler,
            Some(state_lock),
            true,
        );
        overlord.engine.add_manager(overlord.restart.clone());
        // the task runner goes last
        overlord.engine.add_manager(overlord.runner.clone());
        Ok(overlord)
    }

    /// In-memory overlord without any registered manager, for tests
    pub fn mock() -> Self {
        Self::mock_with_timings(Timings::default())
    }

    pub fn mock_with_timings(timings: Timings) -> Self {
        let schedule = Arc::new(EnsureSchedule::new());
        let state = State::new(OverlordBackend {
            path: None,
            schedule: Arc::clone(&schedule),
        });
        Self::assemble(timings, state, schedule, None, None, false)
    }

    fn assemble(
        timings: Timings,
        state: State,
        schedule: Arc<EnsureSchedule>,
        restart_handler: Option<Arc<dyn RestartHandler>>,
        state_lock: Option<Flock<File>>,
        inited: bool,
    ) -> Self {
        Self {
            timings,
            runner: Arc::new(TaskRunner::new(state.clone())),
            engine: Arc::new(StateEngine::new(state)),
            schedule,
            restart: Arc::new(RestartManager::new(restart_handler)),
            state_lock: Mutex::new(state_lock),
            loop_handle: Mutex::new(None),
            ensure_ran: Arc::new(AtomicBool::new(false)),
            did_prune: Arc::new(AtomicBool::new(false)),
            inited,
        }
    }

    /// Add a manager to an overlord created with [`Overlord::mock`]
    pub fn add_manager(&self, manager: Arc<dyn StateManager>) {
        if self.inited {
            panic!("internal error: cannot add managers to a fully initialized Overlord");
        }
        self.engine.add_manager(manager);
    }

    pub fn state(&self) -> &State {
        self.engine.state()
    }

    pub fn state_engine(&self) -> &Arc<StateEngine> {
        &self.engine
    }

    pub fn task_runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub fn restart_manager(&self) -> &Arc<RestartManager> {
        &self.restart
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Start the ensure loop on its own thread
    pub fn run_loop(&self) -> Result<(), OverlordError> {
        if !self
            .schedule
            .arm(self.timings.ensure_interval, Some(self.timings.prune_interval))
        {
            panic!("cannot use Settle concurrently with other Settle or Loop calls");
        }

        let engine = Arc::clone(&self.engine);
        let schedule = Arc::clone(&self.schedule);
        let ensure_ran = Arc::clone(&self.ensure_ran);
        let did_prune = Arc::clone(&self.did_prune);
        let timings = self.timings;

        let handle = thread::Builder::new()
            .name("ensure-loop".to_string())
            .spawn(move || {
                while !schedule.is_stopping() {
                    schedule.reset(timings.ensure_interval);
                    if let Err(err) = engine.ensure() {
                        debug!(errors = err.errors.len(), "ensure cycle finished with errors");
                    }
                    ensure_ran.store(true, Ordering::SeqCst);

                    match schedule.wait() {
                        Wake::Stop => break,
                        Wake::Ensure => {}
                        Wake::Prune => prune(engine.state(), &timings, &did_prune),
                    }
                }
                debug!("ensure loop stopped");
            })
            .map_err(OverlordError::Spawn)?;

        *self.loop_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Ask for the next ensure cycle to start within `d`.
    ///
    /// Panics when neither the loop nor settle has armed the timer.
    pub fn ensure_before(&self, d: Duration) {
        self.schedule.ensure_before(d);
    }

    /// Remove old ready changes and abort stale pending ones
    pub fn prune(&self) {
        prune(self.state(), &self.timings, &self.did_prune);
    }

    /// Whether at least one ensure cycle ran
    pub fn can_standby(&self) -> bool {
        self.ensure_ran.load(Ordering::SeqCst)
    }

    /// Run ensure cycles until no manager asks for another one and every
    /// ready change is clean. A zero `timeout` waits forever.
    pub fn settle(&self, timeout: Duration) -> Result<(), OverlordError> {
        self.settle_inner(timeout, None::<fn()>)
    }

    /// Like [`Overlord::settle`], calling `before_cleanups` once, on the first
    /// cycle that asked for no other one and left no change pending, before
    /// the cleanups of the ready ones run
    pub fn settle_observe_before_cleanups(
        &self,
        timeout: Duration,
        before_cleanups: impl FnOnce(),
    ) -> Result<(), OverlordError> {
        self.settle_inner(timeout, Some(before_cleanups))
    }

    fn settle_inner(
        &self,
        timeout: Duration,
        mut before_cleanups: Option<impl FnOnce()>,
    ) -> Result<(), OverlordError> {
        if !self.schedule.arm(Duration::ZERO, None) {
            panic!("cannot use Settle concurrently with other Settle or Loop calls");
        }
        let _disarm = Disarm(&self.schedule);
        let _release = ReleaseCleanups(&self.runner);
        if before_cleanups.is_some() {
            self.runner.hold_cleanups(true);
        }

        let started = Instant::now();
        let mut errors = Vec::new();
        loop {
            if !timeout.is_zero() && started.elapsed() > timeout {
                return Err(OverlordError::NotConverging(EnsureError { errors }));
            }

            let next = self.schedule.reset(self.timings.ensure_interval);
            if let Err(err) = self.engine.ensure() {
                errors.extend(err.errors);
            }
            self.ensure_ran.store(true, Ordering::SeqCst);
            self.engine.wait();

            if self.schedule.next() != next {
                continue;
            }
            let all_ready = || self.state().lock().changes().iter().all(|chg| chg.is_ready());
            if before_cleanups.is_some() && all_ready() {
                if let Some(observe) = before_cleanups.take() {
                    observe();
                    self.runner.hold_cleanups(false);
                }
            }
            let st = self.state().lock();
            if st.changes().iter().all(|chg| !chg.is_ready() || chg.is_clean()) {
                break;
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OverlordError::Ensure(EnsureError { errors }))
        }
    }

    /// Stop the loop, prune if that never happened, stop the managers and
    /// release the state lock.
    ///
    /// Returns [`OverlordError::RestartSocket`] when a socket restart is pending.
    pub fn stop(&self) -> Result<(), OverlordError> {
        self.schedule.stop();
        let mut result = Ok(());

        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                result = Err(OverlordError::LoopPanicked);
            }
        }

        if !self.did_prune.load(Ordering::SeqCst) {
            self.prune();
        }
        self.engine.stop();

        let state_lock = self
            .state_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(state_lock) = state_lock {
            drop(state_lock);
            info!("Released state lock file");
        }

        result?;
        if self.restart.pending() == Some(RestartKind::Socket) {
            return Err(OverlordError::RestartSocket);
        }
        Ok(())
    }
}

impl StandbyOpinion for Overlord {
    fn can_standby(&self) -> bool {
        Overlord::can_standby(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let t = Timings::default();
        assert_eq!(t.ensure_interval, Duration::from_secs(300));
        assert_eq!(t.prune_interval, Duration::from_secs(600));
        assert_eq!(t.prune_wait, Duration::from_secs(86400));
        assert_eq!(t.abort_wait, Duration::from_secs(3 * 86400));
        assert_eq!(t.prune_max_changes, 500);
    }

    #[test]
    fn test_not_converging_message() {
        let bare = OverlordError::NotConverging(EnsureError { errors: vec![] });
        assert_eq!(bare.to_string(), "Settle is not converging");

        let with_errors = OverlordError::NotConverging(EnsureError {
            errors: vec![anyhow::anyhow!("boom")],
        });
        assert_eq!(
            with_errors.to_string(),
            "Settle is not converging: state ensure errors: [boom]"
        );
    }

    #[test]
    #[should_panic(expected = "cannot add managers to a fully initialized Overlord")]
    fn test_add_manager_to_initialized_overlord_panics() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let o = Overlord::new(&paths, Timings::default(), None).unwrap();
        o.add_manager(o.task_runner().clone());
    }

    #[test]
    fn test_mock_tolerates_ensure_before_while_idle() {
        let o = Overlord::mock();
        o.state().lock().ensure_before(Duration::ZERO);
    }

    #[test]
    fn test_atomic_write_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        atomic_write(&path, b"{}", 0o600).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read(&path).unwrap(), b"{}");
    }
}
