//! Standby coordination
//!
//! A coordinator thread polls a set of opinions, with exponential backoff.
//! When every opinion agrees and no change is pending it requests a socket
//! restart, letting the daemon exit and be socket-activated again later.

use crate::overlord::restart::{RestartKind, RestartManager};
use crate::state::State;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Something with a say in whether the daemon may go idle
pub trait StandbyOpinion: Send + Sync {
    fn can_standby(&self) -> bool;
}

struct Running {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct StandbyOpinions {
    state: State,
    restart: Arc<RestartManager>,
    opinions: Vec<Arc<dyn StandbyOpinion>>,
    start_wait: Duration,
    max_wait: Duration,
    running: Mutex<Option<Running>>,
}

impl StandbyOpinions {
    pub fn new(
        state: State,
        restart: Arc<RestartManager>,
        start_wait: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            state,
            restart,
            opinions: Vec::new(),
            start_wait,
            max_wait,
            running: Mutex::new(None),
        }
    }

    pub fn add_opinion(&mut self, opinion: Arc<dyn StandbyOpinion>) {
        self.opinions.push(opinion);
    }

    pub fn can_standby(&self) -> bool {
        can_standby(&self.state, &self.opinions)
    }

    /// Start polling. The first poll happens right away.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let state = self.state.clone();
        let restart = Arc::clone(&self.restart);
        let opinions = self.opinions.clone();
        let max_wait = self.max_wait;
        let mut wait = self.start_wait;

        let handle = thread::spawn(move || loop {
            if can_standby(&state, &opinions) {
                debug!("all parties agree on standby");
                restart.request(RestartKind::Socket);
            }
            match stopped.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {
                    if wait < max_wait {
                        wait = (wait * 2).min(max_wait);
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        });

        *running = Some(Running { stop, handle });
    }

    /// Stop polling and wait for the coordinator thread to exit
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Running { stop, handle }) = running {
            drop(stop);
            if handle.join().is_err() {
                debug!("standby coordinator panicked");
            }
        }
    }
}

fn can_standby(state: &State, opinions: &[Arc<dyn StandbyOpinion>]) -> bool {
    {
        let st = state.lock();
        if st.changes().iter().any(|chg| !chg.is_ready()) {
            return false;
        }
    }
    opinions.iter().all(|opinion| opinion.can_standby())
}
