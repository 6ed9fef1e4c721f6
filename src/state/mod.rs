//! Persisted daemon state
//!
//! The state is a JSON document holding free-form entries and the changes
//! driven by the task runner. Every mutation happens under [`State::lock`];
//! releasing a guard that modified the state checkpoints it through the
//! [`Backend`], so checkpoint writes are serialized by the same mutex.

pub mod change;

pub use change::{Change, Status};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Where the state goes when it is checkpointed, and how it asks for an early ensure
pub trait Backend: Send + Sync {
    fn checkpoint(&self, data: &[u8]) -> io::Result<()>;
    fn ensure_before(&self, d: Duration);
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn checkpoint(&self, data: &[u8]) -> io::Result<()> {
        (**self).checkpoint(data)
    }

    fn ensure_before(&self, d: Duration) {
        (**self).ensure_before(d)
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no state entry for key {0:?}")]
    NoState(String),

    #[error("cannot decode state: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cannot encode state entry {key:?}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot unmarshal state entry {key:?}: {source}")]
    Unmarshal {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of a prune pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: usize,
    pub aborted: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateData {
    #[serde(default)]
    data: BTreeMap<String, Value>,
    #[serde(default)]
    changes: BTreeMap<String, Change>,
    #[serde(rename = "last-change-id", default)]
    last_change_id: u64,
    #[serde(skip)]
    modified: bool,
}

struct Inner {
    data: Mutex<StateData>,
    backend: Box<dyn Backend>,
}

/// Shared handle to the daemon state
#[derive(Clone)]
pub struct State {
    inner: Arc<Inner>,
}

impl State {
    /// Fresh, empty state
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_data(backend, StateData::default())
    }

    /// Decode state previously written by a checkpoint
    pub fn read(backend: impl Backend + 'static, reader: impl Read) -> Result<Self, StateError> {
        let data: StateData = serde_json::from_reader(reader).map_err(StateError::Decode)?;
        Ok(Self::with_data(backend, data))
    }

    fn with_data(backend: impl Backend + 'static, data: StateData) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(data),
                backend: Box::new(backend),
            }),
        }
    }

    /// Acquire the state lock. Dropping the guard checkpoints pending modifications.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            data: self.inner.data.lock().unwrap_or_else(PoisonError::into_inner),
            backend: self.inner.backend.as_ref(),
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State").finish_non_exhaustive()
    }
}

/// Exclusive access to the state
pub struct StateGuard<'a> {
    data: MutexGuard<'a, StateData>,
    backend: &'a dyn Backend,
}

impl StateGuard<'_> {
    /// Decode the entry stored under `key`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let value = self
            .data
            .data
            .get(key)
            .ok_or_else(|| StateError::NoState(key.to_string()))?;
        T::deserialize(value).map_err(|source| StateError::Unmarshal {
            key: key.to_string(),
            source,
        })
    }

    /// Store `value` under `key`
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        let value = serde_json::to_value(value).map_err(|source| StateError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.data.data.insert(key.to_string(), value);
        self.data.modified = true;
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        if self.data.data.remove(key).is_some() {
            self.data.modified = true;
        }
    }

    /// Register a new change and return its id
    pub fn new_change(&mut self, kind: &str, summary: &str) -> String {
        self.data.last_change_id += 1;
        let id = self.data.last_change_id.to_string();
        let change = Change::new(id.clone(), kind, summary, Utc::now());
        self.data.changes.insert(id.clone(), change);
        self.data.modified = true;
        id
    }

    pub fn change(&self, id: &str) -> Option<&Change> {
        self.data.changes.get(id)
    }

    pub fn change_mut(&mut self, id: &str) -> Option<&mut Change> {
        let data = &mut *self.data;
        let change = data.changes.get_mut(id)?;
        data.modified = true;
        Some(change)
    }

    /// All changes, oldest first
    pub fn changes(&self) -> Vec<&Change> {
        let mut changes: Vec<&Change> = self.data.changes.values().collect();
        changes.sort_by(|a, b| a.spawn_time.cmp(&b.spawn_time).then_with(|| a.id.cmp(&b.id)));
        changes
    }

    /// Ask for the next ensure cycle to happen within `d`
    pub fn ensure_before(&self, d: Duration) {
        self.backend.ensure_before(d);
    }

    /// Remove ready changes older than `prune_wait` and hold pending ones spawned
    /// longer than `abort_wait` ago. At most `max_removals` changes are removed,
    /// oldest first.
    pub fn prune(
        &mut self,
        now: DateTime<Utc>,
        prune_wait: Duration,
        abort_wait: Duration,
        max_removals: usize,
    ) -> PruneReport {
        let prune_limit = cutoff(now, prune_wait);
        let abort_limit = cutoff(now, abort_wait);
        let mut report = PruneReport::default();
        let mut expired: Vec<(DateTime<Utc>, String)> = Vec::new();

        for change in self.data.changes.values_mut() {
            if change.is_ready() {
                if let (Some(limit), Some(ready)) = (prune_limit, change.ready_time) {
                    if ready < limit {
                        expired.push((ready, change.id.clone()));
                    }
                }
            } else if let Some(limit) = abort_limit {
                if change.spawn_time < limit && change.abort() {
                    report.aborted += 1;
                }
            }
        }

        expired.sort();
        for (_, id) in expired.into_iter().take(max_removals) {
            self.data.changes.remove(&id);
            report.removed += 1;
        }

        if report != PruneReport::default() {
            self.data.modified = true;
        }
        report
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if !self.data.modified {
            return;
        }
        let encoded = match serde_json::to_vec(&*self.data) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(error = %err, "cannot encode state");
                return;
            }
        };
        match self.backend.checkpoint(&encoded) {
            Ok(()) => self.data.modified = false,
            // left modified so the next unlock retries
            Err(err) => error!(error = %err, "cannot checkpoint state"),
        }
    }
}

fn cutoff(now: DateTime<Utc>, wait: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|wait| now.checked_sub_signed(wait))
}
