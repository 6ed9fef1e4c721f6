//! One-shot migrations of the persisted state.
//!
//! The state records the `patch-level` and `patch-sublevel` it was last
//! brought to. Patches for level `L` are stored in order: the first one moves
//! the state from `L-1` to `L.0`, each following one to the next sublevel.

use crate::state::{State, StateError};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// Patch level implemented by this build
pub const LEVEL: u32 = 1;

/// Sublevel implemented for [`LEVEL`]. Sublevel patches do not prevent rollbacks.
pub const SUBLEVEL: u32 = 0;

const LEVEL_KEY: &str = "patch-level";
const SUBLEVEL_KEY: &str = "patch-sublevel";

pub type PatchFn = fn(&State) -> anyhow::Result<()>;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("internal error: expected empty state, attempting to override {0} without actual patching")]
    NotEmpty(&'static str),

    #[error("cannot downgrade: fdemanagerd is too old for the current system state (patch level {0})")]
    TooOld(u32),

    #[error("cannot upgrade: fdemanagerd is too new for the current system state (patch level {0})")]
    Missing(u32),

    #[error("cannot patch system state to level {level}, sublevel {sublevel}: {source}")]
    Failed {
        level: u32,
        sublevel: u32,
        #[source]
        source: anyhow::Error,
    },
}

/// Patch levels and the patches leading to them
#[derive(Debug, Clone)]
pub struct Patcher {
    level: u32,
    sublevel: u32,
    patches: BTreeMap<u32, Vec<PatchFn>>,
}

impl Patcher {
    /// The patches known to this build
    pub fn current() -> Self {
        Self::new(LEVEL, SUBLEVEL, BTreeMap::new())
    }

    pub fn new(level: u32, sublevel: u32, patches: BTreeMap<u32, Vec<PatchFn>>) -> Self {
        Self {
            level,
            sublevel,
            patches,
        }
    }

    /// Stamp a fresh state with the implemented level
    pub fn init(&self, state: &State) -> Result<(), PatchError> {
        let mut st = state.lock();
        if st.get::<u32>(LEVEL_KEY).is_ok() {
            return Err(PatchError::NotEmpty(LEVEL_KEY));
        }
        if st.get::<u32>(SUBLEVEL_KEY).is_ok() {
            return Err(PatchError::NotEmpty(SUBLEVEL_KEY));
        }
        st.set(LEVEL_KEY, &self.level)?;
        st.set(SUBLEVEL_KEY, &self.sublevel)?;
        Ok(())
    }

    /// Bring a loaded state up to the implemented level.
    ///
    /// A state that never recorded a level is stamped with the implemented one.
    pub fn apply(&self, state: &State) -> Result<(), PatchError> {
        let (mut level, mut sublevel) = {
            let mut st = state.lock();
            let Some(level) = read_level(&st, LEVEL_KEY)? else {
                st.set(LEVEL_KEY, &self.level)?;
                st.set(SUBLEVEL_KEY, &self.sublevel)?;
                return Ok(());
            };
            (level, read_level(&st, SUBLEVEL_KEY)?.unwrap_or(0))
        };

        if level > self.level {
            return Err(PatchError::TooOld(level));
        }

        loop {
            let next_sublevel = self
                .patches
                .get(&level)
                .and_then(|patches| patches.get(sublevel as usize + 1))
                .filter(|_| level < self.level || sublevel < self.sublevel);

            let (patch, target) = if let Some(patch) = next_sublevel {
                (*patch, (level, sublevel + 1))
            } else if level < self.level {
                let patch = self
                    .patches
                    .get(&(level + 1))
                    .and_then(|patches| patches.first())
                    .ok_or(PatchError::Missing(level))?;
                (*patch, (level + 1, 0))
            } else {
                return Ok(());
            };

            info!(level = target.0, sublevel = target.1, "Patching system state");
            patch(state).map_err(|source| PatchError::Failed {
                level: target.0,
                sublevel: target.1,
                source,
            })?;

            let mut st = state.lock();
            st.set(LEVEL_KEY, &target.0)?;
            st.set(SUBLEVEL_KEY, &target.1)?;
            (level, sublevel) = target;
        }
    }
}

fn read_level(st: &crate::state::StateGuard<'_>, key: &str) -> Result<Option<u32>, StateError> {
    match st.get::<u32>(key) {
        Ok(level) => Ok(Some(level)),
        Err(StateError::NoState(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
