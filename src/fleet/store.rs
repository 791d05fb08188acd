//! Persistence hook for fleet state.
//!
//! The registry hands a complete [`FleetState`] to its store after every
//! mutating operation and loads one at startup. How it is kept is up to the
//! store; [`JsonFleetStore`] writes a single JSON document atomically.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::aquarium::Aquarium;
use super::unmapped::UnmappedDevice;
use crate::persist;

pub const FLEET_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FleetState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub aquariums: Vec<Aquarium>,
    #[serde(default)]
    pub unmapped: Vec<UnmappedDevice>,
    #[serde(default)]
    pub total_discovered: u64,
}

pub trait FleetStore: Send {
    fn load(&self) -> Result<Option<FleetState>>;
    fn persist(&self, state: &FleetState) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonFleetStore {
    path: PathBuf,
}

impl JsonFleetStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FleetStore for JsonFleetStore {
    fn load(&self) -> Result<Option<FleetState>> {
        persist::read_json(&self.path)
    }

    fn persist(&self, state: &FleetState) -> Result<()> {
        persist::write_json(&self.path, state)
    }
}

/// Keeps the last persisted state in memory; clones share it.
#[derive(Debug, Clone, Default)]
pub struct MemoryFleetStore {
    inner: Arc<Mutex<(Option<FleetState>, usize)>>,
}

impl MemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: FleetState) -> Self {
        Self {
            inner: Arc::new(Mutex::new((Some(state), 0))),
        }
    }

    pub fn saved(&self) -> Option<FleetState> {
        self.lock().0.clone()
    }

    pub fn save_count(&self) -> usize {
        self.lock().1
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (Option<FleetState>, usize)> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl FleetStore for MemoryFleetStore {
    fn load(&self) -> Result<Option<FleetState>> {
        Ok(self.lock().0.clone())
    }

    fn persist(&self, state: &FleetState) -> Result<()> {
        let mut g = self.lock();
        g.0 = Some(state.clone());
        g.1 += 1;
        Ok(())
    }
}
