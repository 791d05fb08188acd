//! Persisted provisioning identity of a node (tank assignment and name).
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::persist;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// 0 while unprovisioned.
    pub tank_id: u8,
    pub name: String,
}

impl NodeIdentity {
    pub fn is_provisioned(&self) -> bool {
        self.tank_id != 0
    }
}

pub trait IdentityStore: Send {
    fn load(&mut self) -> Result<NodeIdentity>;
    fn save(&mut self, identity: &NodeIdentity) -> Result<()>;
}

/// Keeps the identity in memory; counts saves for tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityStore {
    identity: NodeIdentity,
    pub saves: usize,
}

impl MemoryIdentityStore {
    pub fn new(identity: NodeIdentity) -> Self {
        Self { identity, saves: 0 }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&mut self) -> Result<NodeIdentity> {
        Ok(self.identity.clone())
    }

    fn save(&mut self, identity: &NodeIdentity) -> Result<()> {
        self.identity = identity.clone();
        self.saves += 1;
        Ok(())
    }
}

/// JSON file store; a missing file means unprovisioned.
#[derive(Debug, Clone)]
pub struct JsonIdentityStore {
    path: PathBuf,
}

impl JsonIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityStore for JsonIdentityStore {
    fn load(&mut self) -> Result<NodeIdentity> {
        Ok(persist::read_json(&self.path)?.unwrap_or_default())
    }

    fn save(&mut self, identity: &NodeIdentity) -> Result<()> {
        persist::write_json(&self.path, identity)
    }
}
