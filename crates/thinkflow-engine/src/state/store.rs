use std::collections::HashMap;
use std::sync::RwLock;

use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::traits::StateStore;
use thinkflow_core::types::{ExecutionSnapshot, ExecutionStatus, InstanceId};

/// Process-local state store. Lost on restart; use
/// [`SqliteStateStore`](super::SqliteStateStore) when runs must survive a crash.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<InstanceId, ExecutionSnapshot>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> ThinkflowError {
    ThinkflowError::Store(e.to_string())
}

impl StateStore for InMemoryStateStore {
    fn save(&self, state: &ExecutionSnapshot) -> Result<()> {
        self.states
            .write()
            .map_err(poisoned)?
            .insert(state.instance_id.clone(), state.clone());
        Ok(())
    }

    fn get(&self, id: &InstanceId) -> Result<Option<ExecutionSnapshot>> {
        Ok(self.states.read().map_err(poisoned)?.get(id).cloned())
    }

    fn delete(&self, id: &InstanceId) -> Result<bool> {
        Ok(self.states.write().map_err(poisoned)?.remove(id).is_some())
    }

    fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<ExecutionSnapshot>> {
        let mut found: Vec<ExecutionSnapshot> = self
            .states
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.start_time);
        Ok(found)
    }
}
