//! Agent registry - the single point of truth for agent existence

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::context::ContextHandle;
use crate::error::ConclaveError;
use crate::protocol::{AgentId, AgentStatus};

/// Registry entry for a single agent
#[derive(Debug, Clone)]
pub struct AgentRecord {
    /// Unique identifier, immutable once assigned
    pub id: AgentId,
    /// Declared type/role ("frontend", "backend", ...)
    pub agent_type: String,
    /// Current lifecycle status
    pub status: AgentStatus,
    /// Bound execution context, if any
    pub context: Option<ContextHandle>,
    /// Creation time
    pub spawned_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(id: AgentId, agent_type: impl Into<String>) -> Self {
        Self {
            id,
            agent_type: agent_type.into(),
            status: AgentStatus::Spawning,
            context: None,
            spawned_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, handle: ContextHandle) -> Self {
        self.context = Some(handle);
        self
    }
}

/// Owns agent identity and lifecycle.
///
/// All operations are synchronous and atomic; collaborators reference
/// agents by ID only and work on snapshot clones.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new agent.
    pub fn register(&self, record: AgentRecord) -> Result<(), ConclaveError> {
        let mut agents = self.agents.write();
        match agents.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(ConclaveError::DuplicateAgent(record.id)),
            Entry::Vacant(slot) => {
                info!(agent = %record.id, agent_type = %record.agent_type, "Registered agent");
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Apply a status transition unconditionally.
    ///
    /// Any status may follow any status; failures are reported via message
    /// flow, not rejected here.
    pub fn update_status(&self, id: &AgentId, status: AgentStatus) -> Result<(), ConclaveError> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(id)
            .ok_or_else(|| ConclaveError::UnknownAgent(id.clone()))?;
        debug!(agent = %id, from = %record.status, to = %status, "Status transition");
        record.status = status;
        Ok(())
    }

    /// Get a snapshot of an agent's current record.
    pub fn get(&self, id: &AgentId) -> Result<AgentRecord, ConclaveError> {
        self.agents
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ConclaveError::UnknownAgent(id.clone()))
    }

    /// Remove an agent, returning its final record.
    pub fn remove(&self, id: &AgentId) -> Result<AgentRecord, ConclaveError> {
        let removed = self
            .agents
            .write()
            .remove(id)
            .ok_or_else(|| ConclaveError::UnknownAgent(id.clone()))?;
        info!(agent = %id, "Removed agent");
        Ok(removed)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.read().contains_key(id)
    }

    /// Snapshot of all records, ordered by agent ID.
    pub fn list(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self.agents.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, agent_type: &str) -> AgentRecord {
        AgentRecord::new(AgentId::new(id), agent_type)
    }

    #[test]
    fn test_register_and_get() {
        let registry = AgentRegistry::new();
        registry.register(record("frontend-1", "frontend")).unwrap();

        let snapshot = registry.get(&AgentId::new("frontend-1")).unwrap();
        assert_eq!(snapshot.agent_type, "frontend");
        assert_eq!(snapshot.status, AgentStatus::Spawning);
    }

    #[test]
    fn test_register_duplicate_fails() {
        let registry = AgentRegistry::new();
        registry.register(record("frontend-1", "frontend")).unwrap();

        let err = registry.register(record("frontend-1", "backend")).unwrap_err();
        assert!(matches!(err, ConclaveError::DuplicateAgent(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_update_status_unknown_agent() {
        let registry = AgentRegistry::new();
        let err = registry
            .update_status(&AgentId::new("ghost"), AgentStatus::Active)
            .unwrap_err();
        assert!(matches!(err, ConclaveError::UnknownAgent(_)));
    }

    #[test]
    fn test_transitions_are_permissive() {
        let registry = AgentRegistry::new();
        registry.register(record("backend-1", "backend")).unwrap();
        let id = AgentId::new("backend-1");

        // Any status may follow any status, including leaving terminated.
        for status in [
            AgentStatus::Active,
            AgentStatus::Degraded,
            AgentStatus::Active,
            AgentStatus::Terminated,
            AgentStatus::Active,
        ] {
            registry.update_status(&id, status).unwrap();
            assert_eq!(registry.get(&id).unwrap().status, status);
        }
    }

    #[test]
    fn test_remove_releases_entry() {
        let registry = AgentRegistry::new();
        registry.register(record("qa-1", "qa")).unwrap();

        let removed = registry.remove(&AgentId::new("qa-1")).unwrap();
        assert_eq!(removed.id.as_str(), "qa-1");
        assert!(!registry.contains(&AgentId::new("qa-1")));

        let err = registry.remove(&AgentId::new("qa-1")).unwrap_err();
        assert!(matches!(err, ConclaveError::UnknownAgent(_)));
    }

    #[test]
    fn test_list_ordered_by_id() {
        let registry = AgentRegistry::new();
        registry.register(record("backend-2", "backend")).unwrap();
        registry.register(record("backend-1", "backend")).unwrap();
        registry.register(record("frontend-1", "frontend")).unwrap();

        let records = registry.list();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["backend-1", "backend-2", "frontend-1"]);
    }
}
