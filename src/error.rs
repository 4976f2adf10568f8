//! Error types for the orchestration core

use thiserror::Error;

use crate::protocol::AgentId;

/// Errors that can occur in the orchestration core
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// An agent with this ID is already registered
    #[error("Agent already registered: {0}")]
    DuplicateAgent(AgentId),

    /// Agent not found in the registry
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// The execution context provider could not provision a run-slot
    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// The execution context handle is stale
    #[error("Execution context not found: {0}")]
    ContextNotFound(String),

    /// The message bus has been shut down
    #[error("Message bus is closed")]
    BusClosed,
}

/// Fault reported by a message handler during delivery.
///
/// Caught by the bus, logged as a non-fatal delivery error, never
/// propagated to the publisher.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerFault(String);

impl HandlerFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<&str> for HandlerFault {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}
