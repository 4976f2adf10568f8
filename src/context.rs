//! Execution context management
//!
//! Decouples the orchestrator from the concrete run-slot mechanism
//! (terminal-multiplexer pane, subprocess, container, remote shell). The
//! multiplexer-specific wire syntax lives entirely behind
//! [`ExecutionContextProvider`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ConclaveError;

/// Opaque handle to an isolated run-slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextHandle {
    id: Uuid,
    name: String,
}

impl ContextHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Placement hint for a new run-slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Placement {
    #[default]
    Anywhere,
    Window(String),
}

/// Errors raised by an execution context provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider command failed: {0}")]
    CommandFailed(String),

    #[error("slot does not exist: {0}")]
    NoSuchSlot(String),
}

/// External provider of isolated run-slots.
///
/// Implementations wrap a concrete mechanism (tmux session, subprocess
/// pool, container runtime); the core never sees its command syntax.
#[async_trait]
pub trait ExecutionContextProvider: Send + Sync {
    /// Ensure the backing session exists. Returns `true` if it was created
    /// by this call, `false` if it already existed.
    async fn create_session(&self, name: &str) -> Result<bool, ProviderError>;

    /// Provision an isolated run-slot.
    async fn create_slot(
        &self,
        name: &str,
        placement: &Placement,
    ) -> Result<ContextHandle, ProviderError>;

    /// Forward text into a slot's input stream.
    async fn send_text(&self, handle: &ContextHandle, text: &str) -> Result<(), ProviderError>;

    /// Enumerate the currently existing slots.
    async fn list_slots(&self) -> Result<Vec<ContextHandle>, ProviderError>;

    /// Release a slot.
    async fn destroy_slot(&self, handle: &ContextHandle) -> Result<(), ProviderError>;
}

/// Thin adapter between the orchestrator and the provider.
///
/// Tracks live handles so stale-handle detection and idempotent destroy
/// are enforced here; performs no business logic.
pub struct ContextManager<P> {
    provider: P,
    live: RwLock<HashMap<Uuid, ContextHandle>>,
}

impl<P: ExecutionContextProvider> ContextManager<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure the provider's backing session exists. Returns `true` if it
    /// was created by this call.
    pub async fn ensure_session(&self, name: &str) -> Result<bool, ConclaveError> {
        self.provider
            .create_session(name)
            .await
            .map_err(|e| ConclaveError::ProvisioningFailed(e.to_string()))
    }

    /// Provision a run-slot for `name`.
    pub async fn create_context(
        &self,
        name: &str,
        placement: Placement,
    ) -> Result<ContextHandle, ConclaveError> {
        let handle = self
            .provider
            .create_slot(name, &placement)
            .await
            .map_err(|e| ConclaveError::ProvisioningFailed(e.to_string()))?;
        self.live.write().insert(handle.id(), handle.clone());
        info!(context = %handle, "Provisioned execution context");
        Ok(handle)
    }

    /// Forward text into the slot bound to `handle`.
    pub async fn send_input(&self, handle: &ContextHandle, text: &str) -> Result<(), ConclaveError> {
        if !self.live.read().contains_key(&handle.id()) {
            return Err(ConclaveError::ContextNotFound(handle.to_string()));
        }
        self.provider
            .send_text(handle, text)
            .await
            .map_err(|_| ConclaveError::ContextNotFound(handle.to_string()))
    }

    /// Release the slot. Idempotent on an already-destroyed handle.
    pub async fn destroy_context(&self, handle: &ContextHandle) -> Result<(), ConclaveError> {
        if self.live.write().remove(&handle.id()).is_none() {
            debug!(context = %handle, "Context already destroyed");
            return Ok(());
        }
        // The provider may have lost the slot on its own; that still
        // counts as destroyed.
        let _ = self.provider.destroy_slot(handle).await;
        info!(context = %handle, "Destroyed execution context");
        Ok(())
    }

    /// Number of currently live contexts.
    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }
}

/// In-memory provider for tests and the demo REPL.
///
/// Slots are plain records; text sent to a slot is retained for
/// inspection.
pub struct LoopbackProvider {
    slots: RwLock<HashMap<Uuid, (ContextHandle, Vec<String>)>>,
    session: RwLock<Option<String>>,
    fail_provisioning: bool,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            session: RwLock::new(None),
            fail_provisioning: false,
        }
    }

    /// A provider whose `create_slot` always fails, for exercising the
    /// provisioning-failure path.
    pub fn failing() -> Self {
        Self {
            fail_provisioning: true,
            ..Self::new()
        }
    }

    /// Text sent to the slot so far, oldest first.
    pub fn transcript(&self, handle: &ContextHandle) -> Vec<String> {
        self.slots
            .read()
            .get(&handle.id())
            .map(|(_, lines)| lines.clone())
            .unwrap_or_default()
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionContextProvider for LoopbackProvider {
    async fn create_session(&self, name: &str) -> Result<bool, ProviderError> {
        let mut session = self.session.write();
        if session.is_some() {
            return Ok(false);
        }
        *session = Some(name.to_string());
        Ok(true)
    }

    async fn create_slot(
        &self,
        name: &str,
        _placement: &Placement,
    ) -> Result<ContextHandle, ProviderError> {
        if self.fail_provisioning {
            return Err(ProviderError::CommandFailed(format!(
                "cannot create slot for {name}"
            )));
        }
        let handle = ContextHandle::new(name);
        self.slots
            .write()
            .insert(handle.id(), (handle.clone(), Vec::new()));
        Ok(handle)
    }

    async fn send_text(&self, handle: &ContextHandle, text: &str) -> Result<(), ProviderError> {
        let mut slots = self.slots.write();
        let (_, lines) = slots
            .get_mut(&handle.id())
            .ok_or_else(|| ProviderError::NoSuchSlot(handle.to_string()))?;
        lines.push(text.to_string());
        Ok(())
    }

    async fn list_slots(&self) -> Result<Vec<ContextHandle>, ProviderError> {
        let mut handles: Vec<ContextHandle> = self
            .slots
            .read()
            .values()
            .map(|(handle, _)| handle.clone())
            .collect();
        handles.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(handles)
    }

    async fn destroy_slot(&self, handle: &ContextHandle) -> Result<(), ProviderError> {
        self.slots
            .write()
            .remove(&handle.id())
            .map(|_| ())
            .ok_or_else(|| ProviderError::NoSuchSlot(handle.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_send_destroy() {
        let provider = LoopbackProvider::new();
        let manager = ContextManager::new(provider);

        let handle = manager
            .create_context("frontend-1", Placement::Anywhere)
            .await
            .unwrap();
        assert_eq!(manager.live_count(), 1);

        manager.send_input(&handle, "run tests").await.unwrap();
        assert_eq!(manager.provider.transcript(&handle), ["run tests"]);

        manager.destroy_context(&handle).await.unwrap();
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_send_to_stale_handle() {
        let manager = ContextManager::new(LoopbackProvider::new());
        let stale = ContextHandle::new("never-created");

        let err = manager.send_input(&stale, "hello").await.unwrap_err();
        assert!(matches!(err, ConclaveError::ContextNotFound(_)));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let manager = ContextManager::new(LoopbackProvider::new());
        let handle = manager
            .create_context("backend-1", Placement::Window("services".into()))
            .await
            .unwrap();

        manager.destroy_context(&handle).await.unwrap();
        manager.destroy_context(&handle).await.unwrap();

        // And the handle is stale afterwards.
        let err = manager.send_input(&handle, "x").await.unwrap_err();
        assert!(matches!(err, ConclaveError::ContextNotFound(_)));
    }

    #[tokio::test]
    async fn test_failing_provider_surfaces_provisioning_error() {
        let manager = ContextManager::new(LoopbackProvider::failing());
        let err = manager
            .create_context("frontend-1", Placement::Anywhere)
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::ProvisioningFailed(_)));
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn test_session_created_once() {
        let provider = LoopbackProvider::new();
        assert!(tokio_test::block_on(provider.create_session("conclave")).unwrap());
        assert!(!tokio_test::block_on(provider.create_session("conclave")).unwrap());
    }

    #[tokio::test]
    async fn test_list_slots_ordered_by_name() {
        let provider = LoopbackProvider::new();
        provider
            .create_slot("zeta", &Placement::Anywhere)
            .await
            .unwrap();
        provider
            .create_slot("alpha", &Placement::Anywhere)
            .await
            .unwrap();

        let slots = provider.list_slots().await.unwrap();
        let names: Vec<&str> = slots.iter().map(|h| h.name()).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }
}
