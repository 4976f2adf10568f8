//! # Conclave
//!
//! Inter-agent orchestration core - priority message routing and task
//! dispatch.
//!
//! A master orchestrator manages a dynamic set of worker agents, each
//! optionally backed by an isolated execution context (a terminal
//! multiplexer pane or equivalent sandboxed process slot).
//!
//! ## Architecture
//!
//! ```text
//!   front end (REPL)
//!        │ line of text
//!        ▼
//! ┌──────────────────┐   task/status messages   ┌─────────────────┐
//! │   ORCHESTRATOR   │ ───────────────────────► │   MESSAGE BUS   │
//! │     (master)     │ ◄─────────────────────── │  priority queue │
//! └───────┬──────────┘   status/response/error  │   + pub/sub     │
//!         │                                     └────────┬────────┘
//!         │ spawn/terminate                              │ delivery pass
//!         ▼                                              ▼
//! ┌──────────────────┐                          ┌─────────────────┐
//! │  AGENT REGISTRY  │                          │ agent handlers  │
//! └──────────────────┘                          └─────────────────┘
//!         │ bound context
//!         ▼
//! ┌──────────────────┐      ┌──────────────────────────────┐
//! │ CONTEXT MANAGER  │ ───► │ ExecutionContextProvider     │
//! └──────────────────┘      │ (tmux pane, subprocess, ...) │
//!                           └──────────────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: a logically independent worker tracked by the registry
//! - **Message**: an immutable value routed by priority over the bus
//! - **Delivery pass**: one complete drain of the pending queue; never
//!   two passes in flight at once
//! - **Execution context**: an isolated run-slot where an agent's real
//!   work happens
//! - **Correlation ID**: links a request message to its response(s)

pub mod bus;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod repl;

pub use bus::{DeadLetterSink, Handler, MessageBus};
pub use context::{
    ContextHandle, ContextManager, ExecutionContextProvider, LoopbackProvider, Placement,
    ProviderError,
};
pub use error::{ConclaveError, HandlerFault};
pub use orchestrator::{Orchestrator, TaskState, MASTER_ID};
pub use protocol::{
    AgentId, AgentStatus, CorrelationId, Message, MessageKind, Priority, Recipient,
};
pub use registry::{AgentRecord, AgentRegistry};
