//! Protocol types shared across the orchestration core

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// Wire sentinel for a broadcast recipient.
pub const BROADCAST: &str = "broadcast";

/// Identifier of an agent. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lifecycle status of an agent.
///
/// Transitions are permissive: any status may follow any status. Failures
/// are reported through message flow, not through registry validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Spawning,
    Active,
    Degraded,
    Terminated,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Spawning => "spawning",
            AgentStatus::Active => "active",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Message urgency. Higher values are delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(8);
    pub const URGENT: Priority = Priority(10);
    pub const MAX: Priority = Priority(10);

    /// Create a priority, clamped to the allowed range.
    pub fn new(value: u8) -> Self {
        Self(value.min(Self::MAX.0))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Kind of a message on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Task,
    Status,
    Query,
    Response,
    Error,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Task => "task",
            MessageKind::Status => "status",
            MessageKind::Query => "query",
            MessageKind::Response => "response",
            MessageKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// Recipient of a message: a concrete agent or the broadcast sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Agent(AgentId),
    Broadcast,
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Agent(id) => id.fmt(f),
            Recipient::Broadcast => f.write_str(BROADCAST),
        }
    }
}

impl Serialize for Recipient {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Recipient::Agent(id) => serializer.serialize_str(id.as_str()),
            Recipient::Broadcast => serializer.serialize_str(BROADCAST),
        }
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == BROADCAST {
            Ok(Recipient::Broadcast)
        } else {
            Ok(Recipient::Agent(AgentId::new(raw)))
        }
    }
}

/// Identifier linking a request message to its eventual response(s).
///
/// Assigned at message creation and never reused for an unrelated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An immutable message exchanged over the bus.
///
/// Serializes to the cross-process wire shape:
/// `{from, to, type, priority, payload, timestamp, correlationId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Sending agent
    pub from: AgentId,
    /// Concrete agent or broadcast
    pub to: Recipient,
    /// Message kind
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Urgency, higher delivered first
    pub priority: Priority,
    /// Opaque structured payload, interpreted only by the ultimate consumer
    pub payload: Value,
    /// Creation time (ISO-8601 on the wire)
    pub timestamp: DateTime<Utc>,
    /// Groups a request with its response(s)
    pub correlation_id: CorrelationId,
}

impl Message {
    pub fn new(from: AgentId, to: Recipient, kind: MessageKind) -> Self {
        Self {
            from,
            to,
            kind,
            priority: Priority::NORMAL,
            payload: Value::Null,
            timestamp: Utc::now(),
            correlation_id: CorrelationId::new(),
        }
    }

    /// Create a task message.
    pub fn task(from: AgentId, to: Recipient, payload: Value) -> Self {
        Self::new(from, to, MessageKind::Task).with_payload(payload)
    }

    /// Create a broadcast status message.
    pub fn status(from: AgentId, payload: Value) -> Self {
        Self::new(from, Recipient::Broadcast, MessageKind::Status).with_payload(payload)
    }

    /// Create a query to a specific agent.
    pub fn query(from: AgentId, to: AgentId, payload: Value) -> Self {
        Self::new(from, Recipient::Agent(to), MessageKind::Query).with_payload(payload)
    }

    /// Create a response answering the request identified by `correlation_id`.
    pub fn response(
        from: AgentId,
        to: AgentId,
        correlation_id: CorrelationId,
        payload: Value,
    ) -> Self {
        Self::new(from, Recipient::Agent(to), MessageKind::Response)
            .with_payload(payload)
            .with_correlation(correlation_id)
    }

    /// Create an error report addressed to `to`.
    pub fn error(from: AgentId, to: Recipient, payload: Value) -> Self {
        Self::new(from, to, MessageKind::Error).with_payload(payload)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// Payload shape used by status messages so announcements and the
/// orchestrator's observer agree on it.
pub fn status_payload(agent: &AgentId, status: AgentStatus) -> Value {
    serde_json::json!({ "agent": agent.as_str(), "status": status })
}

/// Extract the (agent, status) pair from a status payload, if well-formed.
pub fn parse_status_payload(payload: &Value) -> Option<(AgentId, AgentStatus)> {
    let agent = payload.get("agent")?.as_str()?;
    let status = serde_json::from_value(payload.get("status")?.clone()).ok()?;
    Some((AgentId::new(agent), status))
}
