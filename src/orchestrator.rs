//! Master orchestrator - decomposes user intent into task messages and
//! applies message-driven state transitions

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::bus::MessageBus;
use crate::context::{ContextManager, ExecutionContextProvider, Placement};
use crate::error::ConclaveError;
use crate::protocol::{
    self, AgentId, AgentStatus, CorrelationId, Message, MessageKind, Priority, Recipient,
};
use crate::registry::{AgentRecord, AgentRegistry};

/// Agent ID under which the orchestrator itself subscribes to the bus.
pub const MASTER_ID: &str = "master";

/// Name of the provider session all contexts are provisioned in.
const SESSION_NAME: &str = "conclave";

const HELP_TEXT: &str = "\
commands:
  /status          agents and task counts
  /spawn <type>    provision a context and register a new agent
  /list            registered agents
  /help            this help
  exit | quit      leave the REPL
any other line is dispatched as a task";

/// State of a task managed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Received,
    Decomposed,
    Dispatched,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Received => "received",
            TaskState::Decomposed => "decomposed",
            TaskState::Dispatched => "dispatched",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
struct ManagedTask {
    state: TaskState,
    description: String,
    assignee: Option<AgentId>,
}

type TaskTable = Arc<RwLock<HashMap<CorrelationId, ManagedTask>>>;

/// The master process: composes registry, context manager and bus.
pub struct Orchestrator<P> {
    id: AgentId,
    registry: Arc<AgentRegistry>,
    bus: Arc<MessageBus>,
    contexts: ContextManager<P>,
    tasks: TaskTable,
    spawn_counters: Mutex<HashMap<String, u64>>,
    rotation: Mutex<usize>,
}

impl<P: ExecutionContextProvider> Orchestrator<P> {
    pub fn new(provider: P) -> Self {
        let registry = Arc::new(AgentRegistry::new());
        let bus = Arc::new(MessageBus::new(Arc::clone(&registry)));
        let orchestrator = Self {
            id: AgentId::new(MASTER_ID),
            registry,
            bus,
            contexts: ContextManager::new(provider),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            spawn_counters: Mutex::new(HashMap::new()),
            rotation: Mutex::new(0),
        };
        orchestrator.subscribe_observer();
        orchestrator
    }

    /// The orchestrator's own subscription: status, error and response
    /// messages drive registry and task-state transitions.
    fn subscribe_observer(&self) {
        let registry = Arc::clone(&self.registry);
        let tasks = Arc::clone(&self.tasks);
        self.bus.subscribe(&self.id, "master-observer", move |message| {
            match message.kind {
                MessageKind::Status => {
                    if let Some((agent, status)) = protocol::parse_status_payload(&message.payload)
                    {
                        if let Err(e) = registry.update_status(&agent, status) {
                            debug!(error = %e, "Status report for unregistered agent ignored");
                        }
                    } else {
                        debug!(from = %message.from, "Malformed status payload ignored");
                    }
                }
                MessageKind::Error => {
                    match registry.update_status(&message.from, AgentStatus::Degraded) {
                        Ok(()) => warn!(
                            agent = %message.from,
                            payload = %message.payload,
                            "Agent reported an error; marked degraded"
                        ),
                        Err(e) => debug!(error = %e, "Error report from unregistered agent"),
                    }
                    // An error carrying the correlation ID of an
                    // outstanding task fails that task.
                    let mut tasks = tasks.write();
                    if let Some(task) = tasks.get_mut(&message.correlation_id) {
                        if task.state == TaskState::Dispatched {
                            task.state = TaskState::Failed;
                            info!(correlation = %message.correlation_id, "Task failed");
                        }
                    }
                }
                MessageKind::Response => {
                    let mut tasks = tasks.write();
                    if let Some(task) = tasks.get_mut(&message.correlation_id) {
                        if task.state == TaskState::Dispatched {
                            task.state = TaskState::Completed;
                            info!(correlation = %message.correlation_id, "Task completed");
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        });
    }

    /// Handle one line of front-end input.
    ///
    /// `/`-prefixed lines are administrative commands answered
    /// synchronously; anything else is dispatched as a task and
    /// acknowledged immediately, without blocking on completion.
    #[instrument(skip(self, input))]
    pub async fn handle_input(&self, input: &str) -> Result<String, ConclaveError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(String::new());
        }
        if let Some(rest) = input.strip_prefix('/') {
            let mut parts = rest.split_whitespace();
            return match parts.next() {
                Some("status") => Ok(self.render_status()),
                Some("list") => Ok(self.render_list()),
                Some("help") => Ok(HELP_TEXT.to_string()),
                Some("spawn") => match parts.next() {
                    Some(agent_type) => {
                        let id = self.spawn(agent_type).await?;
                        Ok(format!("spawned agent {id}"))
                    }
                    None => Ok("usage: /spawn <type>".to_string()),
                },
                Some(other) => Ok(format!("unknown command: /{other} (try /help)")),
                None => Ok(HELP_TEXT.to_string()),
            };
        }
        self.dispatch_task(input)
    }

    /// Provision a context and register a new agent, all-or-nothing.
    #[instrument(skip(self))]
    pub async fn spawn(&self, agent_type: &str) -> Result<AgentId, ConclaveError> {
        let id = self.allocate_id(agent_type);

        // Provision first: a provider failure leaves no registry entry.
        self.contexts.ensure_session(SESSION_NAME).await?;
        let handle = self
            .contexts
            .create_context(id.as_str(), Placement::Anywhere)
            .await?;

        let record = AgentRecord::new(id.clone(), agent_type).with_context(handle.clone());
        if let Err(e) = self.registry.register(record) {
            let _ = self.contexts.destroy_context(&handle).await;
            return Err(e);
        }

        let announcement = Message::status(
            self.id.clone(),
            protocol::status_payload(&id, AgentStatus::Spawning),
        )
        .with_priority(Priority::HIGH);
        self.bus.publish(announcement)?;

        info!(agent = %id, agent_type, "Spawned agent");
        Ok(id)
    }

    /// Terminate an agent: registry entry removed, subscriptions dropped,
    /// execution context released. Messages already queued for the agent
    /// are dropped by the bus's no-subscriber rule.
    #[instrument(skip(self))]
    pub async fn terminate(&self, id: &AgentId) -> Result<(), ConclaveError> {
        let record = self.registry.remove(id)?;
        self.bus.unsubscribe(id, None);
        if let Some(handle) = record.context {
            self.contexts.destroy_context(&handle).await?;
        }
        self.bus.publish(Message::status(
            self.id.clone(),
            protocol::status_payload(id, AgentStatus::Terminated),
        ))?;
        info!(agent = %id, "Terminated agent");
        Ok(())
    }

    /// Current state of a managed task.
    pub fn task_state(&self, correlation_id: &CorrelationId) -> Option<TaskState> {
        self.tasks.read().get(correlation_id).map(|t| t.state)
    }

    /// Correlation IDs of tasks not yet completed or failed.
    pub fn outstanding_tasks(&self) -> Vec<CorrelationId> {
        self.tasks
            .read()
            .iter()
            .filter(|(_, t)| !matches!(t.state, TaskState::Completed | TaskState::Failed))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    fn dispatch_task(&self, description: &str) -> Result<String, ConclaveError> {
        let correlation_id = CorrelationId::new();
        self.tasks.write().insert(
            correlation_id,
            ManagedTask {
                state: TaskState::Received,
                description: description.to_string(),
                assignee: None,
            },
        );

        // Decomposition is a placeholder step: the whole input becomes a
        // single work item.
        let plan = format!("1 work item: {description}");
        self.set_task_state(&correlation_id, TaskState::Decomposed, None);

        let target = self.pick_target();
        let recipient = match &target {
            Some(id) => Recipient::Agent(id.clone()),
            None => Recipient::Broadcast,
        };
        let message = Message::task(
            self.id.clone(),
            recipient.clone(),
            json!({ "description": description, "plan": plan }),
        )
        .with_correlation(correlation_id);
        self.bus.publish(message)?;

        self.set_task_state(&correlation_id, TaskState::Dispatched, target);
        info!(correlation = %correlation_id, to = %recipient, "Dispatched task");
        Ok(format!(
            "accepted: dispatched to {recipient} (correlation {correlation_id})"
        ))
    }

    fn set_task_state(
        &self,
        correlation_id: &CorrelationId,
        state: TaskState,
        assignee: Option<AgentId>,
    ) {
        if let Some(task) = self.tasks.write().get_mut(correlation_id) {
            task.state = state;
            if assignee.is_some() {
                task.assignee = assignee;
            }
        }
    }

    /// Round-robin over routable agents; `None` when no agent can take
    /// work, in which case the task goes out as a broadcast.
    fn pick_target(&self) -> Option<AgentId> {
        let routable: Vec<AgentId> = self
            .registry
            .list()
            .into_iter()
            .filter(|r| matches!(r.status, AgentStatus::Spawning | AgentStatus::Active))
            .map(|r| r.id)
            .collect();
        if routable.is_empty() {
            return None;
        }
        let mut rotation = self.rotation.lock();
        let target = routable[*rotation % routable.len()].clone();
        *rotation += 1;
        Some(target)
    }

    fn allocate_id(&self, agent_type: &str) -> AgentId {
        let mut counters = self.spawn_counters.lock();
        let counter = counters.entry(agent_type.to_string()).or_insert(0);
        *counter += 1;
        AgentId::new(format!("{agent_type}-{counter}"))
    }

    fn render_status(&self) -> String {
        let agents = self.registry.list();
        let mut out = format!("agents: {}\n", agents.len());
        for record in &agents {
            let _ = writeln!(
                out,
                "  {} [{}] {}",
                record.id, record.agent_type, record.status
            );
        }

        let tasks = self.tasks.read();
        let count = |state: TaskState| tasks.values().filter(|t| t.state == state).count();
        let pending =
            count(TaskState::Received) + count(TaskState::Decomposed) + count(TaskState::Dispatched);
        let _ = writeln!(
            out,
            "tasks: {} (pending {}, completed {}, failed {})",
            tasks.len(),
            pending,
            count(TaskState::Completed),
            count(TaskState::Failed)
        );
        for (correlation, task) in tasks.iter() {
            if matches!(task.state, TaskState::Completed | TaskState::Failed) {
                continue;
            }
            let assignee = task
                .assignee
                .as_ref()
                .map(|a| a.as_str())
                .unwrap_or("broadcast");
            let _ = writeln!(
                out,
                "  {correlation} [{}] {} -> {}",
                task.state, task.description, assignee
            );
        }
        out.trim_end().to_string()
    }

    fn render_list(&self) -> String {
        let agents = self.registry.list();
        if agents.is_empty() {
            return "no agents registered".to_string();
        }
        agents
            .iter()
            .map(|r| format!("{} [{}] {}", r.id, r.agent_type, r.status))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
