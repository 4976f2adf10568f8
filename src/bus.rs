//! Message bus - priority-ordered delivery with pub/sub fan-out
//!
//! The bus owns the only mutable shared state of the core besides the
//! registry: the pending queue. Queue mutation and dispatch are strictly
//! sequential; there are never two delivery passes in flight at once.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{ConclaveError, HandlerFault};
use crate::protocol::{AgentId, AgentStatus, Message, Recipient};
use crate::registry::AgentRegistry;

/// Handler invoked for each message delivered to a subscribed agent.
pub type Handler = dyn Fn(&Message) -> Result<(), HandlerFault> + Send + Sync;

/// Sink receiving messages that were dropped without a delivery.
pub type DeadLetterSink = dyn Fn(&Message) + Send + Sync;

struct Subscription {
    label: String,
    handler: Arc<Handler>,
}

#[derive(Default)]
struct Pending {
    queue: Vec<Message>,
    delivering: bool,
    closed: bool,
}

/// Priority queue plus pub/sub router.
///
/// Delivery is at-most-once and best-effort: a message whose recipient has
/// no subscribers is dropped silently (observable through the optional
/// dead-letter sink).
pub struct MessageBus {
    pending: Mutex<Pending>,
    // Registration order is preserved so broadcast fan-out is deterministic.
    subscriptions: RwLock<Vec<(AgentId, Vec<Subscription>)>>,
    dead_letter: RwLock<Option<Arc<DeadLetterSink>>>,
    registry: Arc<AgentRegistry>,
}

impl MessageBus {
    /// Create a bus. The registry is consulted for liveness checks only.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            subscriptions: RwLock::new(Vec::new()),
            dead_letter: RwLock::new(None),
            registry,
        }
    }

    /// Enqueue a message for delivery.
    ///
    /// Returns once the message is durably queued, not once delivered. If
    /// the bus was idle the calling thread runs the delivery pass itself
    /// and returns after the queue drains (synchronous drain); if a pass is
    /// already in flight the message is picked up by that pass and this
    /// call returns immediately (fire-and-forget enqueue).
    pub fn publish(&self, message: Message) -> Result<(), ConclaveError> {
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(ConclaveError::BusClosed);
            }
            debug!(
                from = %message.from,
                to = %message.to,
                kind = %message.kind,
                priority = message.priority.value(),
                correlation = %message.correlation_id,
                "Queued message"
            );
            pending.queue.push(message);
            // Stable sort: equal priorities keep arrival order.
            pending.queue.sort_by(|a, b| b.priority.cmp(&a.priority));
            if pending.delivering {
                return Ok(());
            }
            pending.delivering = true;
        }
        self.drain();
        Ok(())
    }

    /// Register a handler for an agent under a caller-chosen label.
    ///
    /// Handlers for the same agent run in registration order. Registering
    /// an already-present (agent, label) pair is a no-op.
    pub fn subscribe(
        &self,
        agent_id: &AgentId,
        label: &str,
        handler: impl Fn(&Message) -> Result<(), HandlerFault> + Send + Sync + 'static,
    ) {
        let mut subscriptions = self.subscriptions.write();
        let index = match subscriptions.iter().position(|(id, _)| id == agent_id) {
            Some(index) => index,
            None => {
                subscriptions.push((agent_id.clone(), Vec::new()));
                subscriptions.len() - 1
            }
        };
        let handlers = &mut subscriptions[index].1;
        if handlers.iter().any(|s| s.label == label) {
            return;
        }
        handlers.push(Subscription {
            label: label.to_string(),
            handler: Arc::new(handler),
        });
        debug!(agent = %agent_id, label, "Subscribed handler");
    }

    /// Remove one labeled handler, or all handlers for the agent when
    /// `label` is `None`.
    pub fn unsubscribe(&self, agent_id: &AgentId, label: Option<&str>) {
        let mut subscriptions = self.subscriptions.write();
        match label {
            None => subscriptions.retain(|(id, _)| id != agent_id),
            Some(label) => {
                if let Some((_, handlers)) =
                    subscriptions.iter_mut().find(|(id, _)| id == agent_id)
                {
                    handlers.retain(|s| s.label != label);
                }
                subscriptions.retain(|(_, handlers)| !handlers.is_empty());
            }
        }
    }

    /// Install a sink observing every dropped message.
    pub fn set_dead_letter(&self, sink: impl Fn(&Message) + Send + Sync + 'static) {
        *self.dead_letter.write() = Some(Arc::new(sink));
    }

    /// Shut the bus down. Subsequent publishes fail with `BusClosed`;
    /// an in-flight pass still drains what is already queued.
    pub fn close(&self) {
        self.pending.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Number of handlers currently subscribed for an agent.
    pub fn handler_count(&self, agent_id: &AgentId) -> usize {
        self.subscriptions
            .read()
            .iter()
            .find(|(id, _)| id == agent_id)
            .map(|(_, handlers)| handlers.len())
            .unwrap_or(0)
    }

    /// One delivery pass: pop the head until the queue is empty. Emptiness
    /// is re-checked each iteration, so messages published while the pass
    /// runs are handled by this same pass.
    fn drain(&self) {
        loop {
            let message = {
                let mut pending = self.pending.lock();
                if pending.queue.is_empty() {
                    pending.delivering = false;
                    return;
                }
                pending.queue.remove(0)
            };
            self.dispatch(&message);
        }
    }

    fn dispatch(&self, message: &Message) {
        // Liveness check: direct messages to an agent the registry knows as
        // terminated are dropped before handler dispatch.
        if let Recipient::Agent(id) = &message.to {
            if let Ok(record) = self.registry.get(id) {
                if record.status == AgentStatus::Terminated {
                    debug!(recipient = %id, "Dropping message to terminated agent");
                    self.dead_letter(message);
                    return;
                }
            }
        }

        // Snapshot the targets so no lock is held while handlers run.
        let targets: Vec<(AgentId, Vec<(String, Arc<Handler>)>)> = {
            let subscriptions = self.subscriptions.read();
            subscriptions
                .iter()
                .filter(|(id, _)| match &message.to {
                    Recipient::Agent(recipient) => id == recipient,
                    // A handler is never invoked for its own broadcasts.
                    Recipient::Broadcast => *id != message.from,
                })
                .map(|(id, handlers)| {
                    let handlers = handlers
                        .iter()
                        .map(|s| (s.label.clone(), Arc::clone(&s.handler)))
                        .collect();
                    (id.clone(), handlers)
                })
                .collect()
        };

        if targets.iter().all(|(_, handlers)| handlers.is_empty()) {
            self.dead_letter(message);
            return;
        }

        for (agent, handlers) in targets {
            for (label, handler) in handlers {
                if let Err(fault) = handler(message) {
                    // Fault isolation: one misbehaving handler never blocks
                    // delivery to the rest.
                    warn!(
                        agent = %agent,
                        handler = label,
                        correlation = %message.correlation_id,
                        error = %fault,
                        "Handler fault during delivery"
                    );
                }
            }
        }
    }

    fn dead_letter(&self, message: &Message) {
        debug!(
            to = %message.to,
            kind = %message.kind,
            correlation = %message.correlation_id,
            "Dropped message with no subscribers"
        );
        // Snapshot so the sink runs without the lock held.
        let sink = self.dead_letter.read().as_ref().map(Arc::clone);
        if let Some(sink) = sink {
            sink(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, Priority};
    use serde_json::json;

    fn bus() -> Arc<MessageBus> {
        Arc::new(MessageBus::new(Arc::new(AgentRegistry::new())))
    }

    /// Collector recording "agent:tag" per delivery, in order.
    fn collect(
        bus: &MessageBus,
        agent: &str,
        log: &Arc<Mutex<Vec<String>>>,
    ) {
        let log = Arc::clone(log);
        let name = agent.to_string();
        bus.subscribe(&AgentId::new(agent), "collector", move |message| {
            let tag = message.payload["tag"].as_str().unwrap_or("?");
            log.lock().push(format!("{name}:{tag}"));
            Ok(())
        });
    }

    fn tagged(from: &str, to: Recipient, tag: &str, priority: u8) -> Message {
        Message::task(AgentId::new(from), to, json!({ "tag": tag }))
            .with_priority(Priority::new(priority))
    }

    #[test]
    fn test_priority_order_is_stable() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        collect(&bus, "a", &log);

        // The seed handler enqueues while the pass is active, so all four
        // messages are queued together and sorted before delivery to "a".
        let seeder = Arc::clone(&bus);
        bus.subscribe(&AgentId::new("seed"), "seeder", move |_| {
            for (tag, priority) in [("low", 1), ("hi-1", 5), ("hi-2", 5), ("mid", 3)] {
                seeder
                    .publish(tagged("seed", Recipient::Agent(AgentId::new("a")), tag, priority))
                    .map_err(|e| HandlerFault::new(e.to_string()))?;
            }
            Ok(())
        });

        bus.publish(tagged("master", Recipient::Agent(AgentId::new("seed")), "go", 5))
            .unwrap();

        assert_eq!(*log.lock(), ["a:hi-1", "a:hi-2", "a:mid", "a:low"]);
    }

    #[test]
    fn test_handler_fault_is_isolated() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(&AgentId::new("a"), "faulty", |_| {
            Err(HandlerFault::new("boom"))
        });
        collect(&bus, "a", &log);

        bus.publish(tagged("master", Recipient::Agent(AgentId::new("a")), "m1", 5))
            .unwrap();
        bus.publish(tagged("master", Recipient::Agent(AgentId::new("a")), "m2", 5))
            .unwrap();

        // The faulty handler blocked neither its co-subscriber nor the
        // following message.
        assert_eq!(*log.lock(), ["a:m1", "a:m2"]);
    }

    #[test]
    fn test_broadcast_excludes_sender_and_respects_priority() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        collect(&bus, "a", &log);
        collect(&bus, "b", &log);

        // Queue broadcast B1 (priority 1, from "a") and direct D1 to "a"
        // (priority 5) within one pass: D1 must land first, and B1 must
        // reach "b" only.
        let seeder = Arc::clone(&bus);
        bus.subscribe(&AgentId::new("seed"), "seeder", move |message| {
            // B1 fans out to "seed" too; only the kickoff message seeds.
            if message.payload["tag"] != "go" {
                return Ok(());
            }
            seeder
                .publish(tagged("a", Recipient::Broadcast, "B1", 1))
                .map_err(|e| HandlerFault::new(e.to_string()))?;
            seeder
                .publish(tagged("master", Recipient::Agent(AgentId::new("a")), "D1", 5))
                .map_err(|e| HandlerFault::new(e.to_string()))?;
            Ok(())
        });

        bus.publish(tagged("master", Recipient::Agent(AgentId::new("seed")), "go", 5))
            .unwrap();

        assert_eq!(*log.lock(), ["a:D1", "b:B1"]);
    }

    #[test]
    fn test_unsubscribe_drops_queued_messages() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let dropped = Arc::new(Mutex::new(Vec::new()));
        collect(&bus, "b", &log);

        let sink = Arc::clone(&dropped);
        bus.set_dead_letter(move |message| {
            sink.lock().push(message.payload["tag"].as_str().unwrap_or("?").to_string());
        });

        // The seed handler queues a message to "b" and then unsubscribes
        // it, before the queued message is dispatched.
        let seeder = Arc::clone(&bus);
        bus.subscribe(&AgentId::new("seed"), "seeder", move |_| {
            seeder
                .publish(tagged("master", Recipient::Agent(AgentId::new("b")), "late", 1))
                .map_err(|e| HandlerFault::new(e.to_string()))?;
            seeder.unsubscribe(&AgentId::new("b"), None);
            Ok(())
        });

        bus.publish(tagged("master", Recipient::Agent(AgentId::new("seed")), "go", 5))
            .unwrap();

        assert!(log.lock().is_empty());
        assert_eq!(*dropped.lock(), ["late"]);
    }

    #[test]
    fn test_unsubscribe_specific_label_leaves_others() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        collect(&bus, "a", &log);
        bus.subscribe(&AgentId::new("a"), "extra", |_| Ok(()));
        assert_eq!(bus.handler_count(&AgentId::new("a")), 2);

        bus.unsubscribe(&AgentId::new("a"), Some("extra"));
        assert_eq!(bus.handler_count(&AgentId::new("a")), 1);

        bus.publish(tagged("master", Recipient::Agent(AgentId::new("a")), "still", 5))
            .unwrap();
        assert_eq!(*log.lock(), ["a:still"]);
    }

    #[test]
    fn test_resubscribe_same_label_is_noop() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        collect(&bus, "a", &log);
        collect(&bus, "a", &log);
        assert_eq!(bus.handler_count(&AgentId::new("a")), 1);

        bus.publish(tagged("master", Recipient::Agent(AgentId::new("a")), "once", 5))
            .unwrap();
        assert_eq!(*log.lock(), ["a:once"]);
    }

    #[test]
    fn test_no_subscriber_is_silent_drop() {
        let bus = bus();
        let dropped = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&dropped);
        bus.set_dead_letter(move |_| *sink.lock() += 1);

        let result =
            bus.publish(tagged("master", Recipient::Agent(AgentId::new("nobody")), "x", 5));
        assert!(result.is_ok());
        assert_eq!(*dropped.lock(), 1);
    }

    #[test]
    fn test_closed_bus_rejects_publish() {
        let bus = bus();
        bus.close();
        let err = bus
            .publish(tagged("master", Recipient::Broadcast, "x", 5))
            .unwrap_err();
        assert!(matches!(err, ConclaveError::BusClosed));
        assert!(bus.is_closed());
    }

    #[test]
    fn test_terminated_agent_is_skipped() {
        let registry = Arc::new(AgentRegistry::new());
        let bus = Arc::new(MessageBus::new(Arc::clone(&registry)));
        let log = Arc::new(Mutex::new(Vec::new()));
        collect(&bus, "a", &log);

        registry
            .register(crate::registry::AgentRecord::new(AgentId::new("a"), "worker"))
            .unwrap();
        registry
            .update_status(&AgentId::new("a"), AgentStatus::Terminated)
            .unwrap();

        bus.publish(tagged("master", Recipient::Agent(AgentId::new("a")), "dead", 5))
            .unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            bus.subscribe(&AgentId::new("a"), label, move |_| {
                log.lock().push(label);
                Ok(())
            });
        }

        let message = Message::new(
            AgentId::new("master"),
            Recipient::Agent(AgentId::new("a")),
            MessageKind::Query,
        );
        bus.publish(message).unwrap();
        assert_eq!(*log.lock(), ["first", "second", "third"]);
    }
}
