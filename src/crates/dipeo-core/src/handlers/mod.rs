//! Handler registry and the per-node-type execution protocol
//!
//! Each node type pairs with one [`NodeHandler`]. Handlers receive the
//! resolved inputs, a read-only view of the execution context, and the
//! service registry; they return an output [`Envelope`] which the scheduler
//! writes back to the state store. Handlers never mutate execution state
//! directly; variable writes are staged on the returned envelope's
//! `variables_to_set` meta key and applied atomically by the scheduler.
//!
//! The registry is built once at startup ([`HandlerRegistry::builtin`]) and
//! shared read-only; new node types register a tag + handler pair before the
//! engine starts.

mod api_job;
mod batch;
mod code_job;
mod condition;
mod db;
mod end;
mod hook;
mod notion;
mod person_job;
mod start;
mod user_response;

pub use condition::evaluate_condition;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::diagram::{ExecutableDiagram, ExecutableNode, NodeType};
use crate::engine::ExecutionOptions;
use crate::envelope::{Envelope, EnvelopeError};
use crate::resolve::{ResolutionError, ResolvedInputs};
use crate::services::{ServiceError, ServiceRegistry};
use crate::state::ExecutionContext;

/// Meta key on output envelopes carrying staged variable writes.
pub const VARIABLES_TO_SET: &str = "variables_to_set";

/// Failure inside a handler, reported as `NODE_FAILED` by the engine.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Llm(#[from] dipeo_llm::LlmError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Short tag recorded as `error_type` in failure envelopes and events.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            HandlerError::Service(_) => "ServiceError",
            HandlerError::Llm(_) => "LlmError",
            HandlerError::Resolution(e) => e.kind_tag(),
            HandlerError::Envelope(_) => "EnvelopeError",
            HandlerError::Timeout(_) => "TimeoutError",
            HandlerError::Failed(_) => "HandlerError",
        }
    }
}

/// A hook event delivered to a waiting `start` node.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub name: String,
    pub payload: Value,
}

/// Mailbox for hook events; the engine pushes, hook-triggered start nodes
/// await. A watch channel versions the mailbox so a push between a failed
/// match and the subsequent wait is never lost.
pub struct HookMailbox {
    events: parking_lot::Mutex<Vec<HookEvent>>,
    version: watch::Sender<u64>,
}

impl Default for HookMailbox {
    fn default() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
            version: watch::channel(0).0,
        }
    }
}

impl HookMailbox {
    pub fn push(&self, event: HookEvent) {
        self.events.lock().push(event);
        self.version.send_modify(|v| *v += 1);
    }

    /// Take the first event matching `name` whose payload contains every
    /// filter entry; `None` when nothing matches yet.
    pub fn take_matching(&self, name: &str, filters: &BTreeMap<String, Value>) -> Option<HookEvent> {
        let mut events = self.events.lock();
        let position = events.iter().position(|e| {
            e.name == name
                && filters
                    .iter()
                    .all(|(k, v)| e.payload.get(k) == Some(v))
        })?;
        Some(events.remove(position))
    }

    /// Block until a matching event arrives.
    pub async fn wait_matching(
        &self,
        name: &str,
        filters: &BTreeMap<String, Value>,
    ) -> HookEvent {
        let mut rx = self.version.subscribe();
        loop {
            if let Some(event) = self.take_matching(name, filters) {
                return event;
            }
            // The sender lives as long as the mailbox, so this cannot fail.
            let _ = rx.changed().await;
        }
    }
}

/// Everything a handler may consult while executing one node.
pub struct HandlerCtx<'a> {
    pub node: &'a ExecutableNode,
    pub diagram: &'a ExecutableDiagram,
    /// Read-only by contract: handlers query, the scheduler mutates.
    pub context: &'a ExecutionContext,
    pub services: &'a ServiceRegistry,
    pub options: &'a ExecutionOptions,
    pub execution_id: &'a str,
    pub hooks: &'a HookMailbox,
}

impl HandlerCtx<'_> {
    /// Wrap an envelope with this execution's trace id.
    pub fn envelope_text(&self, content: impl Into<String>) -> Envelope {
        Envelope::text(content, &self.node.id).with_trace(self.execution_id)
    }

    pub fn envelope_json(&self, data: Value) -> Envelope {
        Envelope::json(data, &self.node.id).with_trace(self.execution_id)
    }
}

/// The per-node-type execution protocol.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Service keys this handler looks up; used for early diagnostics.
    fn required_services(&self) -> &'static [&'static str] {
        &[]
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError>;
}

/// Process-wide map from node type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler installed.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(start::StartHandler));
        registry.register(Arc::new(end::EndHandler));
        registry.register(Arc::new(condition::ConditionHandler));
        registry.register(Arc::new(person_job::PersonJobHandler));
        registry.register(Arc::new(code_job::CodeJobHandler));
        registry.register(Arc::new(api_job::ApiJobHandler));
        registry.register(Arc::new(db::DbHandler));
        registry.register(Arc::new(hook::HookHandler));
        registry.register(Arc::new(user_response::UserResponseHandler));
        registry.register(Arc::new(notion::NotionHandler));
        registry.register(Arc::new(batch::BatchHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(handler.node_type(), handler);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).cloned()
    }
}

/// Stage variable writes on an output envelope.
pub fn stage_variables(
    envelope: Envelope,
    variables: BTreeMap<String, Value>,
) -> Envelope {
    if variables.is_empty() {
        return envelope;
    }
    envelope.with_meta(
        VARIABLES_TO_SET,
        Value::Object(variables.into_iter().collect()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_registry_covers_every_node_type() {
        let registry = HandlerRegistry::builtin();
        for node_type in NodeType::ALL {
            assert!(registry.get(node_type).is_some(), "missing handler for {node_type}");
        }
    }

    #[test]
    fn test_stage_variables_meta() {
        let env = Envelope::text("x", "n");
        let staged = stage_variables(
            env,
            [("i".to_string(), json!(2))].into_iter().collect(),
        );
        assert_eq!(
            staged.meta.get(VARIABLES_TO_SET),
            Some(&json!({"i": 2}))
        );
    }

    #[test]
    fn test_hook_mailbox_filter_matching() {
        let mailbox = HookMailbox::default();
        mailbox.push(HookEvent { name: "deploy".into(), payload: json!({"env": "prod"}) });
        mailbox.push(HookEvent { name: "deploy".into(), payload: json!({"env": "dev"}) });

        let filters: BTreeMap<String, Value> =
            [("env".to_string(), json!("dev"))].into_iter().collect();
        let taken = mailbox.take_matching("deploy", &filters).unwrap();
        assert_eq!(taken.payload["env"], "dev");
        // Matching removed only the one event.
        assert!(mailbox.take_matching("deploy", &filters).is_none());
        assert!(mailbox.take_matching("deploy", &BTreeMap::new()).is_some());
    }
}
