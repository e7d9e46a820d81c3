//! Per-execution context and state store
//!
//! The [`ExecutionContext`] owns all mutable state of one execution: node
//! states, outputs, branch decisions, loop flags, variables, and metadata.
//! Only the scheduler loop mutates it; handlers receive a shared reference
//! and use the read-side accessors. Queries are total (they return empty
//! values for unknown nodes) while transitions validate the source status
//! and fail with [`StateError::InvalidTransition`] otherwise.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::diagram::{ExecutableDiagram, NodeId};
use crate::envelope::Envelope;

use super::{ExecutionState, ExecutionStatus, NodeState, Status, TokenUsage};

/// State-store errors. Only transitions can fail; queries are total.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("node '{node}' cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        node: NodeId,
        from: Status,
        to: Status,
    },
    #[error("unknown node '{0}'")]
    UnknownNode(NodeId),
    #[error("unknown checkpoint '{0}'")]
    UnknownCheckpoint(String),
}

/// A named snapshot of the full execution state.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: ExecutionState,
}

/// Thread-safe per-execution state store.
pub struct ExecutionContext {
    inner: RwLock<ExecutionState>,
    checkpoints: RwLock<Vec<Checkpoint>>,
}

impl ExecutionContext {
    /// Create a context with every diagram node in `pending`.
    pub fn new(execution_id: impl Into<String>, diagram: &ExecutableDiagram) -> Self {
        let mut state = ExecutionState::new(execution_id, diagram.id.clone());
        for node in diagram.nodes() {
            state.node_states.insert(node.id.clone(), NodeState::default());
        }
        Self {
            inner: RwLock::new(state),
            checkpoints: RwLock::new(Vec::new()),
        }
    }

    pub fn execution_id(&self) -> String {
        self.inner.read().id.clone()
    }

    pub fn execution_status(&self) -> ExecutionStatus {
        self.inner.read().status
    }

    pub fn set_execution_status(&self, status: ExecutionStatus) {
        let mut state = self.inner.write();
        state.status = status;
        if status.is_terminal() {
            state.ended_at = Some(Utc::now());
        }
    }

    /// Clone of the full execution state, e.g. for snapshots and events.
    pub fn snapshot(&self) -> ExecutionState {
        self.inner.read().clone()
    }

    // ---- node state transitions -------------------------------------------

    /// `pending → running`. Increments the execution count and returns it.
    pub fn to_running(&self, node: &str) -> Result<u32, StateError> {
        self.transition(node, Status::Running, &[Status::Pending], |ns| {
            ns.execution_count += 1;
            ns.started_at = Some(Utc::now());
            ns.ended_at = None;
            ns.error = None;
        })
        .map(|ns| ns.execution_count)
    }

    /// `running → completed`. Records the output envelope exactly once for
    /// this execution count.
    pub fn to_completed(
        &self,
        node: &str,
        output: &Envelope,
        token_usage: Option<TokenUsage>,
    ) -> Result<(), StateError> {
        let usage = token_usage;
        self.transition(node, Status::Completed, &[Status::Running], |ns| {
            ns.last_output = Some(output.serialize());
            ns.ended_at = Some(Utc::now());
            if let Some(u) = usage {
                let total = ns.token_usage.get_or_insert_with(TokenUsage::default);
                total.add(&u);
            }
        })?;
        if let Some(u) = token_usage {
            self.inner.write().token_usage.add(&u);
        }
        Ok(())
    }

    /// `running → failed` (also reachable from `pending` when resolution
    /// fails before dispatch).
    pub fn to_failed(&self, node: &str, error: impl Into<String>) -> Result<(), StateError> {
        let error = error.into();
        self.transition(node, Status::Failed, &[Status::Running, Status::Pending], |ns| {
            ns.error = Some(error);
            ns.ended_at = Some(Utc::now());
        })
        .map(|_| ())
    }

    /// `pending → skipped`, emitting a null output so downstream resolution
    /// still finds a value.
    pub fn to_skipped(&self, node: &str) -> Result<(), StateError> {
        let null_output = Envelope::null(node).with_trace(&self.execution_id());
        self.transition(node, Status::Skipped, &[Status::Pending], |ns| {
            ns.last_output = Some(null_output.serialize());
            ns.ended_at = Some(Utc::now());
        })
        .map(|_| ())
    }

    /// Transition to `maxiter_reached` (terminal, distinct from failure).
    pub fn to_maxiter(&self, node: &str, output: Option<&Envelope>) -> Result<(), StateError> {
        self.transition(
            node,
            Status::MaxiterReached,
            &[Status::Pending, Status::Running],
            |ns| {
                if let Some(env) = output {
                    ns.last_output = Some(env.serialize());
                }
                ns.ended_at = Some(Utc::now());
            },
        )
        .map(|_| ())
    }

    /// `running → paused` at a cooperative suspension point.
    pub fn to_paused(&self, node: &str) -> Result<(), StateError> {
        self.transition(node, Status::Paused, &[Status::Running], |_| {}).map(|_| ())
    }

    /// `paused → running` without counting a new execution.
    pub fn resume_node(&self, node: &str) -> Result<(), StateError> {
        self.transition(node, Status::Running, &[Status::Paused], |_| {}).map(|_| ())
    }

    /// Re-arm a completed node back to `pending` for another loop pass. The
    /// execution count and last output are preserved.
    pub fn reset(&self, node: &str) -> Result<(), StateError> {
        self.transition(node, Status::Pending, &[Status::Completed], |ns| {
            ns.started_at = None;
            ns.ended_at = None;
            ns.error = None;
        })
        .map(|_| ())
    }

    fn transition(
        &self,
        node: &str,
        to: Status,
        allowed_from: &[Status],
        apply: impl FnOnce(&mut NodeState),
    ) -> Result<NodeState, StateError> {
        let mut state = self.inner.write();
        let ns = state
            .node_states
            .get_mut(node)
            .ok_or_else(|| StateError::UnknownNode(node.to_string()))?;
        if !allowed_from.contains(&ns.status) {
            return Err(StateError::InvalidTransition {
                node: node.to_string(),
                from: ns.status,
                to,
            });
        }
        ns.status = to;
        apply(ns);
        Ok(ns.clone())
    }

    // ---- queries (total) ---------------------------------------------------

    pub fn get_state(&self, node: &str) -> Option<NodeState> {
        self.inner.read().node_states.get(node).cloned()
    }

    pub fn get_status(&self, node: &str) -> Option<Status> {
        self.inner.read().node_states.get(node).map(|ns| ns.status)
    }

    pub fn get_output(&self, node: &str) -> Option<Envelope> {
        self.inner
            .read()
            .node_states
            .get(node)
            .and_then(NodeState::output_envelope)
    }

    pub fn get_execution_count(&self, node: &str) -> u32 {
        self.inner
            .read()
            .node_states
            .get(node)
            .map(|ns| ns.execution_count)
            .unwrap_or(0)
    }

    pub fn nodes_with_status(&self, status: Status) -> Vec<NodeId> {
        self.inner
            .read()
            .node_states
            .iter()
            .filter(|(_, ns)| ns.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get_completed_nodes(&self) -> Vec<NodeId> {
        self.nodes_with_status(Status::Completed)
    }

    pub fn get_running_nodes(&self) -> Vec<NodeId> {
        self.nodes_with_status(Status::Running)
    }

    pub fn get_failed_nodes(&self) -> Vec<NodeId> {
        self.nodes_with_status(Status::Failed)
    }

    pub fn get_all_node_states(&self) -> BTreeMap<NodeId, NodeState> {
        self.inner.read().node_states.clone()
    }

    pub fn all_nodes_terminal(&self) -> bool {
        self.inner
            .read()
            .node_states
            .values()
            .all(|ns| ns.status.is_terminal())
    }

    // ---- control-flow annotations -----------------------------------------

    pub fn mark_branch_taken(&self, cond_node: &str, branch: &str) {
        self.inner
            .write()
            .branch_decisions
            .insert(cond_node.to_string(), branch.to_string());
    }

    pub fn get_branch_taken(&self, cond_node: &str) -> Option<String> {
        self.inner.read().branch_decisions.get(cond_node).cloned()
    }

    pub fn is_loop_active(&self, node: &str) -> bool {
        self.inner.read().loop_state.get(node).copied().unwrap_or(false)
    }

    pub fn update_loop_state(&self, node: &str, should_continue: bool) {
        self.inner
            .write()
            .loop_state
            .insert(node.to_string(), should_continue);
    }

    // ---- variables ---------------------------------------------------------

    pub fn get_variables(&self) -> BTreeMap<String, Value> {
        self.inner.read().variables.clone()
    }

    pub fn get_variable(&self, key: &str) -> Option<Value> {
        self.inner.read().variables.get(key).cloned()
    }

    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.inner.write().variables.insert(key.into(), value);
    }

    pub fn set_variables(&self, values: impl IntoIterator<Item = (String, Value)>) {
        let mut state = self.inner.write();
        for (k, v) in values {
            state.variables.insert(k, v);
        }
    }

    // ---- metadata ----------------------------------------------------------

    pub fn get_execution_metadata(&self) -> BTreeMap<String, Value> {
        self.inner.read().execution_metadata.clone()
    }

    pub fn set_execution_metadata(&self, key: impl Into<String>, value: Value) {
        self.inner.write().execution_metadata.insert(key.into(), value);
    }

    pub fn set_node_metadata(&self, node: &str, key: &str, value: Value) {
        let mut state = self.inner.write();
        let entry = state
            .execution_metadata
            .entry(format!("node:{node}"))
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), value);
        }
    }

    pub fn get_node_metadata(&self, node: &str, key: &str) -> Option<Value> {
        self.inner
            .read()
            .execution_metadata
            .get(&format!("node:{node}"))
            .and_then(|v| v.get(key))
            .cloned()
    }

    pub fn set_hook_event_data(&self, data: Value) {
        self.inner.write().hook_event_data = Some(data);
    }

    // ---- checkpoints (optional extension) ---------------------------------

    pub fn create_checkpoint(&self, name: Option<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let checkpoint = Checkpoint {
            id: id.clone(),
            name,
            created_at: Utc::now(),
            state: self.snapshot(),
        };
        self.checkpoints.write().push(checkpoint);
        id
    }

    pub fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<(), StateError> {
        let checkpoints = self.checkpoints.read();
        let checkpoint = checkpoints
            .iter()
            .find(|c| c.id == checkpoint_id)
            .ok_or_else(|| StateError::UnknownCheckpoint(checkpoint_id.to_string()))?;
        *self.inner.write() = checkpoint.state.clone();
        Ok(())
    }

    pub fn list_checkpoints(&self) -> Vec<(String, Option<String>, DateTime<Utc>)> {
        self.checkpoints
            .read()
            .iter()
            .map(|c| (c.id.clone(), c.name.clone(), c.created_at))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::diagram::DiagramSpec;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let spec = DiagramSpec::from_yaml(
            r#"
nodes:
  - id: start
    type: start
  - id: end
    type: end
arrows:
  - source: start
    target: end
"#,
        )
        .unwrap();
        let diagram = compile(&spec).into_diagram().unwrap();
        ExecutionContext::new("exec-1", &diagram)
    }

    #[test]
    fn test_running_increments_execution_count() {
        let ctx = context();
        assert_eq!(ctx.get_execution_count("start"), 0);
        assert_eq!(ctx.to_running("start").unwrap(), 1);
        assert_eq!(ctx.get_execution_count("start"), 1);
        assert_eq!(ctx.get_status("start"), Some(Status::Running));
    }

    #[test]
    fn test_double_running_is_invalid() {
        let ctx = context();
        ctx.to_running("start").unwrap();
        assert!(matches!(
            ctx.to_running("start"),
            Err(StateError::InvalidTransition { from: Status::Running, .. })
        ));
    }

    #[test]
    fn test_completed_records_output() {
        let ctx = context();
        ctx.to_running("start").unwrap();
        let out = Envelope::json(json!({"x": 1}), "start");
        ctx.to_completed("start", &out, None).unwrap();

        let stored = ctx.get_output("start").unwrap();
        assert_eq!(stored.produced_by, "start");
        assert_eq!(stored.as_json().unwrap(), json!({"x": 1}));
    }

    #[test]
    fn test_completed_requires_running() {
        let ctx = context();
        let out = Envelope::text("x", "start");
        assert!(ctx.to_completed("start", &out, None).is_err());
    }

    #[test]
    fn test_skip_emits_null_output() {
        let ctx = context();
        ctx.to_skipped("end").unwrap();
        assert_eq!(ctx.get_status("end"), Some(Status::Skipped));
        assert!(ctx.get_output("end").unwrap().is_null());
    }

    #[test]
    fn test_reset_preserves_count_and_output() {
        let ctx = context();
        ctx.to_running("start").unwrap();
        ctx.to_completed("start", &Envelope::text("a", "start"), None).unwrap();
        ctx.reset("start").unwrap();

        assert_eq!(ctx.get_status("start"), Some(Status::Pending));
        assert_eq!(ctx.get_execution_count("start"), 1);
        assert!(ctx.get_output("start").is_some());

        // A second run counts up from the preserved count.
        assert_eq!(ctx.to_running("start").unwrap(), 2);
    }

    #[test]
    fn test_queries_are_total_for_unknown_nodes() {
        let ctx = context();
        assert_eq!(ctx.get_execution_count("ghost"), 0);
        assert!(ctx.get_state("ghost").is_none());
        assert!(ctx.get_output("ghost").is_none());
    }

    #[test]
    fn test_branch_and_loop_annotations() {
        let ctx = context();
        assert!(ctx.get_branch_taken("cond").is_none());
        ctx.mark_branch_taken("cond", "condfalse");
        assert_eq!(ctx.get_branch_taken("cond").as_deref(), Some("condfalse"));

        assert!(!ctx.is_loop_active("cond"));
        ctx.update_loop_state("cond", true);
        assert!(ctx.is_loop_active("cond"));
    }

    #[test]
    fn test_variables_read_your_writes() {
        let ctx = context();
        ctx.set_variable("i", json!(3));
        assert_eq!(ctx.get_variable("i"), Some(json!(3)));
        assert_eq!(ctx.get_variables().len(), 1);
    }

    #[test]
    fn test_token_usage_aggregates() {
        let ctx = context();
        ctx.to_running("start").unwrap();
        let usage = TokenUsage { input: 10, output: 5, total: 15 };
        ctx.to_completed("start", &Envelope::text("x", "start"), Some(usage)).unwrap();

        let snap = ctx.snapshot();
        assert_eq!(snap.token_usage.total, 15);
        assert_eq!(
            snap.node_states["start"].token_usage.as_ref().unwrap().input,
            10
        );
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let ctx = context();
        ctx.set_variable("k", json!("v1"));
        let checkpoint = ctx.create_checkpoint(Some("before".to_string()));

        ctx.set_variable("k", json!("v2"));
        assert_eq!(ctx.get_variable("k"), Some(json!("v2")));

        ctx.restore_checkpoint(&checkpoint).unwrap();
        assert_eq!(ctx.get_variable("k"), Some(json!("v1")));
        assert_eq!(ctx.list_checkpoints().len(), 1);
        assert!(ctx.restore_checkpoint("missing").is_err());
    }
}
