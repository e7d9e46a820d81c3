//! Runtime state records for executions and their nodes

pub mod context;

pub use context::{Checkpoint, ExecutionContext, StateError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::diagram::NodeId;
use crate::envelope::Envelope;

/// Per-node runtime status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    MaxiterReached,
    Paused,
}

impl Status {
    /// Whether this status ends the node's participation in the execution
    /// (barring an explicit reset by the scheduler).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Skipped | Status::MaxiterReached
        )
    }
}

/// Per-execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }
}

/// Aggregated token accounting for LLM calls.
pub use dipeo_llm::TokenUsage;

/// Per-node runtime record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: Status,
    pub execution_count: u32,
    /// Serialized form of the most recent output envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: Status::Pending,
            execution_count: 0,
            last_output: None,
            error: None,
            started_at: None,
            ended_at: None,
            token_usage: None,
        }
    }
}

impl NodeState {
    pub fn output_envelope(&self) -> Option<Envelope> {
        self.last_output
            .as_ref()
            .and_then(|v| Envelope::deserialize(v).ok())
    }
}

/// Per-execution aggregate state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram_id: Option<String>,
    pub status: ExecutionStatus,
    pub node_states: BTreeMap<NodeId, NodeState>,
    /// Branch label taken per condition node.
    pub branch_decisions: BTreeMap<NodeId, String>,
    /// Per loop-gate node: whether the loop should continue.
    pub loop_state: BTreeMap<NodeId, bool>,
    /// Execution-scoped variable scope shared by all nodes.
    pub variables: BTreeMap<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub token_usage: TokenUsage,
    pub execution_metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_event_data: Option<Value>,
}

impl ExecutionState {
    pub fn new(id: impl Into<String>, diagram_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            diagram_id,
            status: ExecutionStatus::Started,
            node_states: BTreeMap::new(),
            branch_decisions: BTreeMap::new(),
            loop_state: BTreeMap::new(),
            variables: BTreeMap::new(),
            started_at: Utc::now(),
            ended_at: None,
            token_usage: TokenUsage::default(),
            execution_metadata: BTreeMap::new(),
            hook_event_data: None,
        }
    }
}
