//! Executable edges connecting node output handles to input handles

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::node::NodeId;

/// Default handle name used when an arrow does not name one.
pub const DEFAULT_HANDLE: &str = "default";

/// Branch output handles emitted by condition nodes.
pub const BRANCH_TRUE: &str = "condtrue";
pub const BRANCH_FALSE: &str = "condfalse";

/// Named transformation applied to a value as it crosses an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformRule {
    JsonToText,
    TextToJson,
    /// Marks an edge leaving a condition node; the addressed branch output is
    /// extracted and the edge carries nothing when the other branch was taken.
    BranchOnCondition,
}

/// How a transformed edge value is combined into the target's input map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Packing {
    /// Bind the value under the edge's `target_input` key (later edges with
    /// the same key overwrite).
    #[default]
    Pack,
    /// Shallow-merge the value's keys into the input map; collisions are a
    /// hard error.
    Spread,
}

/// Immutable edge within an [`ExecutableDiagram`](super::ExecutableDiagram).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableEdge {
    pub id: String,
    pub source_node_id: NodeId,
    /// Named output port on the source; `default` when the arrow named none.
    #[serde(default = "default_handle")]
    pub source_output: String,
    pub target_node_id: NodeId,
    /// Input key the value binds to on the target.
    #[serde(default = "default_handle")]
    pub target_input: String,
    #[serde(default)]
    pub transform_rules: Vec<TransformRule>,
    #[serde(default)]
    pub packing: Packing,
    /// Arrow-level hints (`label`, `is_first_execution`).
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

fn default_handle() -> String {
    DEFAULT_HANDLE.to_string()
}

impl ExecutableEdge {
    /// Canonical key identifying this connection inside the resolution
    /// pipeline and in error context.
    pub fn key(&self) -> String {
        format!(
            "{}:{}->{}:{}",
            self.source_node_id, self.source_output, self.target_node_id, self.target_input
        )
    }

    /// Whether this edge is tagged for the first execution of its target.
    pub fn is_first_execution(&self) -> bool {
        self.metadata
            .get("is_first_execution")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether this edge leaves a condition node's branch output.
    pub fn is_branch_edge(&self) -> bool {
        self.source_output == BRANCH_TRUE || self.source_output == BRANCH_FALSE
    }

    pub fn has_rule(&self, rule: TransformRule) -> bool {
        self.transform_rules.contains(&rule)
    }
}
