//! Executable node types and per-type configuration
//!
//! Node behavior is selected by a closed tag union ([`NodeType`]) rather than
//! an inheritance hierarchy: each tag pairs with a [`NodeConfig`] variant for
//! its configuration and with a handler looked up from the registry at
//! dispatch time. New node types register a new tag + handler pair.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Opaque node identifier, unique within a diagram.
pub type NodeId = String;

/// Closed set of node type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    PersonJob,
    Condition,
    CodeJob,
    ApiJob,
    Db,
    Hook,
    UserResponse,
    Notion,
    Batch,
}

impl NodeType {
    pub const ALL: [NodeType; 11] = [
        NodeType::Start,
        NodeType::End,
        NodeType::PersonJob,
        NodeType::Condition,
        NodeType::CodeJob,
        NodeType::ApiJob,
        NodeType::Db,
        NodeType::Hook,
        NodeType::UserResponse,
        NodeType::Notion,
        NodeType::Batch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::PersonJob => "person_job",
            NodeType::Condition => "condition",
            NodeType::CodeJob => "code_job",
            NodeType::ApiJob => "api_job",
            NodeType::Db => "db",
            NodeType::Hook => "hook",
            NodeType::UserResponse => "user_response",
            NodeType::Notion => "notion",
            NodeType::Batch => "batch",
        }
    }

    pub fn parse(s: &str) -> Option<NodeType> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a start node is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Manual,
    Hook,
}

/// How a `person_job` node treats prior conversation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPolicy {
    /// Retain the full history on every turn.
    #[default]
    NoForget,
    /// Consolidate the history into a single summary message each turn.
    OnEveryTurn,
    /// Drop prior messages unless the prompt explicitly requests them.
    UponRequest,
}

/// Supported `code_job` languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeLanguage {
    Python,
    Javascript,
    Bash,
}

/// Which evaluator a condition node runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionEvaluator {
    /// Safe boolean expression over inputs and execution variables.
    CustomExpression { expression: String },
    /// True once every executed `person_job` node has hit its iteration cap.
    MaxIterations,
    /// True once every named node has executed at least once.
    NodesExecuted { node_ids: Vec<NodeId> },
    /// Delegate the boolean decision to an LLM call.
    LlmDecision { person: String, prompt: String },
}

/// Authentication applied by the `api_job` handler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApiAuth {
    #[default]
    None,
    Bearer {
        token_ref: String,
    },
    Basic {
        username: String,
        password_ref: String,
    },
    ApiKey {
        header: String,
        key_ref: String,
    },
}

/// Allowlisted `db` node operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbOperation {
    Prompt,
    Read,
    Write,
    Append,
}

fn default_code_timeout() -> u64 {
    30
}

fn default_api_timeout() -> u64 {
    30
}

/// Type-specific node configuration, one variant per [`NodeType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeConfig {
    Start {
        #[serde(default)]
        custom_data: BTreeMap<String, Value>,
        #[serde(default)]
        trigger_mode: TriggerMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hook_event: Option<String>,
        #[serde(default)]
        hook_filters: BTreeMap<String, Value>,
    },
    End {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_to_file: Option<String>,
    },
    PersonJob {
        person: String,
        #[serde(default)]
        default_prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_only_prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iteration: Option<u32>,
        #[serde(default)]
        memory_policy: MemoryPolicy,
        #[serde(default)]
        tools: Vec<String>,
    },
    Condition {
        #[serde(flatten)]
        evaluator: ConditionEvaluator,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expose_index_as: Option<String>,
    },
    CodeJob {
        language: CodeLanguage,
        code: String,
        #[serde(default = "default_code_timeout")]
        timeout_seconds: u64,
    },
    ApiJob {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        params: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(default)]
        auth: ApiAuth,
        #[serde(default = "default_api_timeout")]
        timeout_seconds: u64,
        #[serde(default)]
        allow_error_status: bool,
    },
    Db {
        operation: DbOperation,
        file: String,
    },
    Hook {
        #[serde(default = "default_hook_type")]
        hook_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default = "default_api_timeout")]
        timeout_seconds: u64,
    },
    UserResponse {
        prompt: String,
        #[serde(default = "default_api_timeout")]
        timeout_seconds: u64,
    },
    Notion {
        operation: String,
        page_id: String,
        api_key_ref: String,
    },
    Batch {
        #[serde(default = "default_items_key")]
        items_key: String,
        #[serde(default)]
        flatten: bool,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_hook_type() -> String {
    "shell".to_string()
}

fn default_items_key() -> String {
    "items".to_string()
}

impl NodeConfig {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::Start { .. } => NodeType::Start,
            NodeConfig::End { .. } => NodeType::End,
            NodeConfig::PersonJob { .. } => NodeType::PersonJob,
            NodeConfig::Condition { .. } => NodeType::Condition,
            NodeConfig::CodeJob { .. } => NodeType::CodeJob,
            NodeConfig::ApiJob { .. } => NodeType::ApiJob,
            NodeConfig::Db { .. } => NodeType::Db,
            NodeConfig::Hook { .. } => NodeType::Hook,
            NodeConfig::UserResponse { .. } => NodeType::UserResponse,
            NodeConfig::Notion { .. } => NodeType::Notion,
            NodeConfig::Batch { .. } => NodeType::Batch,
        }
    }
}

/// Provider-backed inputs a node can opt into. Provider keys use the
/// underscore-prefix convention (`_conversation`, `_variables`); implicit
/// injection is forbidden.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderInputs {
    #[serde(default)]
    pub conversation: bool,
    #[serde(default)]
    pub variables: bool,
}

/// Immutable node within an [`ExecutableDiagram`](super::ExecutableDiagram).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableNode {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    pub config: NodeConfig,
    /// Inputs the handler requires; resolution warns when one is absent and
    /// no default applies.
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Explicit default values, keyed by input name.
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    /// Declared input types (`string`, `number`, `boolean`, `array`,
    /// `object`), consulted for type-based defaults.
    #[serde(default)]
    pub input_types: BTreeMap<String, String>,
    #[serde(default)]
    pub providers: ProviderInputs,
}

impl ExecutableNode {
    pub fn node_type(&self) -> NodeType {
        self.config.node_type()
    }

    pub fn is_condition(&self) -> bool {
        self.node_type() == NodeType::Condition
    }

    /// Iteration cap for `person_job` nodes; `fallback` comes from the
    /// execution options.
    pub fn max_iteration(&self, fallback: u32) -> u32 {
        match &self.config {
            NodeConfig::PersonJob { max_iteration, .. } => max_iteration.unwrap_or(fallback),
            _ => fallback,
        }
    }

    pub fn code_timeout(&self) -> Duration {
        match &self.config {
            NodeConfig::CodeJob { timeout_seconds, .. } => Duration::from_secs(*timeout_seconds),
            _ => Duration::from_secs(default_code_timeout()),
        }
    }
}

/// An LLM-agent configuration referenced by `person_job` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_type_round_trip() {
        for t in NodeType::ALL {
            assert_eq!(NodeType::parse(t.as_str()), Some(t));
        }
        assert_eq!(NodeType::parse("teleport"), None);
    }

    #[test]
    fn test_condition_config_deserializes_tagged_evaluator() {
        let cfg: NodeConfig = serde_json::from_value(json!({
            "condition": {
                "kind": "custom_expression",
                "expression": "x > 10",
                "expose_index_as": "i"
            }
        }))
        .unwrap();
        match cfg {
            NodeConfig::Condition { evaluator, expose_index_as } => {
                assert_eq!(
                    evaluator,
                    ConditionEvaluator::CustomExpression { expression: "x > 10".to_string() }
                );
                assert_eq!(expose_index_as.as_deref(), Some("i"));
            }
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn test_person_job_defaults() {
        let cfg: NodeConfig = serde_json::from_value(json!({
            "person_job": {"person": "assistant", "default_prompt": "Say hi"}
        }))
        .unwrap();
        let node = ExecutableNode {
            id: "p".to_string(),
            name: String::new(),
            config: cfg,
            required_inputs: vec![],
            defaults: BTreeMap::new(),
            input_types: BTreeMap::new(),
            providers: ProviderInputs::default(),
        };
        assert_eq!(node.node_type(), NodeType::PersonJob);
        assert_eq!(node.max_iteration(100), 100);
    }
}
