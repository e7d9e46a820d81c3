//! Execution start options.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn default_max_iterations() -> u32 {
    100
}

fn default_max_concurrent() -> usize {
    10
}

fn default_heartbeat() -> u64 {
    30
}

/// Options consumed by [`ExecutionEngine::execute`](super::ExecutionEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Initial execution variables.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Capture per-node metrics in completion events.
    #[serde(default)]
    pub debug_mode: bool,
    /// Default `person_job` iteration cap when the node sets none.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Wall-clock limit for the whole execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Bound on concurrently running handler tasks.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_nodes: usize,
    /// Interval after which an `EXECUTION_UPDATE` heartbeat is fabricated
    /// when no real event fired.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u64,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            variables: BTreeMap::new(),
            debug_mode: false,
            max_iterations: default_max_iterations(),
            timeout_seconds: None,
            max_concurrent_nodes: default_max_concurrent(),
            heartbeat_seconds: default_heartbeat(),
        }
    }
}

impl ExecutionOptions {
    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}
