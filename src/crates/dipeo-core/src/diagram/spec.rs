//! Declarative diagram format consumed by the compiler
//!
//! A [`DiagramSpec`] is what users author (and what the CLI loads from JSON
//! or YAML): a flat list of nodes, a list of arrows between handle
//! references, the persons (LLM agents) the diagram uses, and free-form
//! metadata. The compiler turns it into an
//! [`ExecutableDiagram`](super::ExecutableDiagram).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::edge::Packing;
use super::node::Person;

/// Declarative node as authored: a type string plus an untyped property bag.
/// The compiler validates the type tag and parses the properties into the
/// typed [`NodeConfig`](super::node::NodeConfig).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub required_inputs: Vec<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub input_types: BTreeMap<String, String>,
}

/// Declarative arrow between two handle references.
///
/// Handle references take the form `<node-id>:<handle-label>`, or a bare
/// node id which addresses the `default` handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrowSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub packing: Packing,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// A complete declarative diagram.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagramSpec {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub arrows: Vec<ArrowSpec>,
    #[serde(default)]
    pub persons: Vec<Person>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl DiagramSpec {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_parses_from_yaml() {
        let yaml = r#"
nodes:
  - id: start
    type: start
  - id: job
    type: code_job
    properties:
      language: bash
      code: "echo hi"
arrows:
  - source: start
    target: job
"#;
        let spec = DiagramSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.nodes.len(), 2);
        assert_eq!(spec.arrows.len(), 1);
        assert_eq!(spec.nodes[1].node_type, "code_job");
    }

    #[test]
    fn test_spec_json_round_trip() {
        let yaml = r#"
nodes:
  - id: a
    type: start
arrows: []
metadata:
  name: demo
"#;
        let spec = DiagramSpec::from_yaml(yaml).unwrap();
        let json = spec.to_json().unwrap();
        let back = DiagramSpec::from_json(&json).unwrap();
        assert_eq!(back, spec);
    }
}
