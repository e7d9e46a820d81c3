//! Compiled, immutable diagram shared read-only across an execution
//!
//! Nodes live in an arena (a plain `Vec` indexed by a dense integer) and are
//! referred to by id everywhere else, so cyclic diagrams never create shared
//! ownership cycles. Edge adjacency is precomputed at construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::edge::ExecutableEdge;
use super::node::{ExecutableNode, NodeId, NodeType, Person};

/// Dense index into the node arena.
pub type NodeIndex = usize;

/// A compiled diagram: nodes, edges, persons, and lookup tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableDiagram {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    nodes: Vec<ExecutableNode>,
    edges: Vec<ExecutableEdge>,
    persons: BTreeMap<String, Person>,
    pub metadata: BTreeMap<String, Value>,
    #[serde(skip)]
    index_by_id: HashMap<NodeId, NodeIndex>,
    #[serde(skip)]
    outgoing: HashMap<NodeId, Vec<usize>>,
    #[serde(skip)]
    incoming: HashMap<NodeId, Vec<usize>>,
}

impl ExecutableDiagram {
    pub fn new(
        id: Option<String>,
        nodes: Vec<ExecutableNode>,
        edges: Vec<ExecutableEdge>,
        persons: Vec<Person>,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        let mut diagram = Self {
            id,
            nodes,
            edges,
            persons: persons.into_iter().map(|p| (p.id.clone(), p)).collect(),
            metadata,
            index_by_id: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        };
        diagram.rebuild_indexes();
        diagram
    }

    /// Rebuild the id and adjacency tables. Called on construction and after
    /// deserialization (the tables are not serialized).
    pub fn rebuild_indexes(&mut self) {
        self.index_by_id = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        self.outgoing.clear();
        self.incoming.clear();
        for (i, edge) in self.edges.iter().enumerate() {
            self.outgoing
                .entry(edge.source_node_id.clone())
                .or_default()
                .push(i);
            self.incoming
                .entry(edge.target_node_id.clone())
                .or_default()
                .push(i);
        }
    }

    pub fn nodes(&self) -> &[ExecutableNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[ExecutableEdge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&ExecutableNode> {
        self.index_by_id.get(id).map(|i| &self.nodes[*i])
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.index_by_id.contains_key(id)
    }

    pub fn person(&self, id: &str) -> Option<&Person> {
        self.persons.get(id)
    }

    pub fn persons(&self) -> impl Iterator<Item = &Person> {
        self.persons.values()
    }

    pub fn outgoing_edges(&self, id: &str) -> impl Iterator<Item = &ExecutableEdge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(|i| &self.edges[*i])
    }

    pub fn incoming_edges(&self, id: &str) -> impl Iterator<Item = &ExecutableEdge> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .map(|i| &self.edges[*i])
    }

    pub fn nodes_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &ExecutableNode> {
        self.nodes.iter().filter(move |n| n.node_type() == node_type)
    }

    pub fn start_node(&self) -> Option<&ExecutableNode> {
        self.nodes_of_type(NodeType::Start).next()
    }

    /// Node count by type, used by CLI `stats`.
    pub fn type_counts(&self) -> BTreeMap<NodeType, usize> {
        let mut counts = BTreeMap::new();
        for node in &self.nodes {
            *counts.entry(node.node_type()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::node::NodeConfig;
    use std::collections::BTreeMap;

    fn node(id: &str, config: NodeConfig) -> ExecutableNode {
        ExecutableNode {
            id: id.to_string(),
            name: String::new(),
            config,
            required_inputs: vec![],
            defaults: BTreeMap::new(),
            input_types: BTreeMap::new(),
            providers: Default::default(),
        }
    }

    fn edge(id: &str, from: &str, to: &str) -> ExecutableEdge {
        ExecutableEdge {
            id: id.to_string(),
            source_node_id: from.to_string(),
            source_output: "default".to_string(),
            target_node_id: to.to_string(),
            target_input: "default".to_string(),
            transform_rules: vec![],
            packing: Default::default(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_adjacency_lookup() {
        let diagram = ExecutableDiagram::new(
            None,
            vec![
                node("a", NodeConfig::Start { custom_data: BTreeMap::new(), trigger_mode: Default::default(), hook_event: None, hook_filters: BTreeMap::new() }),
                node("b", NodeConfig::End { save_to_file: None }),
            ],
            vec![edge("e1", "a", "b")],
            vec![],
            BTreeMap::new(),
        );

        assert!(diagram.contains_node("a"));
        assert_eq!(diagram.outgoing_edges("a").count(), 1);
        assert_eq!(diagram.incoming_edges("b").count(), 1);
        assert_eq!(diagram.incoming_edges("a").count(), 0);
        assert_eq!(diagram.node("b").unwrap().node_type(), NodeType::End);
        assert!(diagram.node("missing").is_none());
    }
}
