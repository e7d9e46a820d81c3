//! Compiler: declarative diagram → immutable executable graph
//!
//! The compiler extracts typed nodes from the declarative spec, resolves
//! handle references into edges, infers edge transformation rules from node
//! types, and runs structural validation. Errors are collected rather than
//! short-circuiting, so a single compile reports everything wrong with a
//! diagram. No static execution order is computed: ordering is fully dynamic
//! at runtime, driven by the state store.
//!
//! Compilation is pure and idempotent: compiling the same spec twice yields
//! structurally identical output.

mod handles;
mod validate;

pub use handles::{resolve_handle, HandleRef};

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

use crate::diagram::{
    ArrowSpec, DiagramSpec, ExecutableDiagram, ExecutableEdge, ExecutableNode, NodeConfig,
    NodeSpec, NodeType, TransformRule, DEFAULT_HANDLE,
};

/// Severity of a compile diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single compile-time finding, optionally anchored to a node.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self { severity: Severity::Error, message: message.into(), node_id }
    }

    pub fn warning(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self { severity: Severity::Warning, message: message.into(), node_id }
    }

    pub fn info(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self { severity: Severity::Info, message: message.into(), node_id }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        match &self.node_id {
            Some(id) => write!(f, "{tag}: {} (node '{id}')", self.message),
            None => write!(f, "{tag}: {}", self.message),
        }
    }
}

/// Outcome of a compilation: the diagram when no errors occurred, plus all
/// diagnostics either way.
#[derive(Debug)]
pub struct CompileResult {
    pub diagram: Option<ExecutableDiagram>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub infos: Vec<Diagnostic>,
}

impl CompileResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// The compiled diagram, or the first error rendered as a message.
    pub fn into_diagram(self) -> Result<ExecutableDiagram, String> {
        match self.diagram {
            Some(d) if self.errors.is_empty() => Ok(d),
            _ => Err(self
                .errors
                .first()
                .map(|d| d.to_string())
                .unwrap_or_else(|| "compilation produced no diagram".to_string())),
        }
    }
}

/// Compile a declarative diagram spec into an executable diagram.
pub fn compile(spec: &DiagramSpec) -> CompileResult {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    if spec.nodes.is_empty() {
        diagnostics.push(Diagnostic::error("diagram has no nodes", None));
        return split(None, diagnostics);
    }

    let nodes = extract_nodes(&spec.nodes, &mut diagnostics);
    let edges = build_edges(&spec.arrows, &nodes, &mut diagnostics);

    check_person_refs(spec, &nodes, &mut diagnostics);
    validate::validate(&nodes, &edges, &mut diagnostics);

    let has_errors = diagnostics.iter().any(|d| d.severity == Severity::Error);
    let diagram = if has_errors {
        None
    } else {
        Some(ExecutableDiagram::new(
            spec.metadata
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string),
            nodes,
            edges,
            spec.persons.clone(),
            spec.metadata.clone(),
        ))
    };

    split(diagram, diagnostics)
}

/// Reverse a compiled diagram back into its declarative form.
///
/// Node ids, edge endpoints, and node configuration are preserved; compile
/// derived data (inferred transform rules) is dropped, matching the
/// round-trip law that metadata-only fields are exempt.
pub fn decompile(diagram: &ExecutableDiagram) -> DiagramSpec {
    let nodes = diagram
        .nodes()
        .iter()
        .map(|node| NodeSpec {
            id: node.id.clone(),
            node_type: node.node_type().as_str().to_string(),
            name: node.name.clone(),
            properties: config_properties(&node.config),
            required_inputs: node.required_inputs.clone(),
            defaults: node.defaults.clone(),
            input_types: node.input_types.clone(),
        })
        .collect();

    let arrows = diagram
        .edges()
        .iter()
        .map(|edge| ArrowSpec {
            id: Some(edge.id.clone()),
            source: handle_ref(&edge.source_node_id, &edge.source_output),
            target: handle_ref(&edge.target_node_id, &edge.target_input),
            label: edge.metadata.get("label").and_then(Value::as_str).map(str::to_string),
            packing: edge.packing,
            metadata: edge.metadata.clone(),
        })
        .collect();

    DiagramSpec {
        nodes,
        arrows,
        persons: diagram.persons().cloned().collect(),
        metadata: diagram.metadata.clone(),
    }
}

fn handle_ref(node_id: &str, handle: &str) -> String {
    if handle == DEFAULT_HANDLE {
        node_id.to_string()
    } else {
        format!("{node_id}:{handle}")
    }
}

fn config_properties(config: &NodeConfig) -> BTreeMap<String, Value> {
    // NodeConfig serializes as { "<type>": { ...properties } }; strip the tag.
    match serde_json::to_value(config) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .next()
            .and_then(|(_, inner)| match inner {
                Value::Object(props) => Some(props.into_iter().collect()),
                _ => None,
            })
            .unwrap_or_default(),
        _ => BTreeMap::new(),
    }
}

fn extract_nodes(specs: &[NodeSpec], diagnostics: &mut Vec<Diagnostic>) -> Vec<ExecutableNode> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut nodes = Vec::with_capacity(specs.len());

    for spec in specs {
        if !seen.insert(spec.id.as_str()) {
            diagnostics.push(Diagnostic::error(
                format!("duplicate node id '{}'", spec.id),
                Some(spec.id.clone()),
            ));
            continue;
        }

        let Some(node_type) = NodeType::parse(&spec.node_type) else {
            diagnostics.push(Diagnostic::error(
                format!("unknown node type '{}'", spec.node_type),
                Some(spec.id.clone()),
            ));
            continue;
        };

        match parse_config(node_type, &spec.properties) {
            Ok(config) => nodes.push(ExecutableNode {
                id: spec.id.clone(),
                name: spec.name.clone(),
                config,
                required_inputs: spec.required_inputs.clone(),
                defaults: spec.defaults.clone(),
                input_types: spec.input_types.clone(),
                providers: parse_providers(&spec.properties),
            }),
            Err(message) => diagnostics.push(Diagnostic::error(
                format!("invalid {node_type} configuration: {message}"),
                Some(spec.id.clone()),
            )),
        }
    }

    nodes
}

fn parse_config(
    node_type: NodeType,
    properties: &BTreeMap<String, Value>,
) -> Result<NodeConfig, String> {
    let mut inner = Map::new();
    for (key, value) in properties {
        // Provider opt-ins live beside the typed config in the property bag.
        if key == "providers" {
            continue;
        }
        inner.insert(key.clone(), value.clone());
    }
    let mut tagged = Map::new();
    tagged.insert(node_type.as_str().to_string(), Value::Object(inner));
    serde_json::from_value(Value::Object(tagged)).map_err(|e| e.to_string())
}

fn parse_providers(properties: &BTreeMap<String, Value>) -> crate::diagram::ProviderInputs {
    properties
        .get("providers")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn build_edges(
    arrows: &[ArrowSpec],
    nodes: &[ExecutableNode],
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<ExecutableEdge> {
    let node_ids: HashSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let condition_ids: HashSet<&str> = nodes
        .iter()
        .filter(|n| n.is_condition())
        .map(|n| n.id.as_str())
        .collect();

    let mut edges = Vec::with_capacity(arrows.len());
    for (index, arrow) in arrows.iter().enumerate() {
        let source = match resolve_handle(&arrow.source, &node_ids) {
            Ok(h) => h,
            Err(message) => {
                diagnostics.push(Diagnostic::error(message, None));
                continue;
            }
        };
        let target = match resolve_handle(&arrow.target, &node_ids) {
            Ok(h) => h,
            Err(message) => {
                diagnostics.push(Diagnostic::error(message, None));
                continue;
            }
        };

        let mut transform_rules = Vec::new();
        if condition_ids.contains(source.node_id.as_str()) {
            transform_rules.push(TransformRule::BranchOnCondition);
        }
        for rule in arrow
            .metadata
            .get("transform")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            match rule.as_str() {
                Some("json_to_text") => transform_rules.push(TransformRule::JsonToText),
                Some("text_to_json") => transform_rules.push(TransformRule::TextToJson),
                Some(other) => diagnostics.push(Diagnostic::warning(
                    format!("unknown transform rule '{other}' on arrow '{}'", arrow_id(arrow, index)),
                    None,
                )),
                None => {}
            }
        }

        // An explicit label addresses the target input; otherwise the target
        // handle label applies.
        let target_input = arrow
            .label
            .clone()
            .unwrap_or_else(|| target.handle.clone());

        let mut metadata = arrow.metadata.clone();
        if let Some(label) = &arrow.label {
            metadata.insert("label".to_string(), Value::String(label.clone()));
        }

        edges.push(ExecutableEdge {
            id: arrow_id(arrow, index),
            source_node_id: source.node_id,
            source_output: source.handle,
            target_node_id: target.node_id,
            target_input,
            transform_rules,
            packing: arrow.packing,
            metadata,
        });
    }

    edges
}

fn arrow_id(arrow: &ArrowSpec, index: usize) -> String {
    arrow.id.clone().unwrap_or_else(|| format!("arrow_{index}"))
}

fn check_person_refs(
    spec: &DiagramSpec,
    nodes: &[ExecutableNode],
    diagnostics: &mut Vec<Diagnostic>,
) {
    let person_ids: HashSet<&str> = spec.persons.iter().map(|p| p.id.as_str()).collect();
    for node in nodes {
        if let NodeConfig::PersonJob { person, .. } = &node.config {
            if !person_ids.contains(person.as_str()) {
                diagnostics.push(Diagnostic::warning(
                    format!("person_job references undeclared person '{person}'"),
                    Some(node.id.clone()),
                ));
            }
        }
    }
}

fn split(diagram: Option<ExecutableDiagram>, diagnostics: Vec<Diagnostic>) -> CompileResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut infos = Vec::new();
    for d in diagnostics {
        match d.severity {
            Severity::Error => errors.push(d),
            Severity::Warning => warnings.push(d),
            Severity::Info => infos.push(d),
        }
    }
    CompileResult { diagram, errors, warnings, infos }
}
