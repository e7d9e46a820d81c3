//! Structural validation of compiled diagrams
//!
//! Validation never aborts compilation early: every check appends to the
//! diagnostic lists so users see all problems at once. Cycles are reported
//! as informational only, since loops gated by condition nodes are a
//! supported construct.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::diagram::{ExecutableEdge, ExecutableNode, NodeType, BRANCH_FALSE, BRANCH_TRUE};

use super::Diagnostic;

pub fn validate(
    nodes: &[ExecutableNode],
    edges: &[ExecutableEdge],
    diagnostics: &mut Vec<Diagnostic>,
) {
    check_start_and_end(nodes, diagnostics);
    check_edge_endpoints(nodes, edges, diagnostics);
    check_condition_branches(nodes, edges, diagnostics);
    check_reachability(nodes, edges, diagnostics);
    report_cycles(nodes, edges, diagnostics);
}

fn check_start_and_end(nodes: &[ExecutableNode], diagnostics: &mut Vec<Diagnostic>) {
    let starts = nodes.iter().filter(|n| n.node_type() == NodeType::Start).count();
    match starts {
        0 => diagnostics.push(Diagnostic::error("diagram has no start node", None)),
        1 => {}
        n => diagnostics.push(Diagnostic::error(
            format!("diagram has {n} start nodes, exactly one is required"),
            None,
        )),
    }

    if !nodes.iter().any(|n| n.node_type() == NodeType::End) {
        diagnostics.push(Diagnostic::warning("diagram has no end node", None));
    }
}

fn check_edge_endpoints(
    nodes: &[ExecutableNode],
    edges: &[ExecutableEdge],
    diagnostics: &mut Vec<Diagnostic>,
) {
    let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    for edge in edges {
        if !ids.contains(edge.source_node_id.as_str()) {
            diagnostics.push(Diagnostic::error(
                format!("arrow '{}' references unknown source node '{}'", edge.id, edge.source_node_id),
                None,
            ));
        }
        if !ids.contains(edge.target_node_id.as_str()) {
            diagnostics.push(Diagnostic::error(
                format!("arrow '{}' references unknown target node '{}'", edge.id, edge.target_node_id),
                None,
            ));
        }
    }
}

fn check_condition_branches(
    nodes: &[ExecutableNode],
    edges: &[ExecutableEdge],
    diagnostics: &mut Vec<Diagnostic>,
) {
    for node in nodes.iter().filter(|n| n.node_type() == NodeType::Condition) {
        let handles: HashSet<&str> = edges
            .iter()
            .filter(|e| e.source_node_id == node.id)
            .map(|e| e.source_output.as_str())
            .collect();
        for branch in [BRANCH_TRUE, BRANCH_FALSE] {
            if !handles.contains(branch) {
                diagnostics.push(Diagnostic::warning(
                    format!("condition node has no outgoing '{branch}' edge"),
                    Some(node.id.clone()),
                ));
            }
        }
    }
}

fn check_reachability(
    nodes: &[ExecutableNode],
    edges: &[ExecutableEdge],
    diagnostics: &mut Vec<Diagnostic>,
) {
    let Some(start) = nodes.iter().find(|n| n.node_type() == NodeType::Start) else {
        return;
    };

    let adjacency = adjacency_map(edges);
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    seen.insert(start.id.as_str());
    queue.push_back(start.id.as_str());
    while let Some(id) = queue.pop_front() {
        for next in adjacency.get(id).into_iter().flatten() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }

    for node in nodes {
        if !seen.contains(node.id.as_str()) {
            diagnostics.push(Diagnostic::warning(
                "node is unreachable from the start node",
                Some(node.id.clone()),
            ));
        }
    }
}

fn report_cycles(
    nodes: &[ExecutableNode],
    edges: &[ExecutableEdge],
    diagnostics: &mut Vec<Diagnostic>,
) {
    // Iterative DFS with a color map; any back edge means a cycle.
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let adjacency = adjacency_map(edges);
    let mut color: HashMap<&str, Color> =
        nodes.iter().map(|n| (n.id.as_str(), Color::White)).collect();

    for node in nodes {
        if color.get(node.id.as_str()) != Some(&Color::White) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(node.id.as_str(), 0)];
        color.insert(node.id.as_str(), Color::Grey);
        while let Some((id, next_child)) = stack.pop() {
            let children = adjacency.get(id).map(Vec::as_slice).unwrap_or(&[]);
            if next_child < children.len() {
                stack.push((id, next_child + 1));
                let child = children[next_child];
                match color.get(child) {
                    Some(Color::White) => {
                        color.insert(child, Color::Grey);
                        stack.push((child, 0));
                    }
                    Some(Color::Grey) => {
                        diagnostics.push(Diagnostic::info(
                            format!("diagram contains a cycle through node '{child}'"),
                            None,
                        ));
                        return;
                    }
                    _ => {}
                }
            } else {
                color.insert(id, Color::Black);
            }
        }
    }
}

fn adjacency_map(edges: &[ExecutableEdge]) -> HashMap<&str, Vec<&str>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.source_node_id.as_str())
            .or_default()
            .push(edge.target_node_id.as_str());
    }
    adjacency
}
