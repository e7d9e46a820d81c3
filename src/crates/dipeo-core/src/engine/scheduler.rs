//! Ready-set computation and quiescence analysis
//!
//! Readiness is recomputed from the state store on every tick; there is no
//! static order. A pending node is ready when its dependency strategy is
//! satisfied:
//!
//! - nodes without incoming edges (start) are always ready;
//! - `person_job` first executions fire as soon as any `is_first_execution`
//!   edge has a source output (loop heads cannot wait for their condition);
//! - condition nodes need at least one parent with an output and no parent
//!   still in flight;
//! - everything else waits for all parents to be `completed`, `skipped`, or
//!   `maxiter_reached` (a `failed` parent never satisfies a dependency);
//! - a node whose incoming branch edges are all dead (their condition chose
//!   the other branch) is not ready; it is resolved at quiescence.

use std::collections::{HashMap, HashSet};

use crate::diagram::{ExecutableDiagram, ExecutableNode, NodeConfig, NodeId, NodeType};
use crate::state::{ExecutionContext, Status};

/// What the scheduler should do with the pending set this tick.
#[derive(Debug, Default)]
pub(crate) struct ReadySet {
    /// Nodes to dispatch now.
    pub ready: Vec<NodeId>,
    /// `person_job` nodes whose iteration cap is reached; transition to
    /// `maxiter_reached` instead of dispatching.
    pub maxiter: Vec<NodeId>,
}

pub(crate) fn compute_ready(
    diagram: &ExecutableDiagram,
    context: &ExecutionContext,
    in_flight: &HashSet<NodeId>,
    default_max_iterations: u32,
) -> ReadySet {
    let mut set = ReadySet::default();

    for node in diagram.nodes() {
        if in_flight.contains(&node.id) || context.get_status(&node.id) != Some(Status::Pending) {
            continue;
        }

        if let NodeConfig::PersonJob { .. } = &node.config {
            let cap = node.max_iteration(default_max_iterations);
            if context.get_execution_count(&node.id) >= cap {
                set.maxiter.push(node.id.clone());
                continue;
            }
        }

        if is_ready(node, diagram, context) {
            set.ready.push(node.id.clone());
        }
    }

    set
}

fn is_ready(node: &ExecutableNode, diagram: &ExecutableDiagram, context: &ExecutionContext) -> bool {
    let incoming: Vec<_> = diagram.incoming_edges(&node.id).collect();
    if incoming.is_empty() {
        return true;
    }

    // First execution of a person_job fires on any tagged input.
    if node.node_type() == NodeType::PersonJob && context.get_execution_count(&node.id) == 0 {
        let first_edges: Vec<_> = incoming.iter().filter(|e| e.is_first_execution()).collect();
        if !first_edges.is_empty() {
            return first_edges
                .iter()
                .any(|e| source_satisfied(context, &e.source_node_id));
        }
    }

    if node.node_type() == NodeType::Condition {
        let any_output = incoming
            .iter()
            .any(|e| context.get_output(&e.source_node_id).is_some());
        let none_active = incoming.iter().all(|e| {
            context.get_status(&e.source_node_id) != Some(Status::Running)
        });
        return any_output && none_active;
    }

    // Default strategy: every parent terminal (failed does not count), and
    // at least one incoming edge still live.
    let all_parents_done = incoming
        .iter()
        .all(|e| source_satisfied(context, &e.source_node_id));
    all_parents_done && !all_edges_dead(node, diagram, context)
}

fn source_satisfied(context: &ExecutionContext, source: &str) -> bool {
    matches!(
        context.get_status(source),
        Some(Status::Completed | Status::Skipped | Status::MaxiterReached)
    )
}

/// An edge is dead when it leaves a completed condition on the branch that
/// was not taken.
fn edge_is_dead(
    edge: &crate::diagram::ExecutableEdge,
    diagram: &ExecutableDiagram,
    context: &ExecutionContext,
) -> bool {
    if !edge.is_branch_edge() {
        return false;
    }
    let Some(source) = diagram.node(&edge.source_node_id) else {
        return false;
    };
    if !source.is_condition() {
        return false;
    }
    match (context.get_status(&edge.source_node_id), context.get_branch_taken(&edge.source_node_id)) {
        (Some(Status::Completed), Some(taken)) => taken != edge.source_output,
        _ => false,
    }
}

fn all_edges_dead(
    node: &ExecutableNode,
    diagram: &ExecutableDiagram,
    context: &ExecutionContext,
) -> bool {
    let mut saw_edge = false;
    for edge in diagram.incoming_edges(&node.id) {
        saw_edge = true;
        if !edge_is_dead(edge, diagram, context) {
            return false;
        }
    }
    saw_edge
}

/// Quiescence analysis: nothing is ready, nothing is running, but not every
/// node is terminal.
///
/// Each remaining pending node is *explained* when its starvation has a
/// cause the execution model accepts: a dead branch, a failed dependency,
/// or a dependency that is itself explained. Explained nodes are skipped
/// and the execution can settle; anything unexplained is a genuine deadlock
/// (typically a cycle with no condition gate).
#[derive(Debug)]
pub(crate) struct QuiescenceReport {
    pub to_skip: Vec<NodeId>,
    pub deadlocked: Vec<NodeId>,
}

pub(crate) fn analyze_quiescence(
    diagram: &ExecutableDiagram,
    context: &ExecutionContext,
) -> QuiescenceReport {
    let pending: Vec<&ExecutableNode> = diagram
        .nodes()
        .iter()
        .filter(|n| context.get_status(&n.id) == Some(Status::Pending))
        .collect();

    let pending_ids: HashSet<&str> = pending.iter().map(|n| n.id.as_str()).collect();
    let mut explained: HashMap<&str, bool> =
        pending.iter().map(|n| (n.id.as_str(), false)).collect();

    loop {
        let mut changed = false;
        for node in &pending {
            if explained[node.id.as_str()] {
                continue;
            }
            if node_explained(node, diagram, context, &pending_ids, &explained) {
                explained.insert(node.id.as_str(), true);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut report = QuiescenceReport { to_skip: Vec::new(), deadlocked: Vec::new() };
    for node in &pending {
        if explained[node.id.as_str()] {
            report.to_skip.push(node.id.clone());
        } else {
            report.deadlocked.push(node.id.clone());
        }
    }
    report
}

fn node_explained(
    node: &ExecutableNode,
    diagram: &ExecutableDiagram,
    context: &ExecutionContext,
    pending: &HashSet<&str>,
    explained: &HashMap<&str, bool>,
) -> bool {
    if all_edges_dead(node, diagram, context) {
        return true;
    }
    for edge in diagram.incoming_edges(&node.id) {
        if edge_is_dead(edge, diagram, context) {
            continue;
        }
        let source = edge.source_node_id.as_str();
        if context.get_status(source) == Some(Status::Failed) {
            return true;
        }
        if pending.contains(source) && explained.get(source).copied().unwrap_or(false) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::diagram::DiagramSpec;
    use crate::envelope::Envelope;
    use serde_json::json;

    fn fixture(yaml: &str) -> ExecutableDiagram {
        compile(&DiagramSpec::from_yaml(yaml).unwrap())
            .into_diagram()
            .unwrap()
    }

    fn complete(ctx: &ExecutionContext, node: &str) {
        ctx.to_running(node).unwrap();
        ctx.to_completed(node, &Envelope::json(json!({}), node), None).unwrap();
    }

    const LINEAR: &str = r#"
nodes:
  - id: start
    type: start
  - id: a
    type: code_job
    properties: {language: bash, code: "true"}
  - id: end
    type: end
arrows:
  - source: start
    target: a
  - source: a
    target: end
"#;

    #[test]
    fn test_only_start_is_ready_initially() {
        let diagram = fixture(LINEAR);
        let ctx = ExecutionContext::new("e", &diagram);
        let set = compute_ready(&diagram, &ctx, &HashSet::new(), 100);
        assert_eq!(set.ready, vec!["start".to_string()]);
    }

    #[test]
    fn test_node_becomes_ready_after_parent_completes() {
        let diagram = fixture(LINEAR);
        let ctx = ExecutionContext::new("e", &diagram);
        complete(&ctx, "start");
        let set = compute_ready(&diagram, &ctx, &HashSet::new(), 100);
        assert_eq!(set.ready, vec!["a".to_string()]);
    }

    #[test]
    fn test_in_flight_nodes_are_not_rescheduled() {
        let diagram = fixture(LINEAR);
        let ctx = ExecutionContext::new("e", &diagram);
        let in_flight: HashSet<NodeId> = ["start".to_string()].into_iter().collect();
        let set = compute_ready(&diagram, &ctx, &in_flight, 100);
        assert!(set.ready.is_empty());
    }

    #[test]
    fn test_failed_parent_never_satisfies_dependency() {
        let diagram = fixture(LINEAR);
        let ctx = ExecutionContext::new("e", &diagram);
        complete(&ctx, "start");
        ctx.to_running("a").unwrap();
        ctx.to_failed("a", "boom").unwrap();

        let set = compute_ready(&diagram, &ctx, &HashSet::new(), 100);
        assert!(set.ready.is_empty());

        // At quiescence the starved node is explained by the failure.
        let report = analyze_quiescence(&diagram, &ctx);
        assert_eq!(report.to_skip, vec!["end".to_string()]);
        assert!(report.deadlocked.is_empty());
    }

    const BRANCH: &str = r#"
nodes:
  - id: start
    type: start
  - id: cond
    type: condition
    properties: {kind: custom_expression, expression: "x > 10"}
  - id: a
    type: end
  - id: b
    type: end
arrows:
  - source: start
    target: cond
  - source: "cond:condtrue"
    target: a
  - source: "cond:condfalse"
    target: b
"#;

    #[test]
    fn test_dead_branch_target_is_not_ready_and_skips_at_quiescence() {
        let diagram = fixture(BRANCH);
        let ctx = ExecutionContext::new("e", &diagram);
        complete(&ctx, "start");
        ctx.to_running("cond").unwrap();
        ctx.to_completed("cond", &Envelope::json(json!({"condfalse": {}}), "cond"), None)
            .unwrap();
        ctx.mark_branch_taken("cond", "condfalse");

        let set = compute_ready(&diagram, &ctx, &HashSet::new(), 100);
        assert_eq!(set.ready, vec!["b".to_string()]);

        complete(&ctx, "b");
        let report = analyze_quiescence(&diagram, &ctx);
        assert_eq!(report.to_skip, vec!["a".to_string()]);
        assert!(report.deadlocked.is_empty());
    }

    #[test]
    fn test_condition_ready_with_one_resolved_parent() {
        let diagram = fixture(BRANCH);
        let ctx = ExecutionContext::new("e", &diagram);
        complete(&ctx, "start");
        let set = compute_ready(&diagram, &ctx, &HashSet::new(), 100);
        assert_eq!(set.ready, vec!["cond".to_string()]);
    }

    #[test]
    fn test_cycle_without_condition_deadlocks() {
        let diagram = fixture(
            r#"
nodes:
  - id: start
    type: start
  - id: a
    type: code_job
    properties: {language: bash, code: "true"}
  - id: b
    type: code_job
    properties: {language: bash, code: "true"}
arrows:
  - source: a
    target: b
  - source: b
    target: a
"#,
        );
        let ctx = ExecutionContext::new("e", &diagram);
        complete(&ctx, "start");

        let set = compute_ready(&diagram, &ctx, &HashSet::new(), 100);
        assert!(set.ready.is_empty());

        let report = analyze_quiescence(&diagram, &ctx);
        assert!(report.to_skip.is_empty());
        assert_eq!(report.deadlocked.len(), 2);
    }

    #[test]
    fn test_person_job_first_execution_fires_on_tagged_edge() {
        let diagram = fixture(
            r#"
nodes:
  - id: start
    type: start
  - id: agent
    type: person_job
    properties: {person: p, default_prompt: "go"}
  - id: cond
    type: condition
    properties: {kind: max_iterations}
arrows:
  - source: start
    target: agent
    metadata: {is_first_execution: true}
  - source: agent
    target: cond
  - source: "cond:condfalse"
    target: agent
persons:
  - id: p
    model: mock-model
"#,
        );
        let ctx = ExecutionContext::new("e", &diagram);

        // Not ready before start produced anything.
        let set = compute_ready(&diagram, &ctx, &HashSet::new(), 100);
        assert_eq!(set.ready, vec!["start".to_string()]);

        complete(&ctx, "start");
        let set = compute_ready(&diagram, &ctx, &HashSet::new(), 100);
        assert_eq!(set.ready, vec!["agent".to_string()]);
    }

    #[test]
    fn test_person_job_cap_reports_maxiter() {
        let diagram = fixture(
            r#"
nodes:
  - id: start
    type: start
  - id: agent
    type: person_job
    properties: {person: p, default_prompt: "go", max_iteration: 1}
arrows:
  - source: start
    target: agent
persons:
  - id: p
    model: mock-model
"#,
        );
        let ctx = ExecutionContext::new("e", &diagram);
        complete(&ctx, "start");
        complete(&ctx, "agent");
        ctx.reset("agent").unwrap();

        let set = compute_ready(&diagram, &ctx, &HashSet::new(), 100);
        assert!(set.ready.is_empty());
        assert_eq!(set.maxiter, vec!["agent".to_string()]);
    }
}
