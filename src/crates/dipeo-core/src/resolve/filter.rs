//! Stage 2: strategy, iteration, and branch filtering.

use crate::diagram::NodeType;

use super::PipelineCtx;

/// Drop edge values the current scheduling must not see:
///
/// - **Strategy filter**: a `person_job` node's first execution consumes only
///   edges tagged `is_first_execution` (when any exist); later executions
///   ignore those same edges. Other node types accept all incoming edges.
/// - **Iteration filter**: an envelope tagged with `meta.iteration` is only
///   valid for the matching target iteration (`execution_count + 1`).
/// - **Branch filter**: an envelope tagged with `meta.branch_id` is dropped
///   once its producing condition's recorded decision disagrees.
pub(crate) fn apply(ctx: &mut PipelineCtx<'_>) {
    let node_type = ctx.node.node_type();
    let upcoming_iteration = ctx.context.get_execution_count(&ctx.node.id) + 1;

    let first_run = upcoming_iteration == 1;
    let has_first_inputs = node_type == NodeType::PersonJob
        && ctx.edge_values.iter().any(|ev| ev.edge.is_first_execution());

    let context = &*ctx.context;
    ctx.edge_values.retain(|ev| {
        // Strategy-specific filter.
        if node_type == NodeType::PersonJob {
            if first_run && has_first_inputs && !ev.edge.is_first_execution() {
                return false;
            }
            if !first_run && ev.edge.is_first_execution() {
                return false;
            }
        }

        // Iteration filter.
        if let Some(iteration) = ev.envelope.iteration() {
            if iteration != upcoming_iteration {
                return false;
            }
        }

        // Branch filter: compare against the decision recorded for the
        // condition that produced the envelope.
        if let Some(branch_id) = ev.envelope.branch_id() {
            if let Some(decided) = context.get_branch_taken(&ev.envelope.produced_by) {
                if decided != branch_id {
                    return false;
                }
            }
        }

        true
    });
}
