//! Stage 1: collect incoming edges and their source outputs.

use super::{EdgeValue, PipelineCtx};

/// Pair every edge targeting this node with its source's last output
/// envelope. Sources that have not produced anything simply contribute no
/// entry; later stages only see edges that carry a value.
pub(crate) fn collect(ctx: &mut PipelineCtx<'_>) {
    let node_id = &ctx.node.id;
    for edge in ctx.diagram.incoming_edges(node_id) {
        if let Some(envelope) = ctx.context.get_output(&edge.source_node_id) {
            ctx.edge_values.push(EdgeValue { edge, envelope });
        }
    }
}
