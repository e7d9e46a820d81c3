//! Stage 3: explicit provider-backed inputs.
//!
//! Providers are typed sources a node opts into via its spec; nothing is
//! injected implicitly. Provider keys use the underscore-prefix convention
//! so they never collide with edge-bound inputs.

use serde_json::Value;

use crate::diagram::NodeConfig;
use crate::envelope::Envelope;

use super::{PipelineCtx, ResolutionError};

pub(crate) const CONVERSATION_KEY: &str = "_conversation";
pub(crate) const VARIABLES_KEY: &str = "_variables";

pub(crate) async fn apply(ctx: &mut PipelineCtx<'_>) -> Result<(), ResolutionError> {
    if ctx.node.providers.conversation {
        apply_conversation(ctx).await?;
    }
    if ctx.node.providers.variables {
        apply_variables(ctx);
    }
    Ok(())
}

async fn apply_conversation(ctx: &mut PipelineCtx<'_>) -> Result<(), ResolutionError> {
    let NodeConfig::PersonJob { person, memory_policy, .. } = &ctx.node.config else {
        ctx.warnings.push(
            "conversation provider requested on a node without a person binding".to_string(),
        );
        return Ok(());
    };

    let conversation = ctx
        .services
        .conversation()
        .map_err(|e| ResolutionError::input(e.to_string(), &ctx.node.id))?;
    let state = conversation
        .get_messages(person, *memory_policy)
        .await
        .map_err(|e| ResolutionError::input(e.to_string(), &ctx.node.id))?;

    let value = serde_json::to_value(&state)
        .map_err(|e| ResolutionError::input(e.to_string(), &ctx.node.id))?;
    ctx.inputs.insert(CONVERSATION_KEY.to_string(), value);
    ctx.envelopes.insert(
        CONVERSATION_KEY.to_string(),
        Envelope::conversation(state, "system").with_trace(&ctx.context.execution_id()),
    );
    Ok(())
}

fn apply_variables(ctx: &mut PipelineCtx<'_>) {
    let variables: serde_json::Map<String, Value> =
        ctx.context.get_variables().into_iter().collect();
    let value = Value::Object(variables);
    ctx.envelopes.insert(
        VARIABLES_KEY.to_string(),
        Envelope::json(value.clone(), "system").with_trace(&ctx.context.execution_id()),
    );
    ctx.inputs.insert(VARIABLES_KEY.to_string(), value);
}
