//! `start` node: emits its configured data, optionally gated on a hook event.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::diagram::{NodeConfig, NodeType, TriggerMode};
use crate::envelope::Envelope;
use crate::resolve::ResolvedInputs;

use super::{HandlerCtx, HandlerError, NodeHandler};

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        _inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::Start { custom_data, trigger_mode, hook_event, hook_filters } =
            &ctx.node.config
        else {
            return Err(HandlerError::Failed("start handler on non-start node".to_string()));
        };

        let mut body: Map<String, Value> =
            custom_data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        // Initial execution variables ride along so downstream nodes can
        // consume them without the variables provider.
        for (key, value) in ctx.context.get_variables() {
            body.entry(key).or_insert(value);
        }

        if *trigger_mode == TriggerMode::Hook {
            let event_name = hook_event
                .as_deref()
                .ok_or_else(|| HandlerError::Failed("hook trigger requires hook_event".to_string()))?;

            let event = ctx.hooks.wait_matching(event_name, hook_filters).await;

            ctx.context.set_hook_event_data(event.payload.clone());
            body.insert("hook_event".to_string(), event.payload);
        }

        Ok(ctx.envelope_json(Value::Object(body)))
    }
}
