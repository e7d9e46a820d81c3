//! `end` node: collects incoming data and optionally persists it.

use async_trait::async_trait;
use serde_json::Value;

use crate::diagram::{NodeConfig, NodeType};
use crate::envelope::Envelope;
use crate::resolve::ResolvedInputs;

use super::{HandlerCtx, HandlerError, NodeHandler};

pub struct EndHandler;

#[async_trait]
impl NodeHandler for EndHandler {
    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["file"]
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::End { save_to_file } = &ctx.node.config else {
            return Err(HandlerError::Failed("end handler on non-end node".to_string()));
        };

        if let Some(path) = save_to_file {
            let content = match inputs.default_input() {
                Some(Value::String(s)) => s.clone(),
                Some(other) => serde_json::to_string_pretty(other)
                    .map_err(crate::services::ServiceError::from)?,
                None => serde_json::to_string_pretty(&inputs.to_object())
                    .map_err(crate::services::ServiceError::from)?,
            };
            ctx.services.file()?.write(path, &content).await?;
        }

        Ok(ctx.envelope_json(inputs.to_object()))
    }
}
