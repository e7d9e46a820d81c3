//! `user_response` node: interactive input through the user-input port.

use async_trait::async_trait;

use crate::diagram::{NodeConfig, NodeType};
use crate::envelope::Envelope;
use crate::resolve::ResolvedInputs;
use crate::services::template::scope_from;

use super::{HandlerCtx, HandlerError, NodeHandler};

pub struct UserResponseHandler;

#[async_trait]
impl NodeHandler for UserResponseHandler {
    fn node_type(&self) -> NodeType {
        NodeType::UserResponse
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["user_input", "template"]
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::UserResponse { prompt, timeout_seconds } = &ctx.node.config else {
            return Err(HandlerError::Failed(
                "user_response handler on wrong node type".to_string(),
            ));
        };

        let scope = scope_from(&inputs.to_object(), &ctx.context.get_variables());
        let rendered = ctx.services.template()?.process(prompt, &scope).content;

        let answer = ctx
            .services
            .user_input()?
            .ask(&rendered, *timeout_seconds)
            .await?;
        Ok(ctx.envelope_text(answer))
    }
}
