//! `notion` node: delegates a validated operation to the Notion port.

use async_trait::async_trait;

use crate::diagram::{NodeConfig, NodeType};
use crate::envelope::Envelope;
use crate::resolve::ResolvedInputs;

use super::{HandlerCtx, HandlerError, NodeHandler};

/// Operations accepted by the Notion port.
const ALLOWED_OPERATIONS: &[&str] = &["read_page", "append_blocks", "query_database", "create_page"];

pub struct NotionHandler;

#[async_trait]
impl NodeHandler for NotionHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Notion
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["notion", "api_key"]
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::Notion { operation, page_id, api_key_ref } = &ctx.node.config else {
            return Err(HandlerError::Failed("notion handler on wrong node type".to_string()));
        };

        if !ALLOWED_OPERATIONS.contains(&operation.as_str()) {
            return Err(HandlerError::Failed(format!(
                "notion operation '{operation}' is not allowed"
            )));
        }

        let key = ctx.services.api_keys()?.get(api_key_ref).await?;
        let result = ctx
            .services
            .notion()?
            .execute(operation, page_id, &key.key, inputs.to_object())
            .await?;
        Ok(ctx.envelope_json(result))
    }
}
