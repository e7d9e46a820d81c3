//! `db` node: JSON file reads, writes, and list appends under a sandbox.

use async_trait::async_trait;
use serde_json::Value;

use crate::diagram::{DbOperation, NodeConfig, NodeType};
use crate::envelope::Envelope;
use crate::resolve::ResolvedInputs;

use super::{HandlerCtx, HandlerError, NodeHandler};

pub struct DbHandler;

#[async_trait]
impl NodeHandler for DbHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Db
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["file"]
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::Db { operation, file } = &ctx.node.config else {
            return Err(HandlerError::Failed("db handler on wrong node type".to_string()));
        };

        // Path sandboxing lives in the file service; `..`/absolute paths
        // fail before touching the filesystem.
        let files = ctx.services.file()?;

        match operation {
            DbOperation::Prompt | DbOperation::Read => {
                let text = files.read(file).await?;
                match serde_json::from_str::<Value>(&text) {
                    Ok(value) if *operation == DbOperation::Read => Ok(ctx.envelope_json(value)),
                    _ => Ok(ctx.envelope_text(text)),
                }
            }

            DbOperation::Write => {
                let content = content_text(inputs)?;
                files.write(file, &content).await?;
                Ok(ctx.envelope_json(serde_json::json!({"written": file})))
            }

            DbOperation::Append => {
                let new_value = inputs
                    .default_input()
                    .cloned()
                    .unwrap_or(Value::Null);

                // Existing content becomes a list: absent -> [], a JSON list
                // stays one, anything else is coerced to a single element.
                let mut list = match files.read(file).await {
                    Ok(text) => match serde_json::from_str::<Value>(&text) {
                        Ok(Value::Array(items)) => items,
                        Ok(other) => vec![other],
                        Err(_) if text.trim().is_empty() => Vec::new(),
                        Err(_) => vec![Value::String(text)],
                    },
                    Err(crate::services::ServiceError::NotFound(_)) => Vec::new(),
                    Err(e) => return Err(e.into()),
                };
                list.push(new_value);

                let serialized = serde_json::to_string_pretty(&Value::Array(list.clone()))
                    .map_err(crate::services::ServiceError::from)?;
                files.write(file, &serialized).await?;
                Ok(ctx.envelope_json(Value::Array(list)))
            }
        }
    }
}

fn content_text(inputs: &ResolvedInputs) -> Result<String, HandlerError> {
    match inputs.default_input() {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => serde_json::to_string_pretty(other)
            .map_err(|e| HandlerError::Service(crate::services::ServiceError::from(e))),
        None => Ok(String::new()),
    }
}
