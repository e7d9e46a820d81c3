//! `batch` node: fan an input array into per-element outputs.

use async_trait::async_trait;
use serde_json::Value;

use crate::diagram::{NodeConfig, NodeType, DEFAULT_HANDLE};
use crate::envelope::Envelope;
use crate::resolve::ResolvedInputs;

use super::{HandlerCtx, HandlerError, NodeHandler};

pub struct BatchHandler;

#[async_trait]
impl NodeHandler for BatchHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Batch
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::Batch { items_key, flatten } = &ctx.node.config else {
            return Err(HandlerError::Failed("batch handler on wrong node type".to_string()));
        };

        let source = inputs
            .get(items_key)
            .or_else(|| inputs.get(DEFAULT_HANDLE))
            .cloned()
            .unwrap_or(Value::Null);

        let items: Vec<Value> = match source {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        let mut elements = Vec::with_capacity(items.len());
        for item in items {
            if *flatten {
                if let Value::Array(nested) = item {
                    elements.extend(nested);
                    continue;
                }
            }
            elements.push(item);
        }

        // One envelope per batch element, serialized into the output body so
        // downstream consumers see both the values and their batch indexes.
        let batched: Vec<Value> = elements
            .iter()
            .enumerate()
            .map(|(index, item)| {
                Envelope::json(item.clone(), &ctx.node.id)
                    .with_trace(ctx.execution_id)
                    .with_meta("batch_index", Value::from(index))
                    .serialize()
            })
            .collect();

        Ok(ctx
            .envelope_json(Value::Array(elements))
            .with_meta("batch_count", Value::from(batched.len()))
            .with_meta("batch_envelopes", Value::Array(batched)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::diagram::DiagramSpec;
    use crate::engine::ExecutionOptions;
    use crate::handlers::HookMailbox;
    use crate::services::ServiceRegistry;
    use crate::state::ExecutionContext;
    use serde_json::json;

    async fn run(flatten: bool, input: Value) -> Envelope {
        let spec = DiagramSpec::from_yaml(&format!(
            r#"
nodes:
  - id: start
    type: start
  - id: fan
    type: batch
    properties:
      flatten: {flatten}
arrows:
  - source: start
    target: fan
"#
        ))
        .unwrap();
        let diagram = compile(&spec).into_diagram().unwrap();
        let services = ServiceRegistry::for_tests();
        let options = ExecutionOptions::default();
        let hooks = HookMailbox::default();
        let context = ExecutionContext::new("e", &diagram);
        context.to_running("fan").unwrap();
        let ctx = HandlerCtx {
            node: diagram.node("fan").unwrap(),
            diagram: &diagram,
            context: &context,
            services: &services,
            options: &options,
            execution_id: "e",
            hooks: &hooks,
        };
        let mut inputs = ResolvedInputs::default();
        inputs.inputs.insert("default".to_string(), input);
        BatchHandler.execute(ctx, &inputs).await.unwrap()
    }

    #[tokio::test]
    async fn test_batch_emits_one_envelope_per_element() {
        let envelope = run(false, json!([1, 2, 3])).await;
        assert_eq!(envelope.as_json().unwrap(), json!([1, 2, 3]));
        assert_eq!(envelope.meta.get("batch_count"), Some(&json!(3)));

        let stored = envelope.meta.get("batch_envelopes").unwrap().as_array().unwrap();
        let first = Envelope::deserialize(&stored[0]).unwrap();
        assert_eq!(first.as_json().unwrap(), json!(1));
        assert_eq!(first.meta.get("batch_index"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_batch_flatten() {
        let envelope = run(true, json!([[1, 2], [3]])).await;
        assert_eq!(envelope.as_json().unwrap(), json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_scalar_becomes_single_element() {
        let envelope = run(false, json!("only")).await;
        assert_eq!(envelope.as_json().unwrap(), json!(["only"]));
    }
}
