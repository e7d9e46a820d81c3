//! `condition` node: evaluators and branch emission
//!
//! A condition runs one of four evaluators and emits its payload on exactly
//! one of the `condtrue`/`condfalse` outputs. The branch is carried both as
//! the output key (so downstream extraction naturally filters the other
//! branch) and as `meta.branch_id` (so the scheduler records the decision).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use dipeo_llm::{ChatMessage, CompletionRequest};

use crate::diagram::{
    ConditionEvaluator, NodeConfig, NodeType, BRANCH_FALSE, BRANCH_TRUE,
};
use crate::envelope::Envelope;
use crate::expr;
use crate::resolve::ResolvedInputs;
use crate::state::Status;

use super::{stage_variables, HandlerCtx, HandlerError, NodeHandler};

pub struct ConditionHandler;

/// Evaluate a condition node's configured evaluator to a boolean.
///
/// Exposed separately from the handler so the engine's tests and external
/// tooling can probe evaluator behavior without a full dispatch cycle.
pub async fn evaluate_condition(
    ctx: &HandlerCtx<'_>,
    evaluator: &ConditionEvaluator,
    inputs: &ResolvedInputs,
) -> Result<bool, HandlerError> {
    match evaluator {
        ConditionEvaluator::CustomExpression { expression } => {
            let scope = expression_scope(ctx, inputs);
            match expr::evaluate_bool(expression, &scope) {
                Ok(result) => Ok(result),
                Err(e) => {
                    // Evaluation failures resolve to false rather than
                    // failing the node; rejection already happened loudly.
                    tracing::warn!(
                        node_id = %ctx.node.id,
                        expression = %expression,
                        "condition expression failed: {e}"
                    );
                    Ok(false)
                }
            }
        }

        ConditionEvaluator::MaxIterations => {
            let mut found_executed = false;
            for node in ctx.diagram.nodes_of_type(NodeType::PersonJob) {
                let count = ctx.context.get_execution_count(&node.id);
                if count == 0 {
                    continue;
                }
                found_executed = true;
                if ctx.context.get_status(&node.id) != Some(Status::MaxiterReached) {
                    return Ok(false);
                }
            }
            Ok(found_executed)
        }

        ConditionEvaluator::NodesExecuted { node_ids } => {
            if node_ids.is_empty() {
                return Ok(false);
            }
            Ok(node_ids
                .iter()
                .all(|id| ctx.context.get_execution_count(id) > 0))
        }

        ConditionEvaluator::LlmDecision { person, prompt } => {
            let person = ctx
                .diagram
                .person(person)
                .ok_or_else(|| HandlerError::Failed(format!("unknown person '{person}'")))?;

            let template = ctx.services.template()?;
            let scope = expression_scope(ctx, inputs);
            let rendered = template.process(prompt, &scope).content;

            let mut request = CompletionRequest::new(
                vec![
                    ChatMessage::system(
                        "You are a decision gate. Answer with exactly YES or NO.",
                    ),
                    ChatMessage::user(rendered),
                ],
                &person.model,
            );
            if let Some(key_id) = &person.api_key_id {
                request = request.with_api_key_id(key_id.clone());
            }

            let result = ctx.services.llm()?.complete(request).await?;
            let answer = result.text.trim().to_ascii_lowercase();
            Ok(answer.starts_with("yes") || answer.starts_with("true"))
        }
    }
}

/// Scope for expressions and LLM prompts: named inputs, the keys of the
/// `default` input when it is an object, then execution variables.
fn expression_scope(ctx: &HandlerCtx<'_>, inputs: &ResolvedInputs) -> BTreeMap<String, Value> {
    let mut scope: BTreeMap<String, Value> = BTreeMap::new();
    for (key, value) in &inputs.inputs {
        scope.insert(key.clone(), value.clone());
    }
    if let Some(Value::Object(map)) = inputs.default_input() {
        for (key, value) in map {
            scope.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    for (key, value) in ctx.context.get_variables() {
        scope.entry(key).or_insert(value);
    }
    scope
}

#[async_trait]
impl NodeHandler for ConditionHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Condition
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::Condition { evaluator, expose_index_as } = &ctx.node.config else {
            return Err(HandlerError::Failed("condition handler on non-condition node".to_string()));
        };

        let result = evaluate_condition(&ctx, evaluator, inputs).await?;
        let branch = if result { BRANCH_TRUE } else { BRANCH_FALSE };

        // The evaluated payload travels on the taken branch only.
        let payload = match inputs.default_input() {
            Some(value) => value.clone(),
            None => inputs.to_object(),
        };
        let mut body = serde_json::Map::new();
        body.insert(branch.to_string(), payload);
        let envelope = ctx.envelope_json(Value::Object(body)).with_branch(branch);

        let mut staged = BTreeMap::new();
        if let Some(variable) = expose_index_as {
            // Current execution count doubles as the loop index.
            let index = ctx.context.get_execution_count(&ctx.node.id);
            staged.insert(variable.clone(), json!(index));
        }

        Ok(stage_variables(envelope, staged))
    }
}
