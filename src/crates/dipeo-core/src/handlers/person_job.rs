//! `person_job` node: prompt building, memory policy, and the LLM call.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use dipeo_llm::{ChatMessage, CompletionRequest, Role};

use crate::diagram::{NodeConfig, NodeType};
use crate::envelope::{ConversationState, Envelope};
use crate::resolve::ResolvedInputs;
use crate::services::template::scope_from;

use super::{HandlerCtx, HandlerError, NodeHandler};

pub struct PersonJobHandler;

#[async_trait]
impl NodeHandler for PersonJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::PersonJob
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["llm", "template", "conversation"]
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::PersonJob {
            person: person_id,
            default_prompt,
            first_only_prompt,
            memory_policy,
            tools,
            ..
        } = &ctx.node.config
        else {
            return Err(HandlerError::Failed("person_job handler on wrong node type".to_string()));
        };

        let person = ctx
            .diagram
            .person(person_id)
            .ok_or_else(|| HandlerError::Failed(format!("unknown person '{person_id}'")))?;

        // First execution may use a dedicated prompt.
        let iteration = ctx.context.get_execution_count(&ctx.node.id);
        let template_text = match (iteration, first_only_prompt) {
            (1, Some(first)) => first.as_str(),
            _ => default_prompt.as_str(),
        };

        let scope = prompt_scope(&ctx, inputs);
        let template = ctx.services.template()?;
        let rendered = template.process(template_text, &scope);
        for key in &rendered.missing_keys {
            tracing::warn!(node_id = %ctx.node.id, key = %key, "prompt template key missing");
        }
        let user_prompt = rendered.content;

        // Prior conversation: the provider input when declared, the
        // conversation service otherwise (memory policy applied either way).
        let conversation_service = ctx.services.conversation()?;
        let prior: ConversationState = match inputs.inputs.get("_conversation") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(crate::services::ServiceError::from)?,
            None => conversation_service.get_messages(person_id, *memory_policy).await?,
        };

        let mut messages = Vec::with_capacity(prior.messages.len() + 2);
        if !person.system_prompt.is_empty() {
            messages.push(ChatMessage::system(person.system_prompt.clone()));
        }
        for message in &prior.messages {
            let role = match message.role.as_str() {
                "assistant" => Role::Assistant,
                "system" => Role::System,
                _ => Role::User,
            };
            messages.push(ChatMessage { role, content: message.content.clone() });
        }
        messages.push(ChatMessage::user(user_prompt.clone()));

        let mut request = CompletionRequest::new(messages, &person.model);
        if let Some(key_id) = &person.api_key_id {
            request = request.with_api_key_id(key_id.clone());
        }
        request.tools = tools.clone();

        let result = ctx.services.llm()?.complete(request).await?;

        conversation_service
            .add_message(person_id, "user", &user_prompt, ctx.execution_id)
            .await?;
        conversation_service
            .add_message(person_id, "assistant", &result.text, ctx.execution_id)
            .await?;

        // Downstream edges may consume the conversation alongside the text.
        let wants_conversation = ctx
            .diagram
            .outgoing_edges(&ctx.node.id)
            .any(|e| e.source_output == "conversation");

        let envelope = if wants_conversation {
            let mut state = prior.clone();
            state.push("user", user_prompt);
            state.push("assistant", result.text.clone());
            let conversation_value =
                serde_json::to_value(&state).map_err(crate::services::ServiceError::from)?;
            ctx.envelope_json(json!({
                "default": result.text,
                "conversation": conversation_value,
            }))
        } else {
            ctx.envelope_text(result.text.clone())
        };

        let usage = serde_json::to_value(result.token_usage)
            .map_err(crate::services::ServiceError::from)?;
        Ok(envelope.with_meta("token_usage", usage))
    }
}

/// Template scope: inputs (with the `default` object's keys hoisted), then
/// execution variables.
fn prompt_scope(ctx: &HandlerCtx<'_>, inputs: &ResolvedInputs) -> BTreeMap<String, Value> {
    let mut scope = scope_from(&inputs.to_object(), &ctx.context.get_variables());
    if let Some(Value::Object(map)) = inputs.default_input() {
        for (key, value) in map {
            scope.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    scope
}
