//! Stage 4: output extraction, transform rules, and packing.

use serde_json::Value;

use crate::diagram::{Packing, TransformRule, DEFAULT_HANDLE};
use crate::envelope::{ContentType, Envelope};

use super::{PipelineCtx, ResolutionError};

pub(crate) fn apply(ctx: &mut PipelineCtx<'_>) -> Result<(), ResolutionError> {
    // Borrow-friendly: take the collected edge values out of the context.
    let edge_values = std::mem::take(&mut ctx.edge_values);

    for ev in &edge_values {
        let Some(extracted) = extract(&ev.envelope, &ev.edge.source_output) else {
            // The addressed output does not exist on this envelope; the edge
            // carries nothing (this is how non-taken branches disappear).
            continue;
        };

        let value = transform(extracted, ev, ctx)?;

        match ev.edge.packing {
            Packing::Pack => {
                let key = if ev.edge.target_input.is_empty() {
                    DEFAULT_HANDLE.to_string()
                } else {
                    ev.edge.target_input.clone()
                };
                ctx.inputs.insert(key.clone(), value);
                ctx.envelopes.insert(key, ev.envelope.clone());
            }
            Packing::Spread => {
                let Value::Object(map) = value else {
                    return Err(ResolutionError::transformation(
                        "spread packing requires an object value",
                        value_type(&value),
                        "object",
                        &ctx.node.id,
                        &ev.edge.id,
                    ));
                };
                let colliding: Vec<String> = map
                    .keys()
                    .filter(|k| ctx.inputs.contains_key(*k))
                    .cloned()
                    .collect();
                if !colliding.is_empty() {
                    return Err(ResolutionError::spread_collision(
                        colliding,
                        &ctx.node.id,
                        &ev.edge.id,
                    ));
                }
                for (k, v) in map {
                    ctx.envelopes.insert(k.clone(), ev.envelope.clone());
                    ctx.inputs.insert(k, v);
                }
            }
        }
    }

    Ok(())
}

/// Extract the value addressed by `source_output` from an envelope.
///
/// Object bodies are treated as named-output maps: a named port picks its
/// key; the `default` port prefers an explicit `default` key, falls back to
/// the single value of a one-entry map, and otherwise yields the whole map.
/// Non-object bodies only answer to the `default` port.
fn extract(envelope: &Envelope, source_output: &str) -> Option<Value> {
    if envelope.is_null() {
        return if source_output == DEFAULT_HANDLE { Some(Value::Null) } else { None };
    }

    match envelope.content_type {
        ContentType::Object => {
            let body = envelope.as_json().ok()?;
            match &body {
                Value::Object(map) => {
                    if let Some(v) = map.get(source_output) {
                        return Some(v.clone());
                    }
                    if source_output == DEFAULT_HANDLE {
                        if map.len() == 1 {
                            return map.values().next().cloned();
                        }
                        return Some(body.clone());
                    }
                    None
                }
                other => (source_output == DEFAULT_HANDLE).then(|| other.clone()),
            }
        }
        ContentType::RawText => (source_output == DEFAULT_HANDLE)
            .then(|| envelope.as_text().map(Value::String).ok())
            .flatten(),
        ContentType::ConversationState => (source_output == DEFAULT_HANDLE
            || source_output == "conversation")
            .then(|| serde_json::to_value(envelope.as_conversation().ok()?).ok())
            .flatten(),
        ContentType::Binary => None,
    }
}

fn transform(
    mut value: Value,
    ev: &super::EdgeValue<'_>,
    ctx: &PipelineCtx<'_>,
) -> Result<Value, ResolutionError> {
    for rule in &ev.edge.transform_rules {
        value = match rule {
            TransformRule::JsonToText => match &value {
                Value::String(_) => value,
                other => Value::String(other.to_string()),
            },
            TransformRule::TextToJson => match &value {
                Value::String(s) => serde_json::from_str(s).map_err(|e| {
                    ResolutionError::transformation(
                        format!("cannot parse text as JSON: {e}"),
                        "string",
                        "json",
                        &ctx.node.id,
                        &ev.edge.id,
                    )
                })?,
                other => other.clone(),
            },
            // Branch extraction already happened in `extract` via the
            // condtrue/condfalse output key.
            TransformRule::BranchOnCondition => value,
        };
    }
    Ok(value)
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
