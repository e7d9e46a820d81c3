//! Stage 5: default values for missing required inputs.

use serde_json::{json, Value};

use super::PipelineCtx;

pub(crate) fn apply(ctx: &mut PipelineCtx<'_>) {
    for required in &ctx.node.required_inputs {
        if ctx.inputs.contains_key(required) {
            continue;
        }

        if let Some(default) = ctx.node.defaults.get(required) {
            ctx.inputs.insert(required.clone(), default.clone());
            continue;
        }

        if let Some(type_name) = ctx.node.input_types.get(required) {
            if let Some(default) = type_default(type_name) {
                ctx.inputs.insert(required.clone(), default);
                continue;
            }
        }

        // No value and no default: record a warning, the handler decides
        // whether that is fatal.
        ctx.warnings
            .push(format!("required input '{required}' is missing and has no default"));
    }
}

fn type_default(type_name: &str) -> Option<Value> {
    match type_name {
        "string" => Some(json!("")),
        "number" => Some(json!(0)),
        "boolean" => Some(json!(false)),
        "array" => Some(json!([])),
        "object" => Some(json!({})),
        _ => None,
    }
}
