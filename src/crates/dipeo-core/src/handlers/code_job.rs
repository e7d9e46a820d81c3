//! `code_job` node: template substitution plus sandboxed subprocess execution.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::diagram::{CodeLanguage, NodeConfig, NodeType};
use crate::envelope::Envelope;
use crate::resolve::{ResolutionError, ResolvedInputs};
use crate::services::template::scope_from;

use super::{HandlerCtx, HandlerError, NodeHandler};

/// Environment variable carrying the resolved inputs as JSON.
const INPUTS_ENV: &str = "DIPEO_INPUTS";

pub struct CodeJobHandler;

#[async_trait]
impl NodeHandler for CodeJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::CodeJob
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["template"]
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::CodeJob { language, code, timeout_seconds } = &ctx.node.config else {
            return Err(HandlerError::Failed("code_job handler on wrong node type".to_string()));
        };

        // Substitute template variables into the source; a missing variable
        // is a transformation failure, not a silent empty string.
        let scope = scope_from(&inputs.to_object(), &ctx.context.get_variables());
        let rendered = ctx.services.template()?.process(code, &scope);
        if !rendered.missing_keys.is_empty() {
            return Err(HandlerError::Resolution(ResolutionError::transformation(
                format!("template variables missing: {}", rendered.missing_keys.join(", ")),
                "template",
                "code",
                &ctx.node.id,
                "",
            )));
        }
        let source = rendered.content;

        let inputs_json = serde_json::to_string(&inputs.to_object())
            .map_err(crate::services::ServiceError::from)?;

        let mut command = build_command(*language, &source);
        command
            .env(INPUTS_ENV, &inputs_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Scalar inputs double as environment variables for shell scripts.
        if *language == CodeLanguage::Bash {
            for (key, value) in &inputs.inputs {
                if let Some(text) = scalar_text(value) {
                    command.env(key, text);
                }
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| HandlerError::Failed(format!("failed to spawn {language:?}: {e}")))?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");
        let duration = std::time::Duration::from_secs(*timeout_seconds);

        let wait = async {
            let mut out = String::new();
            let mut err = String::new();
            let _ = stdout.read_to_string(&mut out).await;
            let _ = stderr.read_to_string(&mut err).await;
            let status = child.wait().await;
            (status, out, err)
        };

        let (status, out, err) = match tokio::time::timeout(duration, wait).await {
            Ok(result) => result,
            Err(_) => return Err(HandlerError::Timeout(*timeout_seconds)),
        };

        let status =
            status.map_err(|e| HandlerError::Failed(format!("process wait failed: {e}")))?;
        if !status.success() {
            let detail = if err.trim().is_empty() { out.trim() } else { err.trim() };
            return Err(HandlerError::Failed(format!(
                "{language:?} exited with {status}: {detail}"
            )));
        }

        let captured = out.trim_end_matches('\n').to_string();

        // Structured stdout becomes an object envelope; anything else stays
        // text.
        match serde_json::from_str::<Value>(&captured) {
            Ok(value) if value.is_object() || value.is_array() => Ok(ctx.envelope_json(value)),
            _ => Ok(ctx.envelope_text(captured)),
        }
    }
}

/// Build the interpreter invocation for a language. Python and JavaScript
/// sources get a prelude exposing `inputs` and an epilogue that prints the
/// `result` variable when the script assigns one.
fn build_command(language: CodeLanguage, source: &str) -> Command {
    match language {
        CodeLanguage::Python => {
            let program = format!(
                "import json as _dipeo_json, os as _dipeo_os\n\
                 inputs = _dipeo_json.loads(_dipeo_os.environ.get(\"{INPUTS_ENV}\", \"{{}}\"))\n\
                 {source}\n\
                 try:\n\
                 \x20   _dipeo_result = result\n\
                 except NameError:\n\
                 \x20   _dipeo_result = None\n\
                 if _dipeo_result is not None:\n\
                 \x20   print(_dipeo_result if isinstance(_dipeo_result, str) else _dipeo_json.dumps(_dipeo_result))\n"
            );
            let mut command = Command::new("python3");
            command.arg("-c").arg(program);
            command
        }
        CodeLanguage::Javascript => {
            let program = format!(
                "const inputs = JSON.parse(process.env.{INPUTS_ENV} || \"{{}}\");\n\
                 let result;\n\
                 {source}\n\
                 if (result !== undefined) {{\n\
                 \x20 console.log(typeof result === \"string\" ? result : JSON.stringify(result));\n\
                 }}\n"
            );
            let mut command = Command::new("node");
            command.arg("-e").arg(program);
            command
        }
        CodeLanguage::Bash => {
            let mut command = Command::new("bash");
            command.arg("-c").arg(source);
            command
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
