//! `hook` node: shell or webhook side effects with output passthrough.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::diagram::{NodeConfig, NodeType};
use crate::envelope::Envelope;
use crate::resolve::ResolvedInputs;
use crate::services::HttpRequest;

use super::{HandlerCtx, HandlerError, NodeHandler};

pub struct HookHandler;

#[async_trait]
impl NodeHandler for HookHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Hook
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::Hook { hook_type, command, url, timeout_seconds } = &ctx.node.config
        else {
            return Err(HandlerError::Failed("hook handler on wrong node type".to_string()));
        };

        let payload = inputs.to_object();

        match hook_type.as_str() {
            "shell" => {
                let command_line = command
                    .as_deref()
                    .ok_or_else(|| HandlerError::Failed("shell hook requires 'command'".to_string()))?;

                let payload_json = serde_json::to_string(&payload)
                    .map_err(crate::services::ServiceError::from)?;
                let child = Command::new("bash")
                    .arg("-c")
                    .arg(command_line)
                    .env("DIPEO_HOOK_INPUT", payload_json)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| HandlerError::Failed(format!("failed to spawn hook: {e}")))?;

                let duration = Duration::from_secs(*timeout_seconds);
                let output = match tokio::time::timeout(duration, child.wait_with_output()).await {
                    Ok(result) => {
                        result.map_err(|e| HandlerError::Failed(format!("hook wait failed: {e}")))?
                    }
                    Err(_) => return Err(HandlerError::Timeout(*timeout_seconds)),
                };

                if !output.status.success() {
                    return Err(HandlerError::Failed(format!(
                        "hook exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                let stdout = String::from_utf8_lossy(&output.stdout)
                    .trim_end()
                    .to_string();
                Ok(ctx.envelope_text(stdout))
            }

            "webhook" => {
                let target = url
                    .as_deref()
                    .ok_or_else(|| HandlerError::Failed("webhook hook requires 'url'".to_string()))?;
                let response = ctx
                    .services
                    .http()?
                    .request(HttpRequest {
                        method: "POST".to_string(),
                        url: target.to_string(),
                        headers: Default::default(),
                        params: Default::default(),
                        body: Some(payload),
                        timeout: Duration::from_secs(*timeout_seconds),
                    })
                    .await?;
                let body = serde_json::from_str::<Value>(&response.body)
                    .unwrap_or(Value::String(response.body));
                Ok(ctx.envelope_json(body))
            }

            other => Err(HandlerError::Failed(format!("unknown hook type '{other}'"))),
        }
    }
}
