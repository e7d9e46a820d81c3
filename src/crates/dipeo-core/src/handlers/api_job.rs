//! `api_job` node: outbound HTTP calls with auth and timeout.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::diagram::{ApiAuth, NodeConfig, NodeType};
use crate::envelope::Envelope;
use crate::resolve::ResolvedInputs;
use crate::services::template::scope_from;
use crate::services::HttpRequest;

use super::{HandlerCtx, HandlerError, NodeHandler};

pub struct ApiJobHandler;

#[async_trait]
impl NodeHandler for ApiJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::ApiJob
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["http", "template", "api_key"]
    }

    async fn execute(
        &self,
        ctx: HandlerCtx<'_>,
        inputs: &ResolvedInputs,
    ) -> Result<Envelope, HandlerError> {
        let NodeConfig::ApiJob {
            url,
            method,
            headers,
            params,
            body,
            auth,
            timeout_seconds,
            allow_error_status,
        } = &ctx.node.config
        else {
            return Err(HandlerError::Failed("api_job handler on wrong node type".to_string()));
        };

        let scope = scope_from(&inputs.to_object(), &ctx.context.get_variables());
        let template = ctx.services.template()?;
        let render = |text: &str| template.process(text, &scope).content;

        let mut resolved_headers: BTreeMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.clone(), render(v)))
            .collect();
        let resolved_params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.clone(), render(v)))
            .collect();

        apply_auth(&ctx, auth, &mut resolved_headers).await?;

        let request = HttpRequest {
            method: method.clone(),
            url: render(url),
            headers: resolved_headers,
            params: resolved_params,
            body: body.clone(),
            timeout: Duration::from_secs(*timeout_seconds),
        };

        let response = ctx.services.http()?.request(request).await?;

        if !response.is_success() && !allow_error_status {
            return Err(HandlerError::Failed(format!(
                "request to {url} returned status {}: {}",
                response.status,
                truncate(&response.body, 200)
            )));
        }

        // Structured responses surface as JSON so downstream extraction works.
        let parsed_body = serde_json::from_str::<Value>(&response.body)
            .unwrap_or(Value::String(response.body));
        Ok(ctx.envelope_json(json!({
            "status": response.status,
            "body": parsed_body,
        })))
    }
}

async fn apply_auth(
    ctx: &HandlerCtx<'_>,
    auth: &ApiAuth,
    headers: &mut BTreeMap<String, String>,
) -> Result<(), HandlerError> {
    match auth {
        ApiAuth::None => {}
        ApiAuth::Bearer { token_ref } => {
            let key = ctx.services.api_keys()?.get(token_ref).await?;
            headers.insert("Authorization".to_string(), format!("Bearer {}", key.key));
        }
        ApiAuth::Basic { username, password_ref } => {
            let key = ctx.services.api_keys()?.get(password_ref).await?;
            headers.insert(
                "Authorization".to_string(),
                format!("Basic {}", basic_credentials(username, &key.key)),
            );
        }
        ApiAuth::ApiKey { header, key_ref } => {
            let key = ctx.services.api_keys()?.get(key_ref).await?;
            headers.insert(header.clone(), key.key);
        }
    }
    Ok(())
}

/// Encode the `user:password` pair for a Basic authorization header.
fn basic_credentials(username: &str, password: &str) -> String {
    use base64::Engine;
    let credentials = format!("{username}:{password}");
    base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes())
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_credentials_encoding() {
        // RFC 7617's own example pair.
        assert_eq!(basic_credentials("Aladdin", "open sesame"), "QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert_eq!(basic_credentials("a", "b"), "YTpi");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
