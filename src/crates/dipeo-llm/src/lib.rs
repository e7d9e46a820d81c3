//! LLM service port for the DiPeO execution engine.
//!
//! This crate defines the provider-agnostic contract the engine uses to talk
//! to language models: the [`LlmClient`] trait, chat message and completion
//! types, and token-usage accounting. Concrete provider adapters (OpenAI,
//! Anthropic, local runners, ...) live outside the engine and implement
//! [`LlmClient`]; the engine only ever holds an `Arc<dyn LlmClient>` looked
//! up from the service registry.
//!
//! [`MockLlm`] ships in-crate for tests and dry runs: it replays canned
//! responses and records every request it saw.

pub mod config;
pub mod error;
pub mod mock;

pub use config::LlmConfig;
pub use error::{LlmError, Result};
pub use mock::MockLlm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role within a chat exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single chat message sent to or received from a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Token accounting for a single call or an aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output, total: input + output }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
    }
}

/// A completion request: messages plus model selection and options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Tool names the caller wants enabled, if the provider supports them.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            api_key_id: None,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
        }
    }

    pub fn with_api_key_id(mut self, id: impl Into<String>) -> Self {
        self.api_key_id = Some(id.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// The result of a completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub text: String,
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub tool_outputs: Vec<Value>,
}

impl CompletionResult {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            token_usage: TokenUsage::default(),
            tool_outputs: Vec::new(),
        }
    }
}

/// Provider-agnostic LLM client.
///
/// Implementations must be safe for concurrent calls: the engine invokes
/// `complete` from parallel handler tasks without external locking.
#[async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    /// Run a chat completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult>;

    /// List the models this client can serve.
    async fn available_models(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_add() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage::new(10, 5));
        total.add(&TokenUsage::new(2, 3));
        assert_eq!(total, TokenUsage { input: 12, output: 8, total: 20 });
    }

    #[test]
    fn test_request_builder() {
        let req = CompletionRequest::new(vec![ChatMessage::user("hi")], "test-model")
            .with_api_key_id("key-1")
            .with_temperature(0.2);
        assert_eq!(req.model, "test-model");
        assert_eq!(req.api_key_id.as_deref(), Some("key-1"));
        assert_eq!(req.temperature, Some(0.2));
    }
}
