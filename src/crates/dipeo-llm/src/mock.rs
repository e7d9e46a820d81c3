//! Scripted LLM client for tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::{CompletionRequest, CompletionResult, LlmClient, LlmError, Result, TokenUsage};

/// An [`LlmClient`] that replays canned responses in order and records every
/// request. When the script runs out it echoes the last user message, so
/// tests that only care about plumbing need no setup at all.
#[derive(Default, Debug)]
pub struct MockLlm {
    responses: Mutex<VecDeque<CompletionResult>>,
    requests: Mutex<Vec<CompletionRequest>>,
    fail_with: Mutex<Option<String>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text response with a nominal token count.
    pub fn push_text(&self, text: impl Into<String>) {
        let text = text.into();
        let usage = TokenUsage::new(8, text.len() as u64 / 4 + 1);
        self.responses.lock().push_back(CompletionResult {
            text,
            token_usage: usage,
            tool_outputs: Vec::new(),
        });
    }

    pub fn push_result(&self, result: CompletionResult) {
        self.responses.lock().push_back(result);
    }

    /// Make every subsequent call fail with a provider error.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock() = Some(message.into());
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult> {
        if let Some(message) = self.fail_with.lock().clone() {
            self.requests.lock().push(request);
            return Err(LlmError::Provider(message));
        }

        let scripted = self.responses.lock().pop_front();
        let result = scripted.unwrap_or_else(|| {
            let echo = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == crate::Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            CompletionResult {
                text: echo,
                token_usage: TokenUsage::new(4, 4),
                tool_outputs: Vec::new(),
            }
        });
        self.requests.lock().push(request);
        Ok(result)
    }

    async fn available_models(&self) -> Result<Vec<String>> {
        Ok(vec!["mock-model".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;

    #[tokio::test]
    async fn test_mock_replays_in_order() {
        let mock = MockLlm::new();
        mock.push_text("first");
        mock.push_text("second");

        let req = CompletionRequest::new(vec![ChatMessage::user("q")], "mock-model");
        assert_eq!(mock.complete(req.clone()).await.unwrap().text, "first");
        assert_eq!(mock.complete(req.clone()).await.unwrap().text, "second");
        // Script exhausted: echoes the user message.
        assert_eq!(mock.complete(req).await.unwrap().text, "q");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_failure_mode() {
        let mock = MockLlm::new();
        mock.fail_with("service down");
        let req = CompletionRequest::new(vec![ChatMessage::user("q")], "mock-model");
        assert!(mock.complete(req).await.is_err());
    }
}
