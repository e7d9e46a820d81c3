//! Conversation store used by `person_job` nodes
//!
//! The store keeps per-person message history across loop iterations of one
//! process. The memory policy is applied on read: `no_forget` returns the
//! full history, `on_every_turn` consolidates prior turns into a single
//! summary message, and `upon_request` returns only the system-relevant
//! tail (prior messages are dropped unless explicitly requested).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::diagram::MemoryPolicy;
use crate::envelope::ConversationState;

use super::ServiceError;

#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Messages for a person with the memory policy applied.
    async fn get_messages(
        &self,
        person_id: &str,
        policy: MemoryPolicy,
    ) -> Result<ConversationState, ServiceError>;

    async fn add_message(
        &self,
        person_id: &str,
        role: &str,
        content: &str,
        execution_id: &str,
    ) -> Result<(), ServiceError>;

    async fn clear_all(&self) -> Result<(), ServiceError>;
}

#[derive(Clone)]
struct StoredMessage {
    role: String,
    content: String,
    #[allow(dead_code)]
    execution_id: String,
}

/// Process-local conversation store.
#[derive(Default)]
pub struct InMemoryConversation {
    messages: Mutex<HashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryConversation {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationService for InMemoryConversation {
    async fn get_messages(
        &self,
        person_id: &str,
        policy: MemoryPolicy,
    ) -> Result<ConversationState, ServiceError> {
        let guard = self.messages.lock();
        let history = guard.get(person_id).cloned().unwrap_or_default();
        drop(guard);

        let mut state = ConversationState::default();
        match policy {
            MemoryPolicy::NoForget => {
                for m in &history {
                    state.push(m.role.clone(), m.content.clone());
                }
            }
            MemoryPolicy::OnEveryTurn => {
                if !history.is_empty() {
                    let summary = history
                        .iter()
                        .map(|m| format!("{}: {}", m.role, m.content))
                        .collect::<Vec<_>>()
                        .join("\n");
                    state.push("system", format!("Conversation so far:\n{summary}"));
                    if let Some(last) = history.last() {
                        if last.role == "assistant" {
                            state.last_message = Some(last.content.clone());
                        }
                    }
                }
            }
            MemoryPolicy::UponRequest => {
                if let Some(last) = history.last() {
                    if last.role == "assistant" {
                        state.last_message = Some(last.content.clone());
                    }
                }
            }
        }
        Ok(state)
    }

    async fn add_message(
        &self,
        person_id: &str,
        role: &str,
        content: &str,
        execution_id: &str,
    ) -> Result<(), ServiceError> {
        self.messages
            .lock()
            .entry(person_id.to_string())
            .or_default()
            .push(StoredMessage {
                role: role.to_string(),
                content: content.to_string(),
                execution_id: execution_id.to_string(),
            });
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), ServiceError> {
        self.messages.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_forget_keeps_full_history() {
        let store = InMemoryConversation::new();
        store.add_message("p", "user", "q1", "e").await.unwrap();
        store.add_message("p", "assistant", "a1", "e").await.unwrap();

        let state = store.get_messages("p", MemoryPolicy::NoForget).await.unwrap();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.last_message.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_on_every_turn_consolidates() {
        let store = InMemoryConversation::new();
        store.add_message("p", "user", "q1", "e").await.unwrap();
        store.add_message("p", "assistant", "a1", "e").await.unwrap();

        let state = store.get_messages("p", MemoryPolicy::OnEveryTurn).await.unwrap();
        assert_eq!(state.messages.len(), 1);
        assert!(state.messages[0].content.contains("q1"));
        assert!(state.messages[0].content.contains("a1"));
    }

    #[tokio::test]
    async fn test_upon_request_drops_history() {
        let store = InMemoryConversation::new();
        store.add_message("p", "user", "q1", "e").await.unwrap();
        store.add_message("p", "assistant", "a1", "e").await.unwrap();

        let state = store.get_messages("p", MemoryPolicy::UponRequest).await.unwrap();
        assert!(state.messages.is_empty());
        assert_eq!(state.last_message.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_clear_all() {
        let store = InMemoryConversation::new();
        store.add_message("p", "user", "q", "e").await.unwrap();
        store.clear_all().await.unwrap();
        let state = store.get_messages("p", MemoryPolicy::NoForget).await.unwrap();
        assert!(state.messages.is_empty());
    }
}
