//! Service registry and service ports
//!
//! Handlers never construct their collaborators; they look them up from the
//! [`ServiceRegistry`] the engine was started with. Each service is a narrow
//! trait object so the outer application decides the concrete wiring (local
//! filesystem, real HTTP, mock LLM, ...). The registry is built once before
//! execution and shared read-only.

pub mod api_keys;
pub mod conversation;
pub mod file;
pub mod http;
pub mod storage;
pub mod template;

pub use api_keys::{ApiKey, ApiKeyService, InMemoryApiKeys};
pub use conversation::{ConversationService, InMemoryConversation};
pub use file::{FileService, LocalFileService};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use storage::{DiagramStorage, FileInfo, LocalDiagramStorage};
pub use template::{SimpleTemplateProcessor, TemplateResult, TemplateService};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use dipeo_llm::{LlmClient, MockLlm};

/// Errors raised by service implementations and registry lookups.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{0}' is not registered")]
    Missing(&'static str),

    #[error("api key '{0}' not found")]
    UnknownApiKey(String),

    #[error("path '{0}' escapes the allowed base directory")]
    PathEscapes(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Port for collecting interactive answers (`user_response` nodes).
#[async_trait]
pub trait UserInputService: Send + Sync {
    /// Ask the user a question; an expired timeout yields an empty answer.
    async fn ask(&self, prompt: &str, timeout_seconds: u64) -> Result<String, ServiceError>;
}

/// Canned answers for tests and non-interactive runs.
pub struct CannedUserInput {
    answers: parking_lot::Mutex<std::collections::VecDeque<String>>,
}

impl CannedUserInput {
    pub fn new(answers: Vec<String>) -> Self {
        Self { answers: parking_lot::Mutex::new(answers.into_iter().collect()) }
    }
}

#[async_trait]
impl UserInputService for CannedUserInput {
    async fn ask(&self, _prompt: &str, _timeout_seconds: u64) -> Result<String, ServiceError> {
        Ok(self.answers.lock().pop_front().unwrap_or_default())
    }
}

/// Port for the Notion collaborator used by `notion` nodes.
#[async_trait]
pub trait NotionService: Send + Sync {
    async fn execute(
        &self,
        operation: &str,
        page_id: &str,
        api_key: &str,
        input: Value,
    ) -> Result<Value, ServiceError>;
}

/// Typed handles for every service the engine can look up.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    llm: Option<Arc<dyn LlmClient>>,
    file: Option<Arc<dyn FileService>>,
    template: Option<Arc<dyn TemplateService>>,
    conversation: Option<Arc<dyn ConversationService>>,
    api_keys: Option<Arc<dyn ApiKeyService>>,
    http: Option<Arc<dyn HttpClient>>,
    diagram_storage: Option<Arc<dyn DiagramStorage>>,
    user_input: Option<Arc<dyn UserInputService>>,
    notion: Option<Arc<dyn NotionService>>,
}

macro_rules! service_accessors {
    ($($field:ident : $trait_ty:ty => ($with:ident, $name:literal)),* $(,)?) => {
        impl ServiceRegistry {
            $(
                pub fn $with(mut self, service: Arc<$trait_ty>) -> Self {
                    self.$field = Some(service);
                    self
                }

                pub fn $field(&self) -> Result<Arc<$trait_ty>, ServiceError> {
                    self.$field.clone().ok_or(ServiceError::Missing($name))
                }
            )*
        }
    };
}

service_accessors! {
    llm: dyn LlmClient => (with_llm, "llm"),
    file: dyn FileService => (with_file, "file"),
    template: dyn TemplateService => (with_template, "template"),
    conversation: dyn ConversationService => (with_conversation, "conversation"),
    api_keys: dyn ApiKeyService => (with_api_keys, "api_key"),
    http: dyn HttpClient => (with_http, "http"),
    diagram_storage: dyn DiagramStorage => (with_diagram_storage, "diagram_storage"),
    user_input: dyn UserInputService => (with_user_input, "user_input"),
    notion: dyn NotionService => (with_notion, "notion"),
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default local wiring: filesystem services rooted at `base_dir`,
    /// in-memory conversation store, simple templates, real HTTP client.
    /// The LLM client is left to the caller.
    pub fn local(base_dir: impl Into<std::path::PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self::new()
            .with_file(Arc::new(LocalFileService::new(base_dir.clone())))
            .with_template(Arc::new(SimpleTemplateProcessor::new()))
            .with_conversation(Arc::new(InMemoryConversation::new()))
            .with_api_keys(Arc::new(InMemoryApiKeys::new()))
            .with_http(Arc::new(ReqwestHttpClient::new()))
            .with_diagram_storage(Arc::new(LocalDiagramStorage::new(base_dir)))
    }

    /// Registry used by unit tests: everything in-memory, mock LLM, no
    /// network.
    pub fn for_tests() -> Self {
        Self::new()
            .with_llm(Arc::new(MockLlm::new()))
            .with_file(Arc::new(LocalFileService::new(std::env::temp_dir())))
            .with_template(Arc::new(SimpleTemplateProcessor::new()))
            .with_conversation(Arc::new(InMemoryConversation::new()))
            .with_api_keys(Arc::new(InMemoryApiKeys::new()))
            .with_user_input(Arc::new(CannedUserInput::new(Vec::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_service_lookup_fails_with_name() {
        let registry = ServiceRegistry::new();
        let err = registry.llm().unwrap_err();
        assert!(matches!(err, ServiceError::Missing("llm")));
    }

    #[test]
    fn test_for_tests_registry_has_core_services() {
        let registry = ServiceRegistry::for_tests();
        assert!(registry.llm().is_ok());
        assert!(registry.file().is_ok());
        assert!(registry.template().is_ok());
        assert!(registry.conversation().is_ok());
        assert!(registry.http().is_err());
    }
}
