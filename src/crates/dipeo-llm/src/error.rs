//! Error types for LLM client implementations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model '{0}' is not available")]
    UnknownModel(String),

    #[error("missing or invalid API key: {0}")]
    Auth(String),

    #[error("provider request failed: {0}")]
    Provider(String),

    #[error("provider response could not be parsed: {0}")]
    BadResponse(String),

    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),
}
