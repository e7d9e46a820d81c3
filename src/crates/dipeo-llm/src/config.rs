//! Client-side configuration shared by LLM adapters.

use serde::{Deserialize, Serialize};

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout() -> u64 {
    120
}

/// Configuration an adapter reads when constructing requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model used when a person does not name one.
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o-mini".to_string(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_seconds: default_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: LlmConfig =
            serde_json::from_str(r#"{"default_model": "local-7b"}"#).unwrap();
        assert_eq!(config.default_model, "local-7b");
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.timeout_seconds, 120);
    }
}
