//! Typed message envelopes for inter-node communication
//!
//! Every value that travels along a diagram edge is wrapped in an [`Envelope`]:
//! an immutable record carrying the payload, its content type, the producing
//! node, and free-form metadata. Handlers produce envelopes, the scheduler
//! records them in the state store, and the input-resolution pipeline reads
//! them back when downstream nodes become ready.
//!
//! Envelopes are immutable after construction. The only permitted "mutation"
//! is [`Envelope::with_meta`], which returns a new envelope sharing the body
//! but with merged metadata. Iteration and branch tagging are meta-only.
//!
//! Content types form a closed set and reader coercions are explicit:
//! `as_text` on an object envelope re-encodes as JSON, `as_json` on a text
//! envelope parses it, and anything else fails with [`EnvelopeError`] rather
//! than silently guessing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Conversation state carried by `conversation_state` envelopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    /// Ordered message history, oldest first.
    pub messages: Vec<ConversationMessage>,
    /// Text of the most recent assistant message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

/// A single message within a conversation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
}

impl ConversationState {
    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>) {
        let content = content.into();
        let role = role.into();
        if role == "assistant" {
            self.last_message = Some(content.clone());
        }
        self.messages.push(ConversationMessage { role, content });
    }
}

/// Closed set of payload kinds an envelope can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    RawText,
    Object,
    ConversationState,
    Binary,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContentType::RawText => "raw_text",
            ContentType::Object => "object",
            ContentType::ConversationState => "conversation_state",
            ContentType::Binary => "binary",
        };
        f.write_str(s)
    }
}

/// Envelope payload, one variant per [`ContentType`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeBody {
    Text(String),
    Object(Value),
    Conversation(ConversationState),
    Binary(Vec<u8>),
    /// Null payload used by skipped nodes so downstream resolution proceeds.
    Null,
}

/// Errors from envelope coercion and (de)serialization.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("cannot convert {from} to {to}: {reason}")]
    Coercion {
        from: ContentType,
        to: &'static str,
        reason: String,
    },
    #[error("invalid envelope data: missing envelope_format discriminator")]
    MissingDiscriminator,
    #[error("invalid envelope data: unknown content_type '{0}'")]
    UnknownContentType(String),
    #[error("invalid envelope data: {0}")]
    Malformed(String),
}

/// Immutable typed message flowing along diagram edges.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Unique envelope id.
    pub id: String,
    /// Execution id this envelope belongs to.
    pub trace_id: String,
    /// Id of the node that produced the value (`"system"` for engine-made ones).
    pub produced_by: String,
    pub content_type: ContentType,
    /// Optional schema identifier for object payloads.
    pub schema_id: Option<String>,
    /// Encoding hint for binary payloads (e.g. `"msgpack"`).
    pub serialization_format: Option<String>,
    pub body: EnvelopeBody,
    /// Free-form metadata. Conventional keys: `iteration`, `branch_id`,
    /// `error`, `error_type`, `timestamp`, `token_usage`.
    pub meta: BTreeMap<String, Value>,
}

impl Envelope {
    fn base(content_type: ContentType, body: EnvelopeBody, produced_by: &str) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert("timestamp".to_string(), Value::from(Utc::now().timestamp_millis()));
        Self {
            id: Uuid::new_v4().to_string(),
            trace_id: String::new(),
            produced_by: produced_by.to_string(),
            content_type,
            schema_id: None,
            serialization_format: None,
            body,
            meta,
        }
    }

    /// Create a `raw_text` envelope.
    pub fn text(content: impl Into<String>, produced_by: &str) -> Self {
        Self::base(ContentType::RawText, EnvelopeBody::Text(content.into()), produced_by)
    }

    /// Create an `object` envelope from a JSON value.
    pub fn json(data: Value, produced_by: &str) -> Self {
        Self::base(ContentType::Object, EnvelopeBody::Object(data), produced_by)
    }

    /// Create a `conversation_state` envelope.
    pub fn conversation(state: ConversationState, produced_by: &str) -> Self {
        Self::base(
            ContentType::ConversationState,
            EnvelopeBody::Conversation(state),
            produced_by,
        )
    }

    /// Create a `binary` envelope with an explicit serialization format.
    pub fn binary(data: Vec<u8>, format: impl Into<String>, produced_by: &str) -> Self {
        let mut env = Self::base(ContentType::Binary, EnvelopeBody::Binary(data), produced_by);
        env.serialization_format = Some(format.into());
        env
    }

    /// Create an error envelope. The message doubles as the text body so
    /// downstream consumers that only read text still see something useful.
    pub fn error(message: impl Into<String>, error_type: &str, produced_by: &str) -> Self {
        let message = message.into();
        let mut env = Self::text(message.clone(), produced_by);
        env.meta.insert("error".to_string(), Value::String(message));
        env.meta
            .insert("error_type".to_string(), Value::String(error_type.to_string()));
        env
    }

    /// Create a null-bodied envelope, used when a node is skipped.
    pub fn null(produced_by: &str) -> Self {
        Self::base(ContentType::RawText, EnvelopeBody::Null, produced_by)
    }

    /// Return a new envelope with the given key merged into the metadata.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Tag with the producing node's iteration number.
    pub fn with_iteration(self, iteration: u32) -> Self {
        self.with_meta("iteration", Value::from(iteration))
    }

    /// Tag with the branch this envelope belongs to.
    pub fn with_branch(self, branch_id: &str) -> Self {
        self.with_meta("branch_id", Value::String(branch_id.to_string()))
    }

    pub fn with_trace(mut self, trace_id: &str) -> Self {
        self.trace_id = trace_id.to_string();
        self
    }

    pub fn error_message(&self) -> Option<&str> {
        self.meta.get("error").and_then(Value::as_str)
    }

    pub fn has_error(&self) -> bool {
        matches!(self.meta.get("error"), Some(v) if !v.is_null())
    }

    pub fn iteration(&self) -> Option<u32> {
        self.meta.get("iteration").and_then(Value::as_u64).map(|v| v as u32)
    }

    pub fn branch_id(&self) -> Option<&str> {
        self.meta.get("branch_id").and_then(Value::as_str)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.body, EnvelopeBody::Null)
    }

    /// Extract text, coercing object bodies through JSON encoding.
    pub fn as_text(&self) -> Result<String, EnvelopeError> {
        match &self.body {
            EnvelopeBody::Text(s) => Ok(s.clone()),
            EnvelopeBody::Null => Ok(String::new()),
            EnvelopeBody::Object(v) => Ok(v.to_string()),
            EnvelopeBody::Conversation(c) => Ok(c.last_message.clone().unwrap_or_default()),
            EnvelopeBody::Binary(_) => Err(EnvelopeError::Coercion {
                from: self.content_type,
                to: "text",
                reason: "binary payloads have no text form".to_string(),
            }),
        }
    }

    /// Extract a JSON value, coercing text bodies through JSON parsing.
    pub fn as_json(&self) -> Result<Value, EnvelopeError> {
        match &self.body {
            EnvelopeBody::Object(v) => Ok(v.clone()),
            EnvelopeBody::Null => Ok(Value::Null),
            EnvelopeBody::Text(s) => {
                serde_json::from_str(s).map_err(|e| EnvelopeError::Coercion {
                    from: self.content_type,
                    to: "json",
                    reason: format!("cannot parse text as JSON: {e}"),
                })
            }
            _ => Err(EnvelopeError::Coercion {
                from: self.content_type,
                to: "json",
                reason: "only raw_text and object envelopes convert to JSON".to_string(),
            }),
        }
    }

    /// Extract raw bytes. Text bodies encode as UTF-8.
    pub fn as_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        match &self.body {
            EnvelopeBody::Binary(b) => Ok(b.clone()),
            EnvelopeBody::Text(s) => Ok(s.as_bytes().to_vec()),
            EnvelopeBody::Null => Ok(Vec::new()),
            _ => Err(EnvelopeError::Coercion {
                from: self.content_type,
                to: "bytes",
                reason: "only binary and raw_text envelopes convert to bytes".to_string(),
            }),
        }
    }

    /// Extract conversation state. No cross-type coercion is defined.
    pub fn as_conversation(&self) -> Result<ConversationState, EnvelopeError> {
        match &self.body {
            EnvelopeBody::Conversation(c) => Ok(c.clone()),
            _ => Err(EnvelopeError::Coercion {
                from: self.content_type,
                to: "conversation",
                reason: "expected conversation_state".to_string(),
            }),
        }
    }

    /// Serialize for storage. The `envelope_format` discriminator is always
    /// present so deserialization can reject foreign shapes.
    pub fn serialize(&self) -> Value {
        let body = match &self.body {
            EnvelopeBody::Text(s) => Value::String(s.clone()),
            EnvelopeBody::Object(v) => v.clone(),
            EnvelopeBody::Conversation(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            EnvelopeBody::Binary(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
            EnvelopeBody::Null => Value::Null,
        };
        let mut map = Map::new();
        map.insert("envelope_format".to_string(), Value::Bool(true));
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert("trace_id".to_string(), Value::String(self.trace_id.clone()));
        map.insert("produced_by".to_string(), Value::String(self.produced_by.clone()));
        map.insert(
            "content_type".to_string(),
            Value::String(self.content_type.to_string()),
        );
        map.insert(
            "schema_id".to_string(),
            self.schema_id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        map.insert(
            "serialization_format".to_string(),
            self.serialization_format
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        map.insert("body".to_string(), body);
        map.insert(
            "meta".to_string(),
            Value::Object(self.meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
        Value::Object(map)
    }

    /// Reconstruct an envelope from its stored form.
    ///
    /// Rejects data without the `envelope_format` discriminator and data
    /// whose `content_type` is outside the closed set.
    pub fn deserialize(data: &Value) -> Result<Self, EnvelopeError> {
        let obj = data
            .as_object()
            .ok_or_else(|| EnvelopeError::Malformed("expected an object".to_string()))?;

        if !obj.get("envelope_format").and_then(Value::as_bool).unwrap_or(false) {
            return Err(EnvelopeError::MissingDiscriminator);
        }

        let content_type_str = obj
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("raw_text");
        let content_type = match content_type_str {
            "raw_text" => ContentType::RawText,
            "object" => ContentType::Object,
            "conversation_state" => ContentType::ConversationState,
            "binary" => ContentType::Binary,
            other => return Err(EnvelopeError::UnknownContentType(other.to_string())),
        };

        let raw_body = obj.get("body").cloned().unwrap_or(Value::Null);
        let body = if raw_body.is_null() {
            EnvelopeBody::Null
        } else {
            match content_type {
                ContentType::RawText => match raw_body {
                    Value::String(s) => EnvelopeBody::Text(s),
                    other => EnvelopeBody::Text(other.to_string()),
                },
                ContentType::Object => EnvelopeBody::Object(raw_body),
                ContentType::ConversationState => {
                    let state = serde_json::from_value(raw_body)
                        .map_err(|e| EnvelopeError::Malformed(format!("bad conversation body: {e}")))?;
                    EnvelopeBody::Conversation(state)
                }
                ContentType::Binary => {
                    let bytes = raw_body
                        .as_array()
                        .ok_or_else(|| {
                            EnvelopeError::Malformed("binary body must be a byte array".to_string())
                        })?
                        .iter()
                        .map(|v| {
                            v.as_u64()
                                .filter(|n| *n <= u8::MAX as u64)
                                .map(|n| n as u8)
                                .ok_or_else(|| {
                                    EnvelopeError::Malformed("binary body holds non-byte values".to_string())
                                })
                        })
                        .collect::<Result<Vec<u8>, _>>()?;
                    EnvelopeBody::Binary(bytes)
                }
            }
        };

        let meta = obj
            .get("meta")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(Self {
            id: obj
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            trace_id: obj
                .get("trace_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            produced_by: obj
                .get("produced_by")
                .and_then(Value::as_str)
                .unwrap_or("system")
                .to_string(),
            content_type,
            schema_id: obj.get("schema_id").and_then(Value::as_str).map(str::to_string),
            serialization_format: obj
                .get("serialization_format")
                .and_then(Value::as_str)
                .map(str::to_string),
            body,
            meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_envelope_coercions() {
        let env = Envelope::text("hello", "node-1");
        assert_eq!(env.content_type, ContentType::RawText);
        assert_eq!(env.as_text().unwrap(), "hello");
        assert_eq!(env.as_bytes().unwrap(), b"hello".to_vec());
        assert!(env.as_json().is_err());
        assert!(env.as_conversation().is_err());
    }

    #[test]
    fn test_text_envelope_parses_as_json_when_valid() {
        let env = Envelope::text(r#"{"a": 1}"#, "node-1");
        assert_eq!(env.as_json().unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_object_envelope_coercions() {
        let env = Envelope::json(json!({"x": 5}), "node-2");
        assert_eq!(env.as_json().unwrap(), json!({"x": 5}));
        assert_eq!(env.as_text().unwrap(), r#"{"x":5}"#);
        assert!(env.as_bytes().is_err());
    }

    #[test]
    fn test_binary_envelope_rejects_text() {
        let env = Envelope::binary(vec![1, 2, 3], "raw", "node-3");
        assert_eq!(env.as_bytes().unwrap(), vec![1, 2, 3]);
        assert!(env.as_text().is_err());
        assert!(env.as_json().is_err());
    }

    #[test]
    fn test_with_meta_returns_new_envelope() {
        let env = Envelope::text("x", "n");
        let tagged = env.clone().with_iteration(3).with_branch("condtrue");
        assert!(env.iteration().is_none());
        assert_eq!(tagged.iteration(), Some(3));
        assert_eq!(tagged.branch_id(), Some("condtrue"));
        // Body is unchanged.
        assert_eq!(tagged.as_text().unwrap(), "x");
    }

    #[test]
    fn test_error_envelope() {
        let env = Envelope::error("boom", "HandlerError", "n");
        assert!(env.has_error());
        assert_eq!(env.error_message(), Some("boom"));
        assert_eq!(env.meta.get("error_type"), Some(&json!("HandlerError")));
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut state = ConversationState::default();
        state.push("user", "hi");
        state.push("assistant", "hello");

        for env in [
            Envelope::text("payload", "a").with_trace("exec-1").with_iteration(2),
            Envelope::json(json!({"k": [1, 2]}), "b").with_trace("exec-1"),
            Envelope::conversation(state, "c"),
            Envelope::binary(vec![0, 255, 17], "msgpack", "d"),
        ] {
            let stored = env.serialize();
            let restored = Envelope::deserialize(&stored).unwrap();
            assert_eq!(restored.content_type, env.content_type);
            assert_eq!(restored.body, env.body);
            assert_eq!(restored.produced_by, env.produced_by);
            assert_eq!(restored.trace_id, env.trace_id);
            assert_eq!(restored.schema_id, env.schema_id);
            assert_eq!(restored.serialization_format, env.serialization_format);
            assert_eq!(restored.meta, env.meta);
        }
    }

    #[test]
    fn test_deserialize_rejects_missing_discriminator() {
        let data = json!({"id": "x", "content_type": "raw_text", "body": "hi"});
        assert!(matches!(
            Envelope::deserialize(&data),
            Err(EnvelopeError::MissingDiscriminator)
        ));
    }

    #[test]
    fn test_deserialize_rejects_unknown_content_type() {
        let data = json!({"envelope_format": true, "content_type": "hologram", "body": "hi"});
        assert!(matches!(
            Envelope::deserialize(&data),
            Err(EnvelopeError::UnknownContentType(t)) if t == "hologram"
        ));
    }

    #[test]
    fn test_null_envelope() {
        let env = Envelope::null("skipped-node");
        assert!(env.is_null());
        assert_eq!(env.as_text().unwrap(), "");
        assert_eq!(env.as_json().unwrap(), Value::Null);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn text_bodies_survive_storage(content in ".*") {
                let env = Envelope::text(content, "node").with_trace("exec");
                let back = Envelope::deserialize(&env.serialize()).unwrap();
                prop_assert_eq!(back.body, env.body);
                prop_assert_eq!(back.trace_id, env.trace_id);
            }

            #[test]
            fn binary_bodies_survive_storage(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let env = Envelope::binary(bytes.clone(), "raw", "node");
                let back = Envelope::deserialize(&env.serialize()).unwrap();
                prop_assert_eq!(back.as_bytes().unwrap(), bytes);
            }

            #[test]
            fn meta_tags_survive_storage(iteration in 0u32..10_000, branch in "[a-z]{1,12}") {
                let env = Envelope::text("x", "node")
                    .with_iteration(iteration)
                    .with_branch(&branch);
                let back = Envelope::deserialize(&env.serialize()).unwrap();
                prop_assert_eq!(back.iteration(), Some(iteration));
                prop_assert_eq!(back.branch_id(), Some(branch.as_str()));
            }
        }
    }
}
