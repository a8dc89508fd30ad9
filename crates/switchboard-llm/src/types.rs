use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Function,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
}

/// One entry of a conversation history, serialized as-is onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl Message {
    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(text.into()),
            name: None,
            function_call: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn function(name: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::text(Role::Function, result)
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// CompletionOptions
// ---------------------------------------------------------------------------

/// Per-call completion settings.
///
/// `model` is checked against the target provider's catalogue; an empty or
/// unknown model falls back to the provider default. Provider-specific
/// switches that have no dedicated field travel in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionOptions {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty_score: Option<f64>,
    /// DashScope web search augmentation; defaults to enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_search: Option<bool>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CompletionOptions {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub content: String,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub total_tokens: u64,
}

// ---------------------------------------------------------------------------
// Speech
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeechOptions {
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
}

// ---------------------------------------------------------------------------
// Chunk callback
// ---------------------------------------------------------------------------

/// Receives each streamed delta in arrival order. Returning `false` cancels
/// the stream; the rejected delta is not added to the result.
pub type ChunkFn<'a> = dyn FnMut(&str) -> bool + Send + 'a;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content_str(), "Hello");
        assert!(msg.is_user());

        let msg = Message::function("lookup", "{\"ok\":true}");
        assert_eq!(msg.role, Role::Function);
        assert_eq!(msg.name.as_deref(), Some("lookup"));
        assert!(!msg.is_user());
    }

    #[test]
    fn message_serializes_without_empty_fields() {
        let json = serde_json::to_value(Message::assistant("Hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "Hi"}));

        let msg = Message {
            role: Role::Assistant,
            content: None,
            name: None,
            function_call: Some(FunctionCall {
                name: "search".into(),
                arguments: "{\"q\":\"rust\"}".into(),
                thoughts: None,
            }),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(json["function_call"]["name"], "search");
        assert!(json["function_call"].get("thoughts").is_none());
    }

    #[test]
    fn role_serialization() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&Role::Function).unwrap(), "\"function\"");
        let role: Role = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(role, Role::System);
    }

    #[test]
    fn completion_options_keep_unknown_keys() {
        let opts: CompletionOptions = serde_json::from_str(
            r#"{"model":"qwen-plus","temperature":0.3,"top_p":0.8}"#,
        )
        .unwrap();
        assert_eq!(opts.model, "qwen-plus");
        assert_eq!(opts.temperature, Some(0.3));
        assert_eq!(opts.extra["top_p"], 0.8);
        assert!(opts.enable_search.is_none());
    }
}
