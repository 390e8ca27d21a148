//! Wire types shared by every capability client.

use std::fmt::{self, Formatter};

use serde::{Deserialize, Serialize};

/// High-level model API family served by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Chat,
    Completion,
    Embedding,
    Text2Image,
    Image2Text,
    Reranker,
    Plugin,
}

impl Capability {
    /// The `api-type` path segment used on the inference URL.
    pub fn api_type(&self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::Completion => "completions",
            Capability::Embedding => "embeddings",
            Capability::Text2Image => "text2image",
            Capability::Image2Text => "image2text",
            Capability::Reranker => "reranker",
            Capability::Plugin => "plugin",
        }
    }

    pub(crate) fn from_api_type(api_type: &str) -> Option<Self> {
        match api_type {
            "chat" => Some(Capability::Chat),
            "completions" => Some(Capability::Completion),
            "embeddings" => Some(Capability::Embedding),
            "text2image" => Some(Capability::Text2Image),
            "image2text" => Some(Capability::Image2Text),
            "reranker" => Some(Capability::Reranker),
            "plugin" => Some(Capability::Plugin),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_type())
    }
}

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the end user
    User,
    /// Message produced by the model
    Assistant,
    /// Result of executing a function call
    Function,
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Function name, required when `role` is [`Role::Function`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl Message {
    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), name: None, function_call: None }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), name: None, function_call: None }
    }

    /// Create a function-result message for a prior function call.
    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Function,
            content: content.into(),
            name: Some(name.into()),
            function_call: None,
        }
    }
}

/// A function invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
}

/// A function the model may call, declared on the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responses: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub examples: Option<serde_json::Value>,
}

/// Token accounting reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Web search citations attached to a chat response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchInfo {
    pub search_results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchResult {
    pub index: i64,
    pub url: String,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_api_type_round_trips() {
        for cap in [
            Capability::Chat,
            Capability::Completion,
            Capability::Embedding,
            Capability::Text2Image,
            Capability::Image2Text,
            Capability::Reranker,
            Capability::Plugin,
        ] {
            assert_eq!(Capability::from_api_type(cap.api_type()), Some(cap));
        }
        assert_eq!(Capability::from_api_type("wenxin"), None);
    }

    #[test]
    fn function_message_serializes_name() {
        let msg = Message::function("get_weather", r#"{"temp": 20}"#);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "function");
        assert_eq!(json["name"], "get_weather");
    }

    #[test]
    fn user_message_omits_optional_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(json.get("name").is_none());
        assert!(json.get("function_call").is_none());
    }
}
