//! OpenAI-compatible wire shapes.
//!
//! Requests are parsed leniently: the fields the gateway routes on are
//! typed, everything else (including `tools`) is preserved verbatim and
//! passed through to the agent untouched.

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::usage::{TokenUsage, estimate_tokens};

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: String, // "list"
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String, // "model"
    pub created: u64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Opaque tool definitions, passed through to the agent unchanged.
    #[serde(default)]
    pub tools: Option<serde_json::Value>,
    /// Provider-specific fields preserved for pass-through.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatMessage {
    /// Text view of the content for token estimation: plain strings and the
    /// `text` parts of multi-part content.
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        }
    }
}

impl ChatCompletionRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::invalid("model must not be empty", Some("model")));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::invalid(
                "messages must contain at least one entry",
                Some("messages"),
            ));
        }
        let last = self
            .messages
            .last()
            .expect("messages checked non-empty above");
        if !matches!(last.role.as_str(), "user" | "tool") {
            return Err(GatewayError::invalid(
                "the final message must come from 'user' or 'tool'",
                Some("messages"),
            ));
        }
        Ok(())
    }

    pub fn prompt_token_estimate(&self) -> u32 {
        self.messages
            .iter()
            .map(|m| estimate_tokens(&m.content_text()))
            .sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String, // "chat.completion"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChoice {
    pub index: usize,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
}

impl ChatCompletionResponse {
    pub fn assistant(
        id: String,
        created: u64,
        model: String,
        content: String,
        finish_reason: String,
        usage: TokenUsage,
    ) -> Self {
        Self {
            id,
            object: "chat.completion".to_owned(),
            created,
            model,
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_owned(),
                    content,
                },
                finish_reason,
            }],
            usage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String, // "chat.completion.chunk"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatCompletionChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunkChoice {
    pub index: usize,
    pub delta: ChatCompletionChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ChatCompletionChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    fn base(id: &str, created: u64, model: &str, choice: ChatCompletionChunkChoice) -> Self {
        Self {
            id: id.to_owned(),
            object: "chat.completion.chunk".to_owned(),
            created,
            model: model.to_owned(),
            choices: vec![choice],
        }
    }

    /// The opening chunk announcing the assistant role.
    pub fn role_opener(id: &str, created: u64, model: &str) -> Self {
        Self::base(id, created, model, ChatCompletionChunkChoice {
            index: 0,
            delta: ChatCompletionChunkDelta {
                role: Some("assistant".to_owned()),
                content: Some(String::new()),
            },
            finish_reason: None,
        })
    }

    pub fn content(id: &str, created: u64, model: &str, text: &str) -> Self {
        Self::base(id, created, model, ChatCompletionChunkChoice {
            index: 0,
            delta: ChatCompletionChunkDelta {
                role: None,
                content: Some(text.to_owned()),
            },
            finish_reason: None,
        })
    }

    pub fn finish(id: &str, created: u64, model: &str, reason: &str) -> Self {
        Self::base(id, created, model, ChatCompletionChunkChoice {
            index: 0,
            delta: ChatCompletionChunkDelta::default(),
            finish_reason: Some(reason.to_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn minimal_request_parses_and_validates() {
        let req = request(serde_json::json!({
            "model": "gpt-x",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(req.validate().is_ok());
        assert!(!req.stream);
    }

    #[test]
    fn unknown_fields_are_preserved_not_rejected() {
        let req = request(serde_json::json!({
            "model": "gpt-x",
            "messages": [{"role": "user", "content": "hi"}],
            "reasoning_effort": "high",
            "provider_options": {"cache": true}
        }));
        assert!(req.validate().is_ok());
        assert_eq!(req.extra["reasoning_effort"], "high");
        assert_eq!(req.extra["provider_options"]["cache"], true);
    }

    #[test]
    fn empty_messages_are_rejected() {
        let req = request(serde_json::json!({"model": "gpt-x", "messages": []}));
        assert!(matches!(
            req.validate(),
            Err(GatewayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn last_message_must_be_user_or_tool() {
        let req = request(serde_json::json!({
            "model": "gpt-x",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ]
        }));
        assert!(req.validate().is_err());

        let req = request(serde_json::json!({
            "model": "gpt-x",
            "messages": [{"role": "tool", "content": "result", "tool_call_id": "t1"}]
        }));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn multipart_content_contributes_to_estimate() {
        let req = request(serde_json::json!({
            "model": "gpt-x",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "describe this"},
                    {"type": "image_url", "image_url": {"url": "https://example.com/x.png"}}
                ]
            }]
        }));
        assert!(req.prompt_token_estimate() >= 2);
    }

    #[test]
    fn chunks_serialize_in_openai_shape() {
        let chunk = ChatCompletionChunk::finish("c1", 123, "gpt-x", "stop");
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert!(json["choices"][0]["delta"].get("content").is_none());
    }
}
