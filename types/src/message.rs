//! Conversation message model.
//!
//! A `Message` is one turn of the chat-completion conversation. User,
//! assistant and tool turns may carry [`TurnTags`] recording which thread
//! and scene produced them; the tags never leave the process (see
//! [`Message::to_wire`]).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Origin of a conversation turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnTags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_index: Option<u32>,
}

impl TurnTags {
    #[must_use]
    pub const fn new(thread_id: ThreadId, scene_index: u32) -> Self {
        Self {
            thread_id: Some(thread_id),
            scene_index: Some(scene_index),
        }
    }
}

/// A function call requested by the assistant. `arguments` is the raw
/// JSON string exactly as the backend sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    fn to_wire(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": { "name": self.name, "arguments": self.arguments },
        })
    }

    fn from_wire(value: &Value) -> Result<Self, WireError> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or(WireError::MissingField("tool_calls[].id"))?;
        let function = value
            .get("function")
            .ok_or(WireError::MissingField("tool_calls[].function"))?;
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .ok_or(WireError::MissingField("tool_calls[].function.name"))?;
        let arguments = match function.get("arguments") {
            Some(Value::String(raw)) => raw.clone(),
            Some(Value::Null) | None => String::from("{}"),
            Some(other) => other.to_string(),
        };
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: String,
    #[serde(flatten)]
    pub tags: TurnTags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(flatten)]
    pub tags: TurnTags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMessage {
    pub content: String,
    pub tool_call_id: String,
    #[serde(flatten)]
    pub tags: TurnTags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System(SystemMessage),
    User(UserMessage),
    Assistant(AssistantMessage),
    Tool(ToolMessage),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown role `{0}`")]
    UnknownRole(String),
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::System(SystemMessage {
            content: content.into(),
        })
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::User(UserMessage {
            content: content.into(),
            tags: TurnTags::default(),
        })
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant(AssistantMessage {
            content: content.into(),
            tool_calls: Vec::new(),
            tags: TurnTags::default(),
        })
    }

    #[must_use]
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant(AssistantMessage {
            content: content.into(),
            tool_calls,
            tags: TurnTags::default(),
        })
    }

    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool(ToolMessage {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            tags: TurnTags::default(),
        })
    }

    /// Attach origin tags. System messages carry no tags and are returned as is.
    #[must_use]
    pub fn tagged(mut self, tags: TurnTags) -> Self {
        match &mut self {
            Message::System(_) => {}
            Message::User(m) => m.tags = tags,
            Message::Assistant(m) => m.tags = tags,
            Message::Tool(m) => m.tags = tags,
        }
        self
    }

    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Message::System(_) => Role::System,
            Message::User(_) => Role::User,
            Message::Assistant(_) => Role::Assistant,
            Message::Tool(_) => Role::Tool,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Message::System(m) => &m.content,
            Message::User(m) => &m.content,
            Message::Assistant(m) => &m.content,
            Message::Tool(m) => &m.content,
        }
    }

    pub fn set_content(&mut self, content: String) {
        match self {
            Message::System(m) => m.content = content,
            Message::User(m) => m.content = content,
            Message::Assistant(m) => m.content = content,
            Message::Tool(m) => m.content = content,
        }
    }

    #[must_use]
    pub fn tags(&self) -> TurnTags {
        match self {
            Message::System(_) => TurnTags::default(),
            Message::User(m) => m.tags,
            Message::Assistant(m) => m.tags,
            Message::Tool(m) => m.tags,
        }
    }

    #[must_use]
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.tags().thread_id
    }

    #[must_use]
    pub fn scene_index(&self) -> Option<u32> {
        self.tags().scene_index
    }

    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Assistant(m) => &m.tool_calls,
            _ => &[],
        }
    }

    /// Chat-completions wire form. Origin tags are stripped.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Message::System(m) => json!({ "role": "system", "content": m.content }),
            Message::User(m) => json!({ "role": "user", "content": m.content }),
            Message::Assistant(m) => {
                let mut value = json!({ "role": "assistant", "content": m.content });
                if !m.tool_calls.is_empty() {
                    value["tool_calls"] =
                        Value::Array(m.tool_calls.iter().map(ToolCall::to_wire).collect());
                }
                value
            }
            Message::Tool(m) => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id,
                "content": m.content,
            }),
        }
    }

    /// Parse a chat-completions wire message. `content: null` reads as empty.
    pub fn from_wire(value: &Value) -> Result<Self, WireError> {
        let object = value.as_object().ok_or(WireError::NotAnObject)?;
        let role = object
            .get("role")
            .and_then(Value::as_str)
            .ok_or(WireError::MissingField("role"))?;
        let content = object
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match role {
            "system" => Ok(Self::system(content)),
            "user" => Ok(Self::user(content)),
            "assistant" => {
                let tool_calls = match object.get("tool_calls") {
                    Some(Value::Array(calls)) => calls
                        .iter()
                        .map(ToolCall::from_wire)
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => Vec::new(),
                };
                Ok(Self::assistant_with_tools(content, tool_calls))
            }
            "tool" => {
                let tool_call_id = object
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .ok_or(WireError::MissingField("tool_call_id"))?;
                Ok(Self::tool(tool_call_id, content))
            }
            other => Err(WireError::UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Message, Role, ToolCall, TurnTags, WireError};
    use crate::ThreadId;
    use serde_json::json;

    #[test]
    fn tagged_turn_serde_round_trip() {
        let msg = Message::user("scene text").tagged(TurnTags::new(ThreadId::new(7), 3));
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["role"], "user");
        assert_eq!(encoded["thread_id"], 7);
        assert_eq!(encoded["scene_index"], 3);

        let decoded: Message = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.thread_id(), Some(ThreadId::new(7)));
    }

    #[test]
    fn untagged_turn_omits_tags() {
        let encoded = serde_json::to_value(Message::assistant("ok")).unwrap();
        assert!(encoded.get("thread_id").is_none());
        assert!(encoded.get("tool_calls").is_none());
    }

    #[test]
    fn wire_form_strips_tags() {
        let msg = Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                name: "glossary_search".into(),
                arguments: r#"{"query":"wyrm"}"#.into(),
            }],
        )
        .tagged(TurnTags::new(ThreadId::new(1), 0));
        let wire = msg.to_wire();
        assert!(wire.get("thread_id").is_none());
        assert!(wire.get("scene_index").is_none());
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "glossary_search");
    }

    #[test]
    fn from_wire_parses_tool_calls() {
        let value = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "c1",
                "type": "function",
                "function": {"name": "create_entry", "arguments": "{}"}
            }]
        });
        let msg = Message::from_wire(&value).unwrap();
        assert_eq!(msg.role(), Role::Assistant);
        assert_eq!(msg.content(), "");
        assert_eq!(msg.tool_calls()[0].name, "create_entry");
    }

    #[test]
    fn from_wire_rejects_unknown_role() {
        let err = Message::from_wire(&json!({"role": "narrator", "content": "x"})).unwrap_err();
        assert_eq!(err, WireError::UnknownRole("narrator".into()));
    }

    #[test]
    fn system_ignores_tags() {
        let msg = Message::system("sys").tagged(TurnTags::new(ThreadId::new(1), 1));
        assert_eq!(msg.thread_id(), None);
    }
}
