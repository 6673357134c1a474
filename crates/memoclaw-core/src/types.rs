//! Core types for Memoclaw

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Session identifier - cheaply cloneable
///
/// Keys are conventionally `<channel>:<chat_id>`, e.g. `tg:42`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn from_parts(channel: &str, chat_id: &str) -> Self {
        Self::new(format!("{}:{}", channel, chat_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(channel, chat_id)`. Keys without a `:` belong to the `system` channel.
    pub fn parts(&self) -> (&str, &str) {
        match self.0.split_once(':') {
            Some((channel, chat_id)) => (channel, chat_id),
            None => ("system", &self.0),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for SessionKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Structured tool traffic attached to a message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolPayload {
    Call {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    Result {
        call_id: String,
        name: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Marks messages the dispatcher wrote on behalf of a turn that did not finish normally.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageMarker {
    Error,
    Incomplete,
}

/// A message in a conversation. Immutable once appended to a session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolPayload>,
    pub timestamp: DateTime<Utc>,
    /// Character count before truncation, when the content was cut.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<MessageMarker>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool: None,
            timestamp: Utc::now(),
            original_len: None,
            marker: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        let name = name.into();
        let mut msg = Self::with_role(Role::Assistant, format!("[tool:{}]", name));
        msg.tool = Some(ToolPayload::Call {
            id: id.into(),
            name,
            arguments,
        });
        msg
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool = Some(ToolPayload::Result {
            call_id: call_id.into(),
            name: name.into(),
            is_error,
        });
        msg
    }

    pub fn error_marker(content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.marker = Some(MessageMarker::Error);
        msg
    }

    pub fn incomplete_marker(content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.marker = Some(MessageMarker::Incomplete);
        msg
    }

    pub fn is_error(&self) -> bool {
        self.marker == Some(MessageMarker::Error)
    }

    pub fn is_truncated(&self) -> bool {
        self.original_len.is_some()
    }

    /// Cut the content to `max_chars` characters, appending an explicit marker
    /// with the original length. Content within the cap is returned untouched.
    pub fn truncated(mut self, max_chars: usize) -> Self {
        let total = self.content.chars().count();
        if total <= max_chars {
            return self;
        }
        let kept: String = self.content.chars().take(max_chars).collect();
        self.content = format!("{}...\n[truncated, {} total chars]", kept, total);
        self.original_len = Some(total);
        self
    }

    /// One-line rendering used in digests and prompts.
    pub fn render_line(&self) -> String {
        let tool = match &self.tool {
            Some(ToolPayload::Call { name, .. }) => format!(" [tool call: {}]", name),
            Some(ToolPayload::Result { name, is_error: true, .. }) => format!(" [tool error: {}]", name),
            Some(ToolPayload::Result { name, .. }) => format!(" [tool result: {}]", name),
            None => String::new(),
        };
        format!(
            "[{}] {}{}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M"),
            self.role.as_str().to_uppercase(),
            tool,
            self.content
        )
    }
}

/// Where an inbound event came from.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    User,
    Heartbeat,
    System,
}

/// An event arriving from a channel adapter (or synthesized by the runtime).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel: String,
    pub chat_id: String,
    #[serde(default)]
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub origin: Origin,
}

impl InboundEvent {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            sender_id: String::new(),
            content: content.into(),
            origin: Origin::User,
        }
    }

    /// Synthesize an event addressed to an existing session key.
    pub fn for_session(key: &SessionKey, content: impl Into<String>, origin: Origin) -> Self {
        let (channel, chat_id) = key.parts();
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: String::new(),
            content: content.into(),
            origin,
        }
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::from_parts(&self.channel, &self.chat_id)
    }

    /// Slash command (`/stop`, `/new`) if the content is one.
    pub fn command(&self) -> Option<&str> {
        let trimmed = self.content.trim();
        if trimmed.starts_with('/') && !trimmed.contains(char::is_whitespace) {
            Some(trimmed)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Reply,
    Error,
    Notice,
}

/// An event for a channel adapter to deliver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub kind: OutboundKind,
}

impl OutboundEvent {
    pub fn to_session(key: &SessionKey, content: impl Into<String>, kind: OutboundKind) -> Self {
        let (channel, chat_id) = key.parts();
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.into(),
            kind,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == OutboundKind::Error
    }
}
