//! Error types for Memoclaw

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("turn failed: {0}")]
    Turn(String),

    #[error("collaborator error: {name} - {message}")]
    Collaborator { name: String, message: String },

    #[error("timed out: {what} after {after_ms}ms")]
    Timeout { what: String, after_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn turn(message: impl Into<String>) -> Self {
        Self::Turn(message.into())
    }

    pub fn collaborator(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn timeout(what: impl Into<String>, after_ms: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            after_ms,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Storage failures are the only errors that should stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }

    /// Text suitable for showing to the person on the other end of the chat.
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout { what, .. } => format!("Sorry, {} took too long and was aborted.", what),
            Self::Cancelled => "The task was stopped.".to_string(),
            other => format!("Sorry, I encountered an error: {}", other),
        }
    }
}
