//! Fatal error latch shared by the runtime and its background loops
//!
//! Background work has no caller to return an error to. When storage fails
//! there, the error is raised here and `AgentRuntime::run_bus` returns it.

use memoclaw_core::Error;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Default)]
pub struct FatalSignal {
    token: CancellationToken,
    /// First fatal error raised, rendered with its context.
    first: Mutex<Option<String>>,
}

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fatal error. Later errors are logged but the first one is kept.
    pub fn raise(&self, context: &str, err: &Error) {
        let rendered = format!("{}: {}", context, err);
        error!("Fatal: {}", rendered);
        let mut first = self.first.lock().unwrap_or_else(|e| e.into_inner());
        if first.is_none() {
            *first = Some(rendered);
        }
        drop(first);
        self.token.cancel();
    }

    /// Raise `err` if it is fatal. Returns whether it was.
    pub fn check(&self, context: &str, err: &Error) -> bool {
        if err.is_fatal() {
            self.raise(context, err);
            true
        } else {
            false
        }
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a fatal error has been raised.
    pub async fn raised(&self) {
        self.token.cancelled().await
    }

    /// The first raised error, as a storage error.
    pub fn error(&self) -> Option<Error> {
        self.first
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .map(Error::Storage)
    }
}
