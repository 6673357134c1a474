//! Collaborator boundary: the opaque external calls the runtime depends on
//!
//! Everything that talks to an LLM, a tool catalog, or a skill generator sits
//! behind one of these traits. The runtime only coordinates them.

use crate::kaizen::{Evidence, KaizenCandidate};
use crate::memory::HistoryEntry;
use chrono::{DateTime, Utc};
use memoclaw_core::{Message, Origin, Result, SessionKey};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Turn execution
// ---------------------------------------------------------------------------

/// Everything a turn executor sees for one round of a turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session: SessionKey,
    /// Full session log, ending with the inbound message and any earlier rounds of this turn.
    pub history: Vec<Message>,
    /// The message that started this turn.
    pub inbound: Message,
    /// Current long-term memory for the session's scope.
    pub memory: String,
    pub origin: Origin,
    /// 1-based round counter within the turn.
    pub iteration: usize,
}

/// Messages produced by one round. `done == false` means a tool round:
/// the executor wants to be called again with the results appended.
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    pub messages: Vec<Message>,
    pub done: bool,
}

impl TurnOutput {
    pub fn reply(text: impl Into<String>) -> Self {
        Self { messages: vec![Message::assistant(text)], done: true }
    }

    pub fn tool_round(messages: Vec<Message>) -> Self {
        Self { messages, done: false }
    }
}

/// Runs an LLM turn (with tools). Implementations own their own timeouts and
/// report them as `Error::Timeout`.
#[async_trait::async_trait]
pub trait TurnExecutor: Send + Sync {
    async fn run_turn(&self, ctx: TurnContext, cancel: CancellationToken) -> Result<TurnOutput>;
}

// ---------------------------------------------------------------------------
// Summarization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub session: SessionKey,
    pub current_summary: String,
    /// Exactly the messages `start..end` of the session log.
    pub messages: Vec<Message>,
    pub start: usize,
    pub end: usize,
}

impl SummaryRequest {
    /// Conversation lines in the form the summarizer prompt expects.
    pub fn conversation_lines(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(Message::render_line)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Consolidated {
    /// Full replacement for the long-term memory document.
    pub summary: String,
    /// History digest for exactly the summarized slice.
    pub digest: String,
}

#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> Result<Consolidated>;
}

// ---------------------------------------------------------------------------
// Heartbeat decisions
// ---------------------------------------------------------------------------

/// The low-context view handed to both heartbeat phases.
#[derive(Debug, Clone)]
pub struct WakeContext {
    pub session: SessionKey,
    pub recent: Vec<Message>,
    pub memory: String,
    /// Contents of HEARTBEAT.md, empty if absent.
    pub instructions: String,
    pub now: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait WakeDecider: Send + Sync {
    /// Phase 1: cheap yes/no gate.
    async fn decide_wake(&self, ctx: &WakeContext) -> Result<bool>;

    /// Phase 2: what to do. Only called after `decide_wake` said yes.
    async fn decide_action(&self, ctx: &WakeContext) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Kaizen
// ---------------------------------------------------------------------------

/// A repeatable task spotted in history.
#[derive(Debug, Clone)]
pub struct ObservedTask {
    pub description: String,
    /// Turns that showed the task. Empty means "the whole scanned batch".
    pub evidence: Vec<Evidence>,
}

impl ObservedTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self { description: description.into(), evidence: Vec::new() }
    }
}

#[async_trait::async_trait]
pub trait CandidateExtractor: Send + Sync {
    async fn extract_candidates(&self, entries: &[HistoryEntry]) -> Result<Vec<ObservedTask>>;
}

/// Turns a candidate into real automation (a skill, a script, a tool).
#[async_trait::async_trait]
pub trait Materializer: Send + Sync {
    async fn materialize(&self, candidate: &KaizenCandidate) -> Result<()>;
}
