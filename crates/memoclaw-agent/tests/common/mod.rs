//! Scripted collaborators shared by the agent integration tests

#![allow(dead_code)]

use memoclaw_agent::*;
use memoclaw_core::config::ConsolidationTrigger;
use memoclaw_core::{Error, MemoclawConfig, Message, Result, SessionKey};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

// ===========================================================================
// Turn executors
// ===========================================================================

/// Replies `echo: <inbound>` after an optional delay, tracking concurrency.
#[derive(Default)]
pub struct EchoExecutor {
    pub delay: Duration,
    pub calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub seen: Mutex<Vec<String>>,
}

impl EchoExecutor {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TurnExecutor for EchoExecutor {
    async fn run_turn(&self, ctx: TurnContext, _cancel: CancellationToken) -> Result<TurnOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.seen.lock().unwrap().push(ctx.inbound.content.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(TurnOutput::reply(format!("echo: {}", ctx.inbound.content)))
    }
}

/// Blocks until released, so tests can hold a session busy.
pub struct GatedExecutor {
    pub entered: Notify,
    pub release: Semaphore,
}

impl GatedExecutor {
    pub fn new() -> Self {
        Self { entered: Notify::new(), release: Semaphore::new(0) }
    }
}

#[async_trait::async_trait]
impl TurnExecutor for GatedExecutor {
    async fn run_turn(&self, ctx: TurnContext, _cancel: CancellationToken) -> Result<TurnOutput> {
        self.entered.notify_one();
        let permit = self.release.acquire().await.map_err(|_| Error::turn("gate closed"))?;
        permit.forget();
        Ok(TurnOutput::reply(format!("done: {}", ctx.inbound.content)))
    }
}

/// Fails every turn the way a tool timing out would.
pub struct TimeoutExecutor;

#[async_trait::async_trait]
impl TurnExecutor for TimeoutExecutor {
    async fn run_turn(&self, _ctx: TurnContext, _cancel: CancellationToken) -> Result<TurnOutput> {
        Err(Error::timeout("tool call 'bash'", 30_000))
    }
}

/// Fails the way a tool adapter does when it `?`s a failed file read.
pub struct IoErrorExecutor;

#[async_trait::async_trait]
impl TurnExecutor for IoErrorExecutor {
    async fn run_turn(&self, _ctx: TurnContext, _cancel: CancellationToken) -> Result<TurnOutput> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "notes.txt: no such file",
        )))
    }
}

/// One tool round, then a final reply.
pub struct ToolRoundExecutor;

#[async_trait::async_trait]
impl TurnExecutor for ToolRoundExecutor {
    async fn run_turn(&self, ctx: TurnContext, _cancel: CancellationToken) -> Result<TurnOutput> {
        if ctx.iteration == 1 {
            Ok(TurnOutput::tool_round(vec![
                Message::tool_call("c1", "read", serde_json::json!({"path": "notes.txt"})),
                Message::tool_result("c1", "read", "buy milk", false),
            ]))
        } else {
            Ok(TurnOutput::reply("You need to buy milk."))
        }
    }
}

/// Never finishes on its own; honours cancellation only through the dispatcher.
pub struct HangingExecutor {
    pub entered: Notify,
}

#[async_trait::async_trait]
impl TurnExecutor for HangingExecutor {
    async fn run_turn(&self, _ctx: TurnContext, _cancel: CancellationToken) -> Result<TurnOutput> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Ok(TurnOutput::default())
    }
}

// ===========================================================================
// Summarizer
// ===========================================================================

/// Records every request; can be gated or told to fail.
#[derive(Default)]
pub struct RecordingSummarizer {
    pub requests: Mutex<Vec<(usize, usize, usize)>>,
    pub fail: AtomicBool,
    pub gate: Option<Arc<Semaphore>>,
    pub entered: Arc<Notify>,
}

impl RecordingSummarizer {
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Self { gate: Some(gate.clone()), ..Default::default() }, gate)
    }

    /// `(start, end, message count)` per request.
    pub fn requests(&self) -> Vec<(usize, usize, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Summarizer for RecordingSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<Consolidated> {
        self.requests.lock().unwrap().push((request.start, request.end, request.messages.len()));
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|_| Error::turn("gate closed"))?.forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::collaborator("summarizer", "model returned no tool call"));
        }
        let mut summary = request.current_summary.clone();
        if summary.is_empty() {
            summary.push_str("# Memory");
        }
        summary.push_str(&format!("\n- facts from {}..{}", request.start, request.end));
        Ok(Consolidated {
            summary,
            digest: request.conversation_lines().join(" | "),
        })
    }
}

// ===========================================================================
// Heartbeat
// ===========================================================================

pub struct FixedDecider {
    pub wake: bool,
    pub action: String,
    pub wake_calls: AtomicUsize,
    pub action_calls: AtomicUsize,
    pub last_instructions: Mutex<String>,
}

impl FixedDecider {
    pub fn new(wake: bool, action: &str) -> Self {
        Self {
            wake,
            action: action.to_string(),
            wake_calls: AtomicUsize::new(0),
            action_calls: AtomicUsize::new(0),
            last_instructions: Mutex::new(String::new()),
        }
    }
}

#[async_trait::async_trait]
impl WakeDecider for FixedDecider {
    async fn decide_wake(&self, ctx: &WakeContext) -> Result<bool> {
        self.wake_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_instructions.lock().unwrap() = ctx.instructions.clone();
        Ok(self.wake)
    }

    async fn decide_action(&self, _ctx: &WakeContext) -> Result<String> {
        self.action_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.action.clone())
    }
}

// ===========================================================================
// Kaizen
// ===========================================================================

/// Reports the same descriptions for every non-empty batch.
#[derive(Default)]
pub struct ListExtractor {
    pub descriptions: Mutex<Vec<String>>,
    pub batches: Mutex<Vec<usize>>,
}

impl ListExtractor {
    pub fn new(descriptions: &[&str]) -> Self {
        Self {
            descriptions: Mutex::new(descriptions.iter().map(|d| d.to_string()).collect()),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, descriptions: &[&str]) {
        *self.descriptions.lock().unwrap() = descriptions.iter().map(|d| d.to_string()).collect();
    }
}

#[async_trait::async_trait]
impl CandidateExtractor for ListExtractor {
    async fn extract_candidates(&self, entries: &[HistoryEntry]) -> Result<Vec<ObservedTask>> {
        self.batches.lock().unwrap().push(entries.len());
        Ok(self.descriptions.lock().unwrap().iter().map(ObservedTask::new).collect())
    }
}

/// Succeeds unless the candidate key is in `failing`.
#[derive(Default)]
pub struct RecordingMaterializer {
    pub failing: Mutex<HashSet<String>>,
    pub attempts: Mutex<Vec<String>>,
}

impl RecordingMaterializer {
    pub fn failing(keys: &[&str]) -> Self {
        Self {
            failing: Mutex::new(keys.iter().map(|k| k.to_string()).collect()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Materializer for RecordingMaterializer {
    async fn materialize(&self, candidate: &KaizenCandidate) -> Result<()> {
        self.attempts.lock().unwrap().push(candidate.key.clone());
        if self.failing.lock().unwrap().contains(&candidate.key) {
            return Err(Error::collaborator("skill generator", "could not write skill"));
        }
        Ok(())
    }
}

// ===========================================================================
// Harness
// ===========================================================================

/// Config with background loops off and consolidation only on demand.
pub fn quiet_config() -> MemoclawConfig {
    let mut config = MemoclawConfig::default();
    config.heartbeat.enabled = false;
    config.kaizen.enabled = false;
    config.consolidation.trigger = ConsolidationTrigger::Threshold;
    config.consolidation.threshold_messages = 10_000;
    config
}

pub struct Fakes {
    pub executor: Arc<dyn TurnExecutor>,
    pub summarizer: Arc<RecordingSummarizer>,
    pub decider: Arc<FixedDecider>,
    pub extractor: Arc<ListExtractor>,
    pub materializer: Arc<RecordingMaterializer>,
}

impl Fakes {
    pub fn with_executor(executor: Arc<dyn TurnExecutor>) -> Self {
        Self {
            executor,
            summarizer: Arc::new(RecordingSummarizer::default()),
            decider: Arc::new(FixedDecider::new(false, "")),
            extractor: Arc::new(ListExtractor::default()),
            materializer: Arc::new(RecordingMaterializer::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            executor: self.executor.clone(),
            summarizer: self.summarizer.clone(),
            decider: self.decider.clone(),
            extractor: self.extractor.clone(),
            materializer: Some(self.materializer.clone()),
        }
    }
}

pub fn runtime(workspace: &Path, config: MemoclawConfig, fakes: &Fakes) -> AgentRuntime {
    AgentRuntime::open(workspace, config, fakes.collaborators()).unwrap()
}

pub fn key(s: &str) -> SessionKey {
    SessionKey::new(s)
}
