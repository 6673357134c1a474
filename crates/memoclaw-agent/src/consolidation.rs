//! Consolidation engine: folds settled history into long-term memory
//!
//! A pass copies the session's messages and watermark before it first
//! suspends, summarizes exactly that slice, and commits the watermark only
//! after the summary and history digest are durable. Messages appended while
//! the summarizer runs stay above the watermark for the next pass.

use crate::collaborators::{SummaryRequest, Summarizer};
use crate::fatal::FatalSignal;
use crate::locks::SessionLocks;
use crate::memory::{bound_summary, HistoryEntry, MemoryStore};
use crate::store::SessionStore;
use chrono::Utc;
use memoclaw_core::config::{ConsolidationConfig, ConsolidationTrigger};
use memoclaw_core::{Result, SessionKey};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidationMode {
    /// Everything above the watermark except the `keep_recent` newest messages.
    Incremental,
    /// Everything above the watermark. Used before `/new` clears a session.
    ArchiveAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Messages `start..end` are now in memory; the watermark is `end`.
    Committed { start: usize, end: usize },
    /// No unconsolidated messages in range.
    NothingToDo,
    /// Another pass for the session is in flight; this one did nothing.
    AlreadyRunning,
}

pub struct Consolidator {
    store: Arc<SessionStore>,
    memory: Arc<MemoryStore>,
    summarizer: Arc<dyn Summarizer>,
    config: ConsolidationConfig,
    /// One in-flight pass per session.
    in_flight: SessionLocks,
    /// Signalled after every committed pass.
    committed: Arc<Notify>,
    fatal: Arc<FatalSignal>,
}

impl Consolidator {
    pub fn new(
        store: Arc<SessionStore>,
        memory: Arc<MemoryStore>,
        summarizer: Arc<dyn Summarizer>,
        config: ConsolidationConfig,
        fatal: Arc<FatalSignal>,
    ) -> Self {
        Self {
            store,
            memory,
            summarizer,
            config,
            in_flight: SessionLocks::default(),
            committed: Arc::new(Notify::new()),
            fatal,
        }
    }

    /// Notified whenever a pass commits; the Kaizen loop listens on it.
    pub fn committed_signal(&self) -> Arc<Notify> {
        self.committed.clone()
    }

    pub fn is_running(&self, key: &SessionKey) -> bool {
        self.in_flight.is_locked(key)
    }

    /// Whether the trigger policy wants a pass for `key` now.
    pub fn should_consolidate(&self, key: &SessionKey) -> bool {
        let pending = self.store.pending(key);
        match self.config.trigger {
            ConsolidationTrigger::EveryTurn => pending > self.config.keep_recent,
            ConsolidationTrigger::Threshold => {
                pending >= self.config.threshold_messages && pending > self.config.keep_recent
            }
        }
    }

    /// Schedule a background pass if the trigger policy calls for one.
    pub fn maybe_schedule(self: &Arc<Self>, key: &SessionKey) -> Option<JoinHandle<()>> {
        if self.should_consolidate(key) {
            Some(self.schedule(key))
        } else {
            None
        }
    }

    /// Run an incremental pass in the background. Failures leave the
    /// watermark where it was; storage failures are raised as fatal.
    pub fn schedule(self: &Arc<Self>, key: &SessionKey) -> JoinHandle<()> {
        let this = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            match this.consolidate(&key, ConsolidationMode::Incremental).await {
                Ok(outcome) => debug!("Consolidation for {}: {:?}", key, outcome),
                Err(e) => {
                    if !this.fatal.check(&format!("consolidation of {}", key), &e) {
                        warn!("Memory consolidation failed for {}: {}", key, e);
                    }
                }
            }
        })
    }

    /// Run one pass. An incremental pass is a no-op while another pass for the
    /// same session is in flight; an archive-all pass waits for it instead.
    pub async fn consolidate(&self, key: &SessionKey, mode: ConsolidationMode) -> Result<PassOutcome> {
        let _in_flight = match mode {
            ConsolidationMode::Incremental => match self.in_flight.try_acquire(key) {
                Some(guard) => guard,
                None => {
                    debug!("Consolidation for {} already in flight, skipping", key);
                    return Ok(PassOutcome::AlreadyRunning);
                }
            },
            ConsolidationMode::ArchiveAll => self.in_flight.acquire(key).await,
        };
        self.run_pass(key, mode).await
    }

    /// Archive everything into memory, then start a fresh log for `key`.
    /// Nothing is cleared if archiving fails. Callers must hold the session lock.
    pub async fn archive_and_reset(&self, key: &SessionKey) -> Result<PassOutcome> {
        let _in_flight = self.in_flight.acquire(key).await;
        let outcome = self.run_pass(key, ConsolidationMode::ArchiveAll).await?;
        self.store.rotate(key)?;
        Ok(outcome)
    }

    async fn run_pass(&self, key: &SessionKey, mode: ConsolidationMode) -> Result<PassOutcome> {
        // Slice boundaries are fixed here, before the first await.
        let snapshot = self.store.snapshot(key)?;
        let start = snapshot.watermark;
        let end = match mode {
            ConsolidationMode::Incremental => snapshot.end().saturating_sub(self.config.keep_recent),
            ConsolidationMode::ArchiveAll => snapshot.end(),
        };
        if end <= start {
            return Ok(PassOutcome::NothingToDo);
        }

        let scope = self.memory.scope_for(key);
        let _writer = self.memory.lock_scope(&scope).await;
        let current_summary = self.memory.read_summary(&scope)?;

        info!("Consolidating {} messages {}..{} into scope {}", key, start, end, scope);
        let request = SummaryRequest {
            session: key.clone(),
            current_summary: current_summary.clone(),
            messages: snapshot.messages[start..end].to_vec(),
            start,
            end,
        };
        let consolidated = self.summarizer.summarize(&request).await?;

        let entry = HistoryEntry {
            session: key.clone(),
            session_started: snapshot.created_at,
            start,
            end,
            digest: consolidated.digest,
            created_at: Utc::now(),
        };
        self.memory.record_history(&scope, &entry)?;

        if !consolidated.summary.trim().is_empty() {
            let summary = bound_summary(&consolidated.summary, self.config.summary_max_chars);
            if summary != current_summary {
                self.memory.write_summary(&scope, &summary)?;
            }
        }

        self.store.commit_watermark(key, start, end)?;
        self.committed.notify_one();
        info!("Consolidation for {} done, watermark {}", key, end);
        Ok(PassOutcome::Committed { start, end })
    }
}
