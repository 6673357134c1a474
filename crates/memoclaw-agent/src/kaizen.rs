//! Kaizen loop: turns repeated work into automation
//!
//! A run scans history digests written since the last run, records each
//! repeatable task it finds as a candidate (deduplicated by normalized
//! description), ranks candidates by how often they were seen, and hands the
//! top few to a materializer. The ledger is saved after every step so a
//! crash mid-run loses at most the candidate being materialized.

use crate::collaborators::{CandidateExtractor, Materializer};
use crate::dispatcher::Dispatcher;
use crate::fatal::FatalSignal;
use crate::files;
use crate::memory::{HistoryEntry, MemoryStore};
use chrono::{DateTime, Utc};
use memoclaw_core::config::KaizenConfig;
use memoclaw_core::{Error, InboundEvent, Origin, Result, SessionKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const LEDGER_FILE: &str = "kaizen.json";
const NOTES_FILE: &str = "KAIZEN.md";
const LEDGER_VERSION: u32 = 1;

/// Session the dispatch-backed materializer works in.
pub const MATERIALIZE_SESSION: &str = "kaizen:materialize";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Proposed,
    /// Selected for materialization in a run that has not finished it yet.
    Promoted,
    Materialized,
    /// Materialization failed; the candidate stays eligible.
    RejectedTemporarily,
    /// Failed too often; excluded from dedup and selection.
    Rejected,
}

/// A conversation range that showed a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub session: SessionKey,
    pub start: usize,
    pub end: usize,
}

impl From<&HistoryEntry> for Evidence {
    fn from(entry: &HistoryEntry) -> Self {
        Self { session: entry.session.clone(), start: entry.start, end: entry.end }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KaizenCandidate {
    /// Normalized description; the dedup key.
    pub key: String,
    pub description: String,
    pub evidence: Vec<Evidence>,
    pub observations: u32,
    pub status: CandidateStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl KaizenCandidate {
    pub fn is_live(&self) -> bool {
        self.status != CandidateStatus::Rejected
    }

    pub fn is_selectable(&self) -> bool {
        matches!(
            self.status,
            CandidateStatus::Proposed | CandidateStatus::Promoted | CandidateStatus::RejectedTemporarily
        )
    }
}

/// Lowercased, punctuation-stripped, whitespace-collapsed description.
pub fn normalize_description(description: &str) -> String {
    description
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Durable Kaizen state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KaizenLedger {
    pub version: u32,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Per memory scope: number of history entries already scanned.
    #[serde(default)]
    pub cursors: BTreeMap<String, usize>,
    #[serde(default)]
    pub candidates: Vec<KaizenCandidate>,
}

impl Default for KaizenLedger {
    fn default() -> Self {
        Self { version: LEDGER_VERSION, last_run_at: None, cursors: BTreeMap::new(), candidates: Vec::new() }
    }
}

impl KaizenLedger {
    /// Load the ledger. A missing file is an empty ledger; an unreadable one
    /// is set aside and replaced with an empty ledger.
    pub fn load(path: &Path) -> Result<Self> {
        let text = files::read_or_empty(path)
            .map_err(|e| Error::storage(format!("cannot read {}: {}", path.display(), e)))?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str(&text) {
            Ok(ledger) => Ok(ledger),
            Err(e) => {
                let aside = path.with_extension(format!("corrupt.{}", files::file_stamp()));
                warn!("Unreadable Kaizen ledger {}: {}, moving it to {}", path.display(), e, aside.display());
                std::fs::rename(path, &aside)
                    .map_err(|e| Error::storage(format!("cannot move {}: {}", path.display(), e)))?;
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        files::write_atomic(path, &json).map_err(|e| Error::storage(format!("cannot write {}: {}", path.display(), e)))
    }

    pub fn get(&self, key: &str) -> Option<&KaizenCandidate> {
        self.candidates.iter().find(|c| c.key == key && c.is_live())
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut KaizenCandidate> {
        self.candidates.iter_mut().find(|c| c.key == key && c.is_live())
    }

    /// Record one sighting. Returns true if it created a new candidate.
    pub fn observe(&mut self, description: &str, evidence: &[Evidence], now: DateTime<Utc>) -> bool {
        let key = normalize_description(description);
        if let Some(existing) = self.get_mut(&key) {
            existing.observations += 1;
            existing.last_seen = now;
            for ev in evidence {
                if !existing.evidence.contains(ev) {
                    existing.evidence.push(ev.clone());
                }
            }
            return false;
        }
        self.candidates.push(KaizenCandidate {
            key,
            description: description.trim().to_string(),
            evidence: evidence.to_vec(),
            observations: 1,
            status: CandidateStatus::Proposed,
            first_seen: now,
            last_seen: now,
            attempts: 0,
            last_error: None,
        });
        true
    }

    /// Keys of the top `top_n` selectable candidates with at least
    /// `min_observations` sightings, most observed first, then most recent.
    pub fn select(&self, min_observations: u32, top_n: usize) -> Vec<String> {
        let mut eligible: Vec<&KaizenCandidate> = self
            .candidates
            .iter()
            .filter(|c| c.is_selectable() && c.observations >= min_observations)
            .collect();
        eligible.sort_by(|a, b| {
            b.observations
                .cmp(&a.observations)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        eligible.into_iter().take(top_n).map(|c| c.key.clone()).collect()
    }

    fn set_status(&mut self, key: &str, status: CandidateStatus) {
        if let Some(c) = self.get_mut(key) {
            c.status = status;
        }
    }

    /// Record a failed attempt; rejects the candidate once `max_attempts` is reached.
    fn record_failure(&mut self, key: &str, error: &str, max_attempts: u32) -> CandidateStatus {
        match self.get_mut(key) {
            Some(c) => {
                c.attempts += 1;
                c.last_error = Some(error.to_string());
                c.status = if c.attempts >= max_attempts {
                    CandidateStatus::Rejected
                } else {
                    CandidateStatus::RejectedTemporarily
                };
                c.status
            }
            None => CandidateStatus::Rejected,
        }
    }
}

/// What one run did.
#[derive(Debug, Clone, Default)]
pub struct KaizenReport {
    pub scanned_entries: usize,
    pub observations: usize,
    pub new_candidates: Vec<String>,
    pub materialized: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Another run was in progress; this call did nothing.
    AlreadyRunning,
    Completed(KaizenReport),
}

/// Clears the single-run flag on every exit path.
struct RunningReset<'a>(&'a AtomicBool);

impl Drop for RunningReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct KaizenLoop {
    memory: Arc<MemoryStore>,
    extractor: Arc<dyn CandidateExtractor>,
    materializer: Arc<dyn Materializer>,
    config: KaizenConfig,
    ledger_path: PathBuf,
    notes_path: PathBuf,
    running: AtomicBool,
    nudge: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    fatal: Arc<FatalSignal>,
}

impl KaizenLoop {
    pub fn new(
        memory: Arc<MemoryStore>,
        extractor: Arc<dyn CandidateExtractor>,
        materializer: Arc<dyn Materializer>,
        config: KaizenConfig,
        nudge: Arc<Notify>,
        fatal: Arc<FatalSignal>,
    ) -> Self {
        let ledger_path = memory.root().join(LEDGER_FILE);
        let notes_path = memory.root().join(NOTES_FILE);
        Self {
            memory,
            extractor,
            materializer,
            config,
            ledger_path,
            notes_path,
            running: AtomicBool::new(false),
            nudge,
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
            fatal,
        }
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    pub fn ledger(&self) -> Result<KaizenLedger> {
        KaizenLedger::load(&self.ledger_path)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether `interval` has passed since the last completed run.
    pub fn is_due(&self, now: DateTime<Utc>) -> Result<bool> {
        let ledger = self.ledger()?;
        Ok(match ledger.last_run_at {
            Some(last) => now.signed_duration_since(last).to_std().map(|d| d >= self.config.interval()).unwrap_or(false),
            None => true,
        })
    }

    /// Start the background loop: wake on the check interval or when a
    /// consolidation commits, and run if due. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("Kaizen loop already running");
            return;
        }
        let this = self.clone();
        info!(
            "Kaizen loop started (every {}s, checking every {}s)",
            self.config.interval_secs, self.config.check_interval_secs
        );
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = this.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(this.config.check_interval()) => {}
                    _ = this.nudge.notified() => debug!("Kaizen nudged by consolidation"),
                }
                match this.is_due(Utc::now()) {
                    Ok(true) => match this.run_once().await {
                        Ok(RunOutcome::Completed(report)) => debug!("Kaizen run: {:?}", report),
                        Ok(RunOutcome::AlreadyRunning) => {}
                        Err(e) => {
                            if !this.fatal.check("kaizen run", &e) {
                                warn!("Kaizen run failed: {}", e);
                            }
                        }
                    },
                    Ok(false) => {}
                    Err(e) => {
                        if !this.fatal.check("kaizen ledger", &e) {
                            warn!("Cannot read Kaizen ledger: {}", e);
                        }
                    }
                }
            }
            info!("Kaizen loop stopped");
        }));
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// One full scan-rank-materialize run. At most one runs at a time per process.
    pub async fn run_once(&self) -> Result<RunOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Kaizen run already in progress");
            return Ok(RunOutcome::AlreadyRunning);
        }
        let _reset = RunningReset(&self.running);

        let started = Utc::now();
        let mut ledger = self.ledger()?;
        let mut report = KaizenReport::default();

        self.scan(&mut ledger, &mut report, started).await?;
        self.append_notes(&ledger, &report.new_candidates, started)?;

        let selected = ledger.select(self.config.min_observations, self.config.top_n);
        for key in &selected {
            ledger.set_status(key, CandidateStatus::Promoted);
        }
        ledger.save(&self.ledger_path)?;

        for key in selected {
            let Some(candidate) = ledger.get(&key).cloned() else {
                continue;
            };
            info!("Kaizen: materializing '{}' ({} observations)", candidate.description, candidate.observations);
            match self.materializer.materialize(&candidate).await {
                Ok(()) => {
                    ledger.set_status(&key, CandidateStatus::Materialized);
                    report.materialized.push(key);
                }
                Err(e) => {
                    let status = ledger.record_failure(&key, &e.to_string(), self.config.max_attempts);
                    warn!("Kaizen: materializing '{}' failed ({:?}): {}", candidate.description, status, e);
                    report.failed.push(key);
                }
            }
            ledger.save(&self.ledger_path)?;
        }

        ledger.last_run_at = Some(started);
        ledger.save(&self.ledger_path)?;
        info!(
            "Kaizen run done: {} entries scanned, {} new, {} materialized, {} failed",
            report.scanned_entries,
            report.new_candidates.len(),
            report.materialized.len(),
            report.failed.len()
        );
        Ok(RunOutcome::Completed(report))
    }

    /// Feed unscanned history of every scope to the extractor.
    async fn scan(&self, ledger: &mut KaizenLedger, report: &mut KaizenReport, now: DateTime<Utc>) -> Result<()> {
        for scope in self.memory.scopes()? {
            let entries = self.memory.read_history(&scope)?;
            let cursor = ledger.cursors.get(&scope).copied().unwrap_or(0).min(entries.len());
            let fresh = &entries[cursor..];
            if fresh.is_empty() {
                continue;
            }

            let tasks = match self.extractor.extract_candidates(fresh).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!("Kaizen: scanning scope {} failed: {}", scope, e);
                    continue;
                }
            };
            let batch: Vec<Evidence> = fresh.iter().map(Evidence::from).collect();
            for task in tasks {
                if normalize_description(&task.description).is_empty() {
                    continue;
                }
                let evidence = if task.evidence.is_empty() { &batch } else { &task.evidence };
                report.observations += 1;
                if ledger.observe(&task.description, evidence, now) {
                    report.new_candidates.push(normalize_description(&task.description));
                }
            }
            report.scanned_entries += fresh.len();
            ledger.cursors.insert(scope, entries.len());
        }
        Ok(())
    }

    fn append_notes(&self, ledger: &KaizenLedger, new_keys: &[String], now: DateTime<Utc>) -> Result<()> {
        for key in new_keys {
            let Some(candidate) = ledger.get(key) else {
                continue;
            };
            let note = format!("- [{}] {}", now.format("%Y-%m-%d %H:%M"), candidate.description);
            files::append_line(&self.notes_path, &note)
                .map_err(|e| Error::storage(format!("cannot write {}: {}", self.notes_path.display(), e)))?;
        }
        Ok(())
    }
}

/// Materializes candidates by asking the agent itself, through the normal
/// dispatcher, in a dedicated session.
pub struct DispatchMaterializer {
    dispatcher: Arc<Dispatcher>,
    session: SessionKey,
}

impl DispatchMaterializer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher, session: SessionKey::new(MATERIALIZE_SESSION) }
    }
}

#[async_trait::async_trait]
impl Materializer for DispatchMaterializer {
    async fn materialize(&self, candidate: &KaizenCandidate) -> Result<()> {
        let content = format!(
            "[kaizen] This task came up {} times. Turn it into a reusable skill or script:\n{}",
            candidate.observations, candidate.description
        );
        let event = InboundEvent::for_session(&self.session, content, Origin::System);
        let outbound = self.dispatcher.handle(event).await?;
        match outbound.iter().find(|o| o.is_error()) {
            Some(err) => Err(Error::collaborator("materializer", err.content.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_case_and_punctuation() {
        assert_eq!(normalize_description("  Summarize  the Inbox! "), "summarize the inbox");
        assert_eq!(normalize_description("summarize-the inbox"), "summarize the inbox");
        assert_eq!(normalize_description("?!"), "");
    }

    #[test]
    fn rejected_candidates_do_not_absorb_sightings() {
        let mut ledger = KaizenLedger::default();
        let now = Utc::now();
        assert!(ledger.observe("Check calendar", &[], now));
        ledger.record_failure("check calendar", "boom", 1);
        assert!(ledger.observe("check calendar", &[], now));
        assert_eq!(ledger.candidates.len(), 2);
        assert_eq!(ledger.get("check calendar").map(|c| c.observations), Some(1));
    }
}
