//! Long-term memory: MEMORY.md summaries and history digests
//!
//! Memory is grouped into scopes. With `MemoryScope::Session` every session
//! owns a scope; with `MemoryScope::Agent` all sessions share one, and
//! writers serialize on a per-scope async lock.

use crate::files;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use memoclaw_core::config::MemoryScope;
use memoclaw_core::{Error, Result, SessionKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

const SUMMARY_FILE: &str = "MEMORY.md";
const HISTORY_FILE: &str = "history.jsonl";
const AGENT_SCOPE: &str = "agent";

/// One consolidation pass, recorded in the scope's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub session: SessionKey,
    /// Creation time of the session log the range refers to. A `/new`
    /// starts a fresh log, so ranges are only comparable within one log.
    pub session_started: DateTime<Utc>,
    pub start: usize,
    pub end: usize,
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// Whether both entries start at the same offset of the same session log.
    pub fn covers_same_start(&self, other: &HistoryEntry) -> bool {
        self.session == other.session
            && self.session_started == other.session_started
            && self.start == other.start
    }
}

pub struct MemoryStore {
    root: PathBuf,
    scope: MemoryScope,
    writers: DashMap<String, Arc<Mutex<()>>>,
}

impl MemoryStore {
    pub fn open(workspace: &Path, scope: MemoryScope) -> Result<Self> {
        let root = files::memory_dir(workspace);
        fs::create_dir_all(&root)
            .map_err(|e| Error::storage(format!("cannot create {}: {}", root.display(), e)))?;
        Ok(Self { root, scope, writers: DashMap::new() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scope name that holds memory for `key`.
    pub fn scope_for(&self, key: &SessionKey) -> String {
        match self.scope {
            MemoryScope::Session => files::encode_name(key.as_str()),
            MemoryScope::Agent => AGENT_SCOPE.to_string(),
        }
    }

    fn scope_dir(&self, scope: &str) -> PathBuf {
        self.root.join(scope)
    }

    /// Serialize writers of one scope.
    pub async fn lock_scope(&self, scope: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .writers
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn read_summary(&self, scope: &str) -> Result<String> {
        let path = self.scope_dir(scope).join(SUMMARY_FILE);
        files::read_or_empty(&path).map_err(|e| Error::storage(format!("cannot read {}: {}", path.display(), e)))
    }

    pub fn write_summary(&self, scope: &str, summary: &str) -> Result<()> {
        let path = self.scope_dir(scope).join(SUMMARY_FILE);
        files::write_atomic(&path, summary)
            .map_err(|e| Error::storage(format!("cannot write {}: {}", path.display(), e)))?;
        debug!("Wrote {} chars to {}", summary.chars().count(), path.display());
        Ok(())
    }

    pub fn append_history(&self, scope: &str, entry: &HistoryEntry) -> Result<()> {
        let path = self.scope_dir(scope).join(HISTORY_FILE);
        let line = serde_json::to_string(entry)?;
        files::append_line(&path, &line)
            .map_err(|e| Error::storage(format!("cannot append to {}: {}", path.display(), e)))
    }

    /// Record a consolidation pass. An entry left by an earlier failed attempt
    /// at the same range (same log, same start) is replaced, so ranges in the
    /// history never overlap.
    pub fn record_history(&self, scope: &str, entry: &HistoryEntry) -> Result<()> {
        let path = self.scope_dir(scope).join(HISTORY_FILE);
        let text = files::read_or_empty(&path)
            .map_err(|e| Error::storage(format!("cannot read {}: {}", path.display(), e)))?;
        let mut lines: Vec<String> = text.lines().map(String::from).collect();
        let stale = lines.iter().rposition(|line| {
            serde_json::from_str::<HistoryEntry>(line)
                .map(|old| old.covers_same_start(entry))
                .unwrap_or(false)
        });
        let Some(index) = stale else {
            return self.append_history(scope, entry);
        };

        warn!("Replacing history entry from {} for {} left by a failed pass", entry.start, entry.session);
        lines[index] = serde_json::to_string(entry)?;
        let mut contents = lines.join("\n");
        contents.push('\n');
        files::write_atomic(&path, &contents)
            .map_err(|e| Error::storage(format!("cannot write {}: {}", path.display(), e)))
    }

    /// All history entries for a scope, oldest first. Malformed lines are skipped.
    pub fn read_history(&self, scope: &str) -> Result<Vec<HistoryEntry>> {
        let path = self.scope_dir(scope).join(HISTORY_FILE);
        let text = files::read_or_empty(&path)
            .map_err(|e| Error::storage(format!("cannot read {}: {}", path.display(), e)))?;
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping malformed history {}:{}: {}", path.display(), lineno + 1, e),
            }
        }
        Ok(entries)
    }

    /// Every scope that has a memory directory.
    pub fn scopes(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::storage(format!("cannot list {}: {}", self.root.display(), e)))?;
        let mut scopes: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        scopes.sort();
        Ok(scopes)
    }

    /// Memory section injected into a turn's context.
    pub fn memory_context(&self, key: &SessionKey) -> String {
        match self.read_summary(&self.scope_for(key)) {
            Ok(summary) if !summary.trim().is_empty() => format!("## Long-term Memory\n{}", summary),
            Ok(_) => String::new(),
            Err(e) => {
                warn!("Memory unavailable for {}: {}", key, e);
                String::new()
            }
        }
    }
}

/// Keep a summary under `max_chars` by dropping its oldest facts first.
///
/// Headings are kept; body lines go from the top of the document down.
/// If headings alone are still too long the text is cut.
pub fn bound_summary(summary: &str, max_chars: usize) -> String {
    if summary.chars().count() <= max_chars {
        return summary.to_string();
    }

    let mut lines: Vec<&str> = summary.lines().collect();
    let mut total: usize = lines.iter().map(|l| l.chars().count() + 1).sum();
    let mut i = 0;
    while total > max_chars && i < lines.len() {
        let line = lines[i];
        if line.trim_start().starts_with('#') {
            i += 1;
            continue;
        }
        total -= line.chars().count() + 1;
        lines.remove(i);
    }

    let mut bounded = lines.join("\n");
    if bounded.chars().count() > max_chars {
        bounded = bounded.chars().take(max_chars).collect();
    }
    bounded
}
