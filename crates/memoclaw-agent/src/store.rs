//! Session store: durable, append-only message logs
//!
//! Each session is a JSONL file plus a small metadata sidecar holding the
//! consolidation watermark. The in-memory copy is guarded by a std RwLock so
//! snapshots can be taken without an await point.

use crate::files;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use memoclaw_core::{Error, Message, Result, SessionKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// A conversation: an ordered message log plus its consolidation watermark.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Messages before this index are already folded into memory.
    pub last_consolidated: usize,
    messages: Vec<Message>,
}

impl Session {
    fn new(key: SessionKey) -> Self {
        let now = Utc::now();
        Self { key, created_at: now, last_activity: now, last_consolidated: 0, messages: Vec::new() }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages not yet folded into memory.
    pub fn pending(&self) -> usize {
        self.messages.len().saturating_sub(self.last_consolidated)
    }
}

/// A point-in-time copy of a session, taken without suspending.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub watermark: usize,
    pub messages: Vec<Message>,
}

impl SessionSnapshot {
    /// Index one past the last message in the snapshot.
    pub fn end(&self) -> usize {
        self.messages.len()
    }

    pub fn tail(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }
}

/// On-disk sidecar for one session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMeta {
    key: SessionKey,
    created_at: DateTime<Utc>,
    #[serde(default)]
    last_consolidated: usize,
}

type Handle = Arc<RwLock<Session>>;

pub struct SessionStore {
    root: PathBuf,
    max_message_chars: usize,
    sessions: DashMap<SessionKey, Handle>,
}

fn read_guard(handle: &Handle) -> RwLockReadGuard<'_, Session> {
    handle.read().unwrap_or_else(|e| e.into_inner())
}

fn write_guard(handle: &Handle) -> RwLockWriteGuard<'_, Session> {
    handle.write().unwrap_or_else(|e| e.into_inner())
}

impl SessionStore {
    /// Open (creating if needed) the session directory under `workspace`.
    /// An unwritable directory is a fatal error.
    pub fn open(workspace: &Path, max_message_chars: usize) -> Result<Self> {
        let root = files::sessions_dir(workspace);
        fs::create_dir_all(&root)
            .map_err(|e| Error::storage(format!("cannot create {}: {}", root.display(), e)))?;
        debug!("Session store at {}", root.display());
        Ok(Self { root, max_message_chars, sessions: DashMap::new() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, key: &SessionKey) -> PathBuf {
        self.root.join(format!("{}.jsonl", files::encode_name(key.as_str())))
    }

    fn meta_path(&self, key: &SessionKey) -> PathBuf {
        self.root.join(format!("{}.meta.json", files::encode_name(key.as_str())))
    }

    fn write_meta(&self, session: &Session) -> Result<()> {
        let meta = SessionMeta {
            key: session.key.clone(),
            created_at: session.created_at,
            last_consolidated: session.last_consolidated,
        };
        let json = serde_json::to_string_pretty(&meta)?;
        files::write_atomic(&self.meta_path(&session.key), &json)
            .map_err(|e| Error::storage(format!("cannot write metadata for {}: {}", session.key, e)))
    }

    /// Whether a log exists for `key`, in memory or on disk.
    pub fn exists(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key) || self.log_path(key).exists() || self.meta_path(key).exists()
    }

    /// Get the session, replaying it from disk or creating it on first use.
    /// Concurrent callers for the same key always end up with one handle.
    pub fn load_or_create(&self, key: &SessionKey) -> Result<Handle> {
        if let Some(handle) = self.sessions.get(key) {
            return Ok(handle.clone());
        }

        let session = if self.exists(key) {
            self.load_from_disk(key)?
        } else {
            let session = Session::new(key.clone());
            self.write_meta(&session)?;
            info!("Session {} created", key);
            session
        };

        Ok(self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(session)))
            .clone())
    }

    fn load_from_disk(&self, key: &SessionKey) -> Result<Session> {
        let messages = self.replay(key)?;
        let meta = match files::read_or_empty(&self.meta_path(key)) {
            Ok(text) if !text.trim().is_empty() => match serde_json::from_str::<SessionMeta>(&text) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!("Unreadable metadata for {}: {}, starting watermark at 0", key, e);
                    None
                }
            },
            Ok(_) => None,
            Err(e) => return Err(Error::storage(format!("cannot read metadata for {}: {}", key, e))),
        };

        let created_at = meta
            .as_ref()
            .map(|m| m.created_at)
            .or_else(|| messages.first().map(|m| m.timestamp))
            .unwrap_or_else(Utc::now);
        let mut last_consolidated = meta.map(|m| m.last_consolidated).unwrap_or(0);
        if last_consolidated > messages.len() {
            warn!(
                "Watermark {} for {} is past the end of its log ({}), clamping",
                last_consolidated,
                key,
                messages.len()
            );
            last_consolidated = messages.len();
        }
        let last_activity = messages.last().map(|m| m.timestamp).unwrap_or(created_at);

        info!("Session {} resumed ({} messages, watermark {})", key, messages.len(), last_consolidated);
        Ok(Session { key: key.clone(), created_at, last_activity, last_consolidated, messages })
    }

    /// Read a session's log from disk. Malformed lines are skipped with a warning.
    pub fn replay(&self, key: &SessionKey) -> Result<Vec<Message>> {
        let path = self.log_path(key);
        let text = files::read_or_empty(&path)
            .map_err(|e| Error::storage(format!("cannot read {}: {}", path.display(), e)))?;
        let mut messages = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping malformed record {}:{}: {}", path.display(), lineno + 1, e),
            }
        }
        Ok(messages)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.get(key).map(|h| {
            let session = read_guard(&h);
            session.clone()
        })
    }

    /// Append a message, truncating oversized content. The record is on disk
    /// before it becomes visible in memory. Callers must hold the session lock.
    pub fn append(&self, key: &SessionKey, message: Message) -> Result<Message> {
        let handle = self.load_or_create(key)?;
        let message = message.truncated(self.max_message_chars);
        if message.is_truncated() {
            debug!("Truncated {} message in {} ({:?} chars)", message.role.as_str(), key, message.original_len);
        }
        let line = serde_json::to_string(&message)?;

        // The session lock already orders writers; the in-memory guard is
        // only taken once the record is durable so snapshots never wait on disk.
        files::append_line(&self.log_path(key), &line)
            .map_err(|e| Error::storage(format!("cannot append to {}: {}", key, e)))?;
        let mut session = write_guard(&handle);
        session.last_activity = message.timestamp;
        session.messages.push(message.clone());
        Ok(message)
    }

    /// Copy the session's messages and watermark in one synchronous step.
    pub fn snapshot(&self, key: &SessionKey) -> Result<SessionSnapshot> {
        let handle = self.load_or_create(key)?;
        let session = read_guard(&handle);
        Ok(SessionSnapshot {
            key: key.clone(),
            created_at: session.created_at,
            watermark: session.last_consolidated,
            messages: session.messages.clone(),
        })
    }

    /// Last `n` messages of a session, without creating it if it does not exist.
    pub fn tail(&self, key: &SessionKey, n: usize) -> Result<Vec<Message>> {
        if !self.exists(key) {
            return Ok(Vec::new());
        }
        Ok(self.snapshot(key)?.tail(n).to_vec())
    }

    /// Unconsolidated message count; zero for unknown sessions.
    pub fn pending(&self, key: &SessionKey) -> usize {
        match self.sessions.get(key) {
            Some(handle) => read_guard(&handle).pending(),
            None => 0,
        }
    }

    /// Advance the watermark from `expected_start` to `end`. Fails if another
    /// pass moved it first or if `end` is out of range, leaving it untouched.
    pub fn commit_watermark(&self, key: &SessionKey, expected_start: usize, end: usize) -> Result<()> {
        let handle = self.load_or_create(key)?;
        let mut session = write_guard(&handle);
        if session.last_consolidated != expected_start {
            return Err(Error::storage(format!(
                "watermark for {} moved from {} to {} during consolidation",
                key, expected_start, session.last_consolidated
            )));
        }
        if end < expected_start || end > session.messages.len() {
            return Err(Error::storage(format!(
                "watermark {} for {} out of range {}..={}",
                end,
                key,
                expected_start,
                session.messages.len()
            )));
        }

        let previous = session.last_consolidated;
        session.last_consolidated = end;
        if let Err(e) = self.write_meta(&session) {
            session.last_consolidated = previous;
            return Err(e);
        }
        debug!("Watermark for {} advanced {} -> {}", key, previous, end);
        Ok(())
    }

    /// Archive the current log and start an empty one under the same key.
    /// Callers must hold the session lock.
    pub fn rotate(&self, key: &SessionKey) -> Result<()> {
        let handle = self.load_or_create(key)?;
        let mut session = write_guard(&handle);

        let log = self.log_path(key);
        if log.exists() {
            let archived = self.root.join(format!(
                "{}.{}.jsonl.archived",
                files::encode_name(key.as_str()),
                files::file_stamp()
            ));
            fs::rename(&log, &archived)
                .map_err(|e| Error::storage(format!("cannot archive {}: {}", log.display(), e)))?;
            info!("Archived {} ({} messages) to {}", key, session.len(), archived.display());
        }

        let fresh = Session::new(key.clone());
        self.write_meta(&fresh)?;
        *session = fresh;
        Ok(())
    }

    /// Every session with a live log, on disk or in memory.
    pub fn keys(&self) -> Result<Vec<SessionKey>> {
        let mut keys: Vec<SessionKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::storage(format!("cannot list {}: {}", self.root.display(), e)))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".meta.json")) else {
                continue;
            };
            if let Some(decoded) = files::decode_name(stem) {
                keys.push(SessionKey::new(decoded));
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// The session with the latest activity, if any exists.
    pub fn most_recent(&self) -> Result<Option<SessionKey>> {
        self.most_recent_where(|_| true)
    }

    /// Like [`most_recent`](Self::most_recent), considering only keys accepted by `keep`.
    pub fn most_recent_where(&self, keep: impl Fn(&SessionKey) -> bool) -> Result<Option<SessionKey>> {
        let mut best: Option<(DateTime<Utc>, SessionKey)> = None;
        for key in self.keys()?.into_iter().filter(|k| keep(k)) {
            let seen = match self.sessions.get(&key) {
                Some(handle) => read_guard(&handle).last_activity,
                None => self.file_activity(&key),
            };
            if best.as_ref().map(|(t, _)| seen > *t).unwrap_or(true) {
                best = Some((seen, key));
            }
        }
        Ok(best.map(|(_, key)| key))
    }

    fn file_activity(&self, key: &SessionKey) -> DateTime<Utc> {
        let modified = fs::metadata(self.log_path(key))
            .or_else(|_| fs::metadata(self.meta_path(key)))
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        DateTime::<Utc>::from(modified)
    }
}
