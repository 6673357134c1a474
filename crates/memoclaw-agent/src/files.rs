//! Disk helpers shared by the session log, memory files and the Kaizen ledger
//!
//! Layout under the workspace:
//!
//! ```text
//! <workspace>/
//!   HEARTBEAT.md                standing instructions for the heartbeat
//!   sessions/
//!     tg%3A42.jsonl             one message record per line
//!     tg%3A42.meta.json         created_at + consolidation watermark
//!   memory/
//!     tg%3A42/MEMORY.md         long-term summary for the scope
//!     tg%3A42/history.jsonl     one digest entry per consolidation pass
//!     kaizen.json               candidate ledger
//!     KAIZEN.md                 human-readable candidate notes
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SESSIONS_DIR: &str = "sessions";
pub const MEMORY_DIR: &str = "memory";
pub const HEARTBEAT_FILE: &str = "HEARTBEAT.md";

pub fn sessions_dir(workspace: &Path) -> PathBuf {
    workspace.join(SESSIONS_DIR)
}

pub fn memory_dir(workspace: &Path) -> PathBuf {
    workspace.join(MEMORY_DIR)
}

/// Append one line, creating the file (and its parent) if needed.
pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{}", line)?;
    f.flush()
}

/// Replace a file's contents via write-to-temp then rename.
pub fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// Read a file, treating "not found" as empty.
pub fn read_or_empty(path: &Path) -> std::io::Result<String> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Percent-encode a key into a file-name-safe stem.
pub fn encode_name(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Inverse of [`encode_name`]. Returns `None` for malformed input.
pub fn decode_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Compact timestamp used in archived file names.
pub fn file_stamp() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%S%3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_encoding_round_trips() {
        for key in ["tg:42", "slack:C1/thread", "heartbeat:main", "a.b c"] {
            let encoded = encode_name(key);
            assert!(!encoded.contains(':') && !encoded.contains('/') && !encoded.contains('.'));
            assert_eq!(decode_name(&encoded).as_deref(), Some(key));
        }
    }

    #[test]
    fn decode_rejects_truncated_escape() {
        assert_eq!(decode_name("tg%3"), None);
    }

    #[test]
    fn append_and_atomic_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("nested/log.jsonl");
        append_line(&log, "one").unwrap();
        append_line(&log, "two").unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "one\ntwo\n");

        let doc = dir.path().join("doc.md");
        write_atomic(&doc, "v1").unwrap();
        write_atomic(&doc, "v2").unwrap();
        assert_eq!(read_or_empty(&doc).unwrap(), "v2");
        assert_eq!(read_or_empty(&dir.path().join("missing")).unwrap(), "");
    }
}
