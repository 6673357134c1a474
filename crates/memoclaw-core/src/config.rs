//! Runtime configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoclawConfig {
    /// Message log parameters.
    pub session: SessionConfig,
    /// Global admission bound for concurrent turns.
    pub admission: AdmissionConfig,
    /// When and how history is folded into memory.
    pub consolidation: ConsolidationConfig,
    /// Autonomous wake parameters.
    pub heartbeat: HeartbeatConfig,
    /// Self-improvement review parameters.
    pub kaizen: KaizenConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Messages longer than this many characters are stored truncated.
    pub max_message_chars: usize,
    /// Max turn-executor rounds per inbound event (tool-call loops).
    pub max_tool_iterations: usize,
    /// A lock wait longer than this is logged as a warning.
    pub lock_wait_warn_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Max turns executing at once across all sessions.
    pub max_concurrent_turns: usize,
}

/// What makes the dispatcher schedule a consolidation pass after a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationTrigger {
    /// Schedule a pass after every turn.
    EveryTurn,
    /// Schedule a pass once `threshold_messages` unconsolidated messages accumulate.
    Threshold,
}

/// Whether memory files are kept per session or shared by the whole agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Session,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub trigger: ConsolidationTrigger,
    pub threshold_messages: usize,
    /// Most recent messages left out of a regular pass. `/new` ignores this.
    pub keep_recent: usize,
    /// Cap on MEMORY.md; oldest facts are dropped first.
    pub summary_max_chars: usize,
    pub scope: MemoryScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Session the heartbeat acts in. Default: most recently active session.
    pub target_session: Option<String>,
    /// Tail of the target session shown to the decision phases.
    pub recent_messages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KaizenConfig {
    pub enabled: bool,
    /// Minimum time between two review runs.
    pub interval_secs: u64,
    /// How often the loop wakes to check whether a run is due.
    pub check_interval_secs: u64,
    /// Candidates seen fewer times than this are never materialized.
    pub min_observations: u32,
    /// Max candidates materialized per run.
    pub top_n: usize,
    /// Failed materializations before a candidate is rejected for good.
    pub max_attempts: u32,
}

// ============================================================
// Defaults
// ============================================================

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_message_chars: 5_000, max_tool_iterations: 25, lock_wait_warn_secs: 30 }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { max_concurrent_turns: 8 }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            trigger: ConsolidationTrigger::Threshold,
            threshold_messages: 20,
            keep_recent: 0,
            summary_max_chars: 8_000,
            scope: MemoryScope::Session,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 30 * 60, target_session: None, recent_messages: 10 }
    }
}

impl Default for KaizenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 24 * 60 * 60,
            check_interval_secs: 60 * 60,
            min_observations: 2,
            top_n: 3,
            max_attempts: 3,
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl MemoclawConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(Error::Io(_)) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to load {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Load and validate, surfacing every failure to the caller.
    pub fn try_load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.max_message_chars == 0 {
            return Err(Error::Config("session.max_message_chars must be > 0".into()));
        }
        if self.session.max_tool_iterations == 0 {
            return Err(Error::Config("session.max_tool_iterations must be > 0".into()));
        }
        if self.admission.max_concurrent_turns == 0 {
            return Err(Error::Config("admission.max_concurrent_turns must be > 0".into()));
        }
        if self.consolidation.trigger == ConsolidationTrigger::Threshold
            && self.consolidation.threshold_messages == 0
        {
            return Err(Error::Config("consolidation.threshold_messages must be > 0".into()));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(Error::Config("heartbeat.interval_secs must be > 0".into()));
        }
        if self.kaizen.interval_secs == 0 || self.kaizen.check_interval_secs == 0 {
            return Err(Error::Config("kaizen intervals must be > 0".into()));
        }
        Ok(())
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

impl SessionConfig {
    pub fn lock_wait_warn(&self) -> Duration {
        Duration::from_secs(self.lock_wait_warn_secs)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl KaizenConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}
