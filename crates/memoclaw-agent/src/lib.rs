//! Memoclaw Agent - session-serialized conversation runtime with long-term memory
//!
//! The dispatcher runs turns one at a time per session; the consolidator
//! folds settled history into memory; the heartbeat and Kaizen loops act on
//! their own schedule through the same dispatcher.

pub mod collaborators;
pub mod consolidation;
pub mod dispatcher;
pub mod fatal;
pub mod files;
pub mod heartbeat;
pub mod kaizen;
pub mod locks;
pub mod memory;
pub mod runtime;
pub mod store;

pub use collaborators::{
    CandidateExtractor, Consolidated, Materializer, ObservedTask, Summarizer, SummaryRequest,
    TurnContext, TurnExecutor, TurnOutput, WakeContext, WakeDecider,
};
pub use consolidation::{ConsolidationMode, Consolidator, PassOutcome};
pub use dispatcher::Dispatcher;
pub use fatal::FatalSignal;
pub use heartbeat::{Heartbeat, HeartbeatDecision, HeartbeatPhase, TickOutcome};
pub use kaizen::{
    CandidateStatus, DispatchMaterializer, Evidence, KaizenCandidate, KaizenLedger, KaizenLoop,
    KaizenReport, RunOutcome,
};
pub use locks::{SessionGuard, SessionLocks};
pub use memory::{HistoryEntry, MemoryStore};
pub use runtime::{AgentRuntime, Collaborators};
pub use store::{Session, SessionSnapshot, SessionStore};
