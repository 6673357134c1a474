//! Tests for the Kaizen loop and its ledger

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use memoclaw_agent::kaizen::MATERIALIZE_SESSION;
use memoclaw_agent::*;
use memoclaw_core::{MemoclawConfig, Result};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

fn add_history(rt: &AgentRuntime, scope: &str, session: &str, start: usize, end: usize) {
    let entry = HistoryEntry {
        session: key(session),
        session_started: Utc::now(),
        start,
        end,
        digest: format!("USER: summarize my inbox ({}..{})", start, end),
        created_at: Utc::now(),
    };
    rt.memory().append_history(scope, &entry).unwrap();
}

fn completed(outcome: RunOutcome) -> KaizenReport {
    match outcome {
        RunOutcome::Completed(report) => report,
        RunOutcome::AlreadyRunning => panic!("expected a completed run"),
    }
}

fn candidate(key: &str, observations: u32, age_mins: i64) -> KaizenCandidate {
    let seen = Utc::now() - ChronoDuration::minutes(age_mins);
    KaizenCandidate {
        key: key.to_string(),
        description: key.to_string(),
        evidence: Vec::new(),
        observations,
        status: CandidateStatus::Proposed,
        first_seen: seen,
        last_seen: seen,
        attempts: 0,
        last_error: None,
    }
}

fn seed_ledger(rt: &AgentRuntime, candidates: Vec<KaizenCandidate>) {
    let ledger = KaizenLedger { candidates, ..Default::default() };
    ledger.save(rt.kaizen().ledger_path()).unwrap();
}

// ===========================================================================
// Observation and dedup
// ===========================================================================

#[tokio::test]
async fn repeated_task_is_one_candidate_seen_twice() {
    let dir = TempDir::new().unwrap();
    let mut fakes = Fakes::with_executor(Arc::new(EchoExecutor::default()));
    fakes.extractor = Arc::new(ListExtractor::new(&["Summarize my inbox"]));
    let rt = runtime(dir.path(), quiet_config(), &fakes);

    add_history(&rt, "tg%3A1", "tg:1", 0, 4);
    let first = completed(rt.kaizen().run_once().await.unwrap());
    assert_eq!(first.new_candidates, vec!["summarize my inbox".to_string()]);
    assert!(first.materialized.is_empty());

    fakes.extractor.set(&["summarize my inbox!"]);
    add_history(&rt, "tg%3A1", "tg:1", 4, 8);
    let second = completed(rt.kaizen().run_once().await.unwrap());
    assert!(second.new_candidates.is_empty());
    assert_eq!(second.materialized, vec!["summarize my inbox".to_string()]);

    let ledger = rt.kaizen().ledger().unwrap();
    assert_eq!(ledger.candidates.len(), 1);
    let c = &ledger.candidates[0];
    assert_eq!(c.observations, 2);
    assert_eq!(c.status, CandidateStatus::Materialized);
    assert_eq!(c.evidence.len(), 2);
    assert_eq!(c.evidence[1], Evidence { session: key("tg:1"), start: 4, end: 8 });
}

#[tokio::test]
async fn scanned_history_is_not_rescanned() {
    let dir = TempDir::new().unwrap();
    let mut fakes = Fakes::with_executor(Arc::new(EchoExecutor::default()));
    fakes.extractor = Arc::new(ListExtractor::new(&["check the calendar"]));
    let rt = runtime(dir.path(), quiet_config(), &fakes);

    add_history(&rt, "a", "tg:1", 0, 2);
    add_history(&rt, "a", "tg:1", 2, 4);
    rt.kaizen().run_once().await.unwrap();
    let report = completed(rt.kaizen().run_once().await.unwrap());
    assert_eq!(report.scanned_entries, 0);
    assert_eq!(*fakes.extractor.batches.lock().unwrap(), vec![2]);

    let ledger = rt.kaizen().ledger().unwrap();
    assert_eq!(ledger.cursors.get("a"), Some(&2));
    assert_eq!(ledger.candidates[0].observations, 1);
}

#[tokio::test]
async fn new_candidates_are_noted_in_kaizen_md() {
    let dir = TempDir::new().unwrap();
    let mut fakes = Fakes::with_executor(Arc::new(EchoExecutor::default()));
    fakes.extractor = Arc::new(ListExtractor::new(&["Rename screenshots by date"]));
    let rt = runtime(dir.path(), quiet_config(), &fakes);

    add_history(&rt, "a", "tg:1", 0, 2);
    rt.kaizen().run_once().await.unwrap();
    let notes = std::fs::read_to_string(dir.path().join("memory/KAIZEN.md")).unwrap();
    assert!(notes.contains("Rename screenshots by date"));
}

// ===========================================================================
// Ranking and materialization
// ===========================================================================

#[tokio::test]
async fn top_candidates_ranked_by_observations_then_recency() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::with_executor(Arc::new(EchoExecutor::default()));
    let rt = runtime(dir.path(), quiet_config(), &fakes);
    seed_ledger(
        &rt,
        vec![
            candidate("d", 2, 0),
            candidate("b", 3, 30),
            candidate("e", 1, 0),
            candidate("a", 5, 60),
            candidate("c", 3, 10),
        ],
    );

    let report = completed(rt.kaizen().run_once().await.unwrap());
    assert_eq!(fakes.materializer.attempts(), vec!["a", "c", "b"]);
    assert_eq!(report.materialized, vec!["a", "c", "b"]);

    let ledger = rt.kaizen().ledger().unwrap();
    assert_eq!(ledger.get("d").unwrap().status, CandidateStatus::Proposed);
    assert_eq!(ledger.get("e").unwrap().status, CandidateStatus::Proposed);
}

#[tokio::test]
async fn one_failure_does_not_block_the_others() {
    let dir = TempDir::new().unwrap();
    let mut fakes = Fakes::with_executor(Arc::new(EchoExecutor::default()));
    fakes.materializer = Arc::new(RecordingMaterializer::failing(&["b"]));
    let mut config: MemoclawConfig = quiet_config();
    config.kaizen.max_attempts = 2;
    let rt = runtime(dir.path(), config, &fakes);
    seed_ledger(&rt, vec![candidate("a", 4, 0), candidate("b", 3, 0), candidate("c", 2, 0)]);

    let report = completed(rt.kaizen().run_once().await.unwrap());
    assert_eq!(report.materialized, vec!["a", "c"]);
    assert_eq!(report.failed, vec!["b"]);

    let ledger = rt.kaizen().ledger().unwrap();
    let b = ledger.get("b").unwrap();
    assert_eq!(b.status, CandidateStatus::RejectedTemporarily);
    assert_eq!(b.attempts, 1);
    assert!(b.last_error.as_deref().unwrap_or("").contains("could not write skill"));

    // Retried on the next run, then rejected for good.
    let report = completed(rt.kaizen().run_once().await.unwrap());
    assert_eq!(report.failed, vec!["b"]);
    let ledger = rt.kaizen().ledger().unwrap();
    assert!(ledger.get("b").is_none());
    assert_eq!(ledger.candidates.iter().find(|c| c.key == "b").unwrap().status, CandidateStatus::Rejected);

    let report = completed(rt.kaizen().run_once().await.unwrap());
    assert!(report.failed.is_empty() && report.materialized.is_empty());
}

#[tokio::test]
async fn ledger_persists_across_restarts() {
    let dir = TempDir::new().unwrap();
    let mut fakes = Fakes::with_executor(Arc::new(EchoExecutor::default()));
    fakes.extractor = Arc::new(ListExtractor::new(&["draft weekly report"]));
    {
        let rt = runtime(dir.path(), quiet_config(), &fakes);
        add_history(&rt, "a", "tg:1", 0, 2);
        rt.kaizen().run_once().await.unwrap();
    }

    let rt = runtime(dir.path(), quiet_config(), &fakes);
    add_history(&rt, "a", "tg:1", 2, 4);
    let report = completed(rt.kaizen().run_once().await.unwrap());
    assert_eq!(report.materialized, vec!["draft weekly report".to_string()]);
    assert!(rt.kaizen().ledger().unwrap().last_run_at.is_some());
}

#[tokio::test]
async fn corrupt_ledger_is_set_aside() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::with_executor(Arc::new(EchoExecutor::default()));
    let rt = runtime(dir.path(), quiet_config(), &fakes);
    std::fs::write(rt.kaizen().ledger_path(), "{ broken").unwrap();

    let ledger = rt.kaizen().ledger().unwrap();
    assert!(ledger.candidates.is_empty());
    let set_aside = std::fs::read_dir(dir.path().join("memory"))
        .unwrap()
        .flatten()
        .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
    assert!(set_aside);
}

#[tokio::test]
async fn dispatch_materializer_runs_a_turn_in_its_own_session() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::with_executor(Arc::new(EchoExecutor::default()));
    let mut collaborators = fakes.collaborators();
    collaborators.materializer = None;
    let rt = AgentRuntime::open(dir.path(), quiet_config(), collaborators).unwrap();
    seed_ledger(&rt, vec![candidate("water the plants", 2, 0)]);

    let report = completed(rt.kaizen().run_once().await.unwrap());
    assert_eq!(report.materialized, vec!["water the plants".to_string()]);
    let log = rt.store().snapshot(&key(MATERIALIZE_SESSION)).unwrap().messages;
    assert!(log[0].content.starts_with("[kaizen]"));
    assert!(log[0].content.contains("water the plants"));
}

#[tokio::test]
async fn dispatch_materializer_reports_failed_turns() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::with_executor(Arc::new(TimeoutExecutor));
    let mut collaborators = fakes.collaborators();
    collaborators.materializer = None;
    let rt = AgentRuntime::open(dir.path(), quiet_config(), collaborators).unwrap();
    seed_ledger(&rt, vec![candidate("water the plants", 2, 0)]);

    let report = completed(rt.kaizen().run_once().await.unwrap());
    assert_eq!(report.failed, vec!["water the plants".to_string()]);
}

// ===========================================================================
// Scheduling
// ===========================================================================

/// Blocks inside the scan until released.
struct GatedExtractor {
    entered: Notify,
    release: Semaphore,
}

#[async_trait::async_trait]
impl CandidateExtractor for GatedExtractor {
    async fn extract_candidates(&self, _entries: &[HistoryEntry]) -> Result<Vec<ObservedTask>> {
        self.entered.notify_one();
        let _ = self.release.acquire().await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn only_one_run_at_a_time() {
    let dir = TempDir::new().unwrap();
    let extractor = Arc::new(GatedExtractor { entered: Notify::new(), release: Semaphore::new(0) });
    let fakes = Fakes::with_executor(Arc::new(EchoExecutor::default()));
    let mut collaborators = fakes.collaborators();
    collaborators.extractor = extractor.clone();
    let rt = Arc::new(AgentRuntime::open(dir.path(), quiet_config(), collaborators).unwrap());
    add_history(&rt, "a", "tg:1", 0, 2);

    let kaizen = rt.kaizen().clone();
    let first = tokio::spawn(async move { kaizen.run_once().await });
    extractor.entered.notified().await;
    assert!(rt.kaizen().is_running());
    assert!(matches!(rt.kaizen().run_once().await.unwrap(), RunOutcome::AlreadyRunning));

    extractor.release.add_permits(1);
    assert!(matches!(first.await.unwrap().unwrap(), RunOutcome::Completed(_)));
    assert!(!rt.kaizen().is_running());
}

#[tokio::test]
async fn due_after_interval_since_last_run() {
    let dir = TempDir::new().unwrap();
    let fakes = Fakes::with_executor(Arc::new(EchoExecutor::default()));
    let rt = runtime(dir.path(), quiet_config(), &fakes);

    assert!(rt.kaizen().is_due(Utc::now()).unwrap());
    rt.kaizen().run_once().await.unwrap();
    assert!(!rt.kaizen().is_due(Utc::now()).unwrap());
    assert!(rt.kaizen().is_due(Utc::now() + ChronoDuration::hours(25)).unwrap());
}
