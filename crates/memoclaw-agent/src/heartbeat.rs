//! Two-phase heartbeat
//!
//! On each tick a cheap yes/no decision runs against a low-context view,
//! with no session lock held. Only a "yes" leads to the action phase, which
//! synthesizes a normal inbound event and goes through the dispatcher. If
//! the target session is busy the tick is skipped, not queued.

use crate::collaborators::{WakeContext, WakeDecider};
use crate::dispatcher::Dispatcher;
use crate::fatal::FatalSignal;
use crate::files;
use crate::kaizen::MATERIALIZE_SESSION;
use crate::memory::MemoryStore;
use crate::store::SessionStore;
use chrono::Utc;
use memoclaw_core::config::HeartbeatConfig;
use memoclaw_core::{InboundEvent, Origin, OutboundEvent, SessionKey};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session used when nothing else has been active yet.
pub const FALLBACK_SESSION: &str = "heartbeat:main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPhase {
    Idle,
    Evaluating,
    Acting,
}

/// Result of the decision phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatDecision {
    pub should_act: bool,
    pub action: Option<String>,
}

impl HeartbeatDecision {
    fn skip() -> Self {
        Self { should_act: false, action: None }
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    /// Phase 1 (or an empty action) said there was nothing to do.
    Skipped,
    /// A previous tick is still evaluating or acting.
    Overlapping,
    /// The target session was busy; the action was dropped.
    Busy(SessionKey),
    Acted { session: SessionKey, outbound: Vec<OutboundEvent> },
    /// The action turn failed; storage failures are also raised as fatal.
    Failed(String),
}

/// Resets the phase to idle on every exit path of a tick.
struct PhaseReset<'a>(&'a Mutex<HeartbeatPhase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = HeartbeatPhase::Idle;
    }
}

pub struct Heartbeat {
    dispatcher: Arc<Dispatcher>,
    store: Arc<SessionStore>,
    memory: Arc<MemoryStore>,
    decider: Arc<dyn WakeDecider>,
    config: HeartbeatConfig,
    workspace: PathBuf,
    phase: Mutex<HeartbeatPhase>,
    outbound: Mutex<Option<mpsc::Sender<OutboundEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    fatal: Arc<FatalSignal>,
}

impl Heartbeat {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        memory: Arc<MemoryStore>,
        decider: Arc<dyn WakeDecider>,
        config: HeartbeatConfig,
        workspace: PathBuf,
        fatal: Arc<FatalSignal>,
    ) -> Self {
        let store = dispatcher.store().clone();
        Self {
            dispatcher,
            store,
            memory,
            decider,
            config,
            workspace,
            phase: Mutex::new(HeartbeatPhase::Idle),
            outbound: Mutex::new(None),
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
            fatal,
        }
    }

    /// Deliver action replies to `tx` as well as returning them.
    pub fn set_outbound(&self, tx: mpsc::Sender<OutboundEvent>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    pub fn phase(&self) -> HeartbeatPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Start the periodic loop. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("Heartbeat already running");
            return;
        }
        if self.shutdown.is_cancelled() {
            warn!("Heartbeat was stopped and cannot be restarted");
            return;
        }

        let this = self.clone();
        let interval = self.config.interval();
        info!("Heartbeat started (every {}s)", interval.as_secs());
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = this.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let outcome = this.tick().await;
                        debug!("Heartbeat tick: {:?}", outcome);
                    }
                }
            }
            info!("Heartbeat stopped");
        }));
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Run a tick immediately, outside the schedule.
    pub async fn trigger_now(&self) -> TickOutcome {
        self.tick().await
    }

    /// One evaluate-then-maybe-act cycle.
    pub async fn tick(&self) -> TickOutcome {
        {
            let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
            if *phase != HeartbeatPhase::Idle {
                debug!("Heartbeat tick skipped, previous tick still {:?}", *phase);
                return TickOutcome::Overlapping;
            }
            *phase = HeartbeatPhase::Evaluating;
        }
        let _reset = PhaseReset(&self.phase);

        let session = self.target_session();
        let ctx = self.wake_context(&session);
        let decision = self.decide(&ctx).await;
        let action = match decision {
            HeartbeatDecision { should_act: true, action: Some(action) } => action,
            _ => {
                debug!("Heartbeat: nothing to do");
                return TickOutcome::Skipped;
            }
        };

        self.set_phase(HeartbeatPhase::Acting);
        info!("Heartbeat acting in {}: {}", session, action);
        let event = InboundEvent::for_session(
            &session,
            format!("[heartbeat] The agent decided to act because: {}", action),
            Origin::Heartbeat,
        );

        match self.dispatcher.try_handle(event).await {
            None => {
                info!("Heartbeat skipped, {} is busy", session);
                TickOutcome::Busy(session)
            }
            Some(Ok(outbound)) => {
                self.deliver(&outbound).await;
                TickOutcome::Acted { session, outbound }
            }
            Some(Err(e)) => {
                if !self.fatal.check(&format!("heartbeat action in {}", session), &e) {
                    warn!("Heartbeat action in {} failed: {}", session, e);
                }
                TickOutcome::Failed(e.to_string())
            }
        }
    }

    /// Both decision phases. Collaborator errors count as "nothing to do".
    pub async fn decide(&self, ctx: &WakeContext) -> HeartbeatDecision {
        match self.decider.decide_wake(ctx).await {
            Ok(true) => {}
            Ok(false) => return HeartbeatDecision::skip(),
            Err(e) => {
                warn!("Heartbeat wake decision failed: {}", e);
                return HeartbeatDecision::skip();
            }
        }
        match self.decider.decide_action(ctx).await {
            Ok(action) if !action.trim().is_empty() => {
                HeartbeatDecision { should_act: true, action: Some(action.trim().to_string()) }
            }
            Ok(_) => HeartbeatDecision::skip(),
            Err(e) => {
                warn!("Heartbeat action decision failed: {}", e);
                HeartbeatDecision::skip()
            }
        }
    }

    /// Configured target, else the most recently active conversation, else
    /// the fallback. The Kaizen materializer session is never a target.
    pub fn target_session(&self) -> SessionKey {
        if let Some(target) = &self.config.target_session {
            return SessionKey::new(target.clone());
        }
        match self.store.most_recent_where(|k| k.as_str() != MATERIALIZE_SESSION) {
            Ok(Some(key)) => key,
            Ok(None) => SessionKey::new(FALLBACK_SESSION),
            Err(e) => {
                warn!("Cannot list sessions for heartbeat: {}", e);
                SessionKey::new(FALLBACK_SESSION)
            }
        }
    }

    /// Read-only view for the decision phases. Takes no session lock.
    fn wake_context(&self, session: &SessionKey) -> WakeContext {
        let recent = self.store.tail(session, self.config.recent_messages).unwrap_or_else(|e| {
            warn!("Cannot read {} for heartbeat: {}", session, e);
            Vec::new()
        });
        let instructions = files::read_or_empty(&self.workspace.join(files::HEARTBEAT_FILE)).unwrap_or_default();
        WakeContext {
            session: session.clone(),
            recent,
            memory: self.memory.memory_context(session),
            instructions,
            now: Utc::now(),
        }
    }

    fn set_phase(&self, phase: HeartbeatPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    async fn deliver(&self, outbound: &[OutboundEvent]) {
        let tx = self.outbound.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(tx) = tx {
            for event in outbound {
                if tx.send(event.clone()).await.is_err() {
                    warn!("Outbound channel closed, dropping heartbeat reply");
                    break;
                }
            }
        }
    }
}
