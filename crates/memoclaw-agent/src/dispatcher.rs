//! Conversation dispatcher: one inbound event in, one serialized turn out
//!
//! Admission is bounded globally by a semaphore; within a session, turns run
//! one at a time under the session lock. Turns for different sessions never
//! wait on each other beyond the admission bound.

use crate::collaborators::{TurnContext, TurnExecutor};
use crate::consolidation::Consolidator;
use crate::locks::{SessionGuard, SessionLocks};
use crate::memory::MemoryStore;
use crate::store::SessionStore;
use dashmap::DashMap;
use memoclaw_core::{
    Error, InboundEvent, Message, OutboundEvent, OutboundKind, Result, Role, SessionKey,
};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const STOP_COMMAND: &str = "/stop";
pub const NEW_COMMAND: &str = "/new";

/// A registered turn that `/stop` can cancel. Deregisters on drop.
struct TurnTicket<'a> {
    dispatcher: &'a Dispatcher,
    key: SessionKey,
    id: Uuid,
    token: CancellationToken,
}

impl Drop for TurnTicket<'_> {
    fn drop(&mut self) {
        let empty = match self.dispatcher.active.get_mut(&self.key) {
            Some(mut turns) => {
                turns.retain(|(id, _)| *id != self.id);
                turns.is_empty()
            }
            None => false,
        };
        if empty {
            self.dispatcher.active.remove_if(&self.key, |_, turns| turns.is_empty());
        }
    }
}

pub struct Dispatcher {
    store: Arc<SessionStore>,
    memory: Arc<MemoryStore>,
    locks: Arc<SessionLocks>,
    executor: Arc<dyn TurnExecutor>,
    consolidator: Arc<Consolidator>,
    admission: Arc<Semaphore>,
    max_tool_iterations: usize,
    active: DashMap<SessionKey, Vec<(Uuid, CancellationToken)>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        memory: Arc<MemoryStore>,
        locks: Arc<SessionLocks>,
        executor: Arc<dyn TurnExecutor>,
        consolidator: Arc<Consolidator>,
        max_concurrent_turns: usize,
        max_tool_iterations: usize,
    ) -> Self {
        Self {
            store,
            memory,
            locks,
            executor,
            consolidator,
            admission: Arc::new(Semaphore::new(max_concurrent_turns)),
            max_tool_iterations,
            active: DashMap::new(),
        }
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Turns registered for `key`, running or queued.
    pub fn active_turns(&self, key: &SessionKey) -> usize {
        self.active.get(key).map(|t| t.len()).unwrap_or(0)
    }

    /// Handle one inbound event, waiting for admission and the session lock.
    /// Only failures of the session store surface as `Err`; turn failures
    /// become an error marker in the log and an error outbound.
    pub async fn handle(&self, event: InboundEvent) -> Result<Vec<OutboundEvent>> {
        let key = event.session_key();
        match event.command() {
            Some(STOP_COMMAND) => return Ok(vec![self.stop_reply(&key)]),
            Some(NEW_COMMAND) => return self.start_new_session(&key).await,
            _ => {}
        }

        let ticket = self.register(&key);
        let permit = tokio::select! {
            biased;
            _ = ticket.token.cancelled() => return Ok(Vec::new()),
            permit = self.admission.clone().acquire_owned() => permit
                .map_err(|_| Error::turn("admission closed"))?,
        };
        let guard = tokio::select! {
            biased;
            _ = ticket.token.cancelled() => return Ok(Vec::new()),
            guard = self.locks.acquire(&key) => guard,
        };
        self.run_locked(guard, permit, &event, &ticket).await
    }

    /// Handle an event only if it can start right away. `None` means the
    /// session was busy (or admission full) and nothing happened.
    pub async fn try_handle(&self, event: InboundEvent) -> Option<Result<Vec<OutboundEvent>>> {
        let key = event.session_key();
        let permit = self.admission.clone().try_acquire_owned().ok()?;
        let guard = self.locks.try_acquire(&key)?;
        let ticket = self.register(&key);
        Some(self.run_locked(guard, permit, &event, &ticket).await)
    }

    /// Cancel every running or queued turn for `key`. Returns how many.
    pub fn stop(&self, key: &SessionKey) -> usize {
        let tokens: Vec<CancellationToken> = self
            .active
            .get(key)
            .map(|turns| turns.iter().map(|(_, t)| t.clone()).collect())
            .unwrap_or_default();
        for token in &tokens {
            token.cancel();
        }
        if !tokens.is_empty() {
            info!("Stopped {} turn(s) for {}", tokens.len(), key);
        }
        tokens.len()
    }

    fn stop_reply(&self, key: &SessionKey) -> OutboundEvent {
        let stopped = self.stop(key);
        let content = if stopped > 0 {
            format!("Stopped {} task(s).", stopped)
        } else {
            "No active task to stop.".to_string()
        };
        OutboundEvent::to_session(key, content, OutboundKind::Notice)
    }

    async fn start_new_session(&self, key: &SessionKey) -> Result<Vec<OutboundEvent>> {
        let _guard = self.locks.acquire(key).await;
        match self.consolidator.archive_and_reset(key).await {
            Ok(outcome) => {
                info!("New session for {} ({:?})", key, outcome);
                Ok(vec![OutboundEvent::to_session(key, "New session started.", OutboundKind::Notice)])
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Archiving {} before /new failed: {}", key, e);
                Ok(vec![OutboundEvent::to_session(
                    key,
                    "Memory archival failed, session not cleared. Please try again.",
                    OutboundKind::Error,
                )])
            }
        }
    }

    fn register(&self, key: &SessionKey) -> TurnTicket<'_> {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.active.entry(key.clone()).or_default().push((id, token.clone()));
        TurnTicket { dispatcher: self, key: key.clone(), id, token }
    }

    async fn run_locked(
        &self,
        guard: SessionGuard,
        permit: OwnedSemaphorePermit,
        event: &InboundEvent,
        ticket: &TurnTicket<'_>,
    ) -> Result<Vec<OutboundEvent>> {
        let key = guard.key().clone();
        let result = self.execute_turn(&key, event, &ticket.token).await;
        drop(guard);
        drop(permit);
        debug!("Turn for {} finished", key);

        if result.is_ok() {
            self.consolidator.maybe_schedule(&key);
        }
        result
    }

    /// Run the executor loop under the session lock.
    async fn execute_turn(
        &self,
        key: &SessionKey,
        event: &InboundEvent,
        cancel: &CancellationToken,
    ) -> Result<Vec<OutboundEvent>> {
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let inbound = self.store.append(key, Message::user(event.content.clone()))?;
        let memory = self.memory.memory_context(key);
        info!("Turn started for {} ({:?})", key, event.origin);

        let mut outbound = Vec::new();
        for iteration in 1..=self.max_tool_iterations {
            let snapshot = self.store.snapshot(key)?;
            let ctx = TurnContext {
                session: key.clone(),
                history: snapshot.messages,
                inbound: inbound.clone(),
                memory: memory.clone(),
                origin: event.origin,
                iteration,
            };

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                step = self.executor.run_turn(ctx, cancel.clone()) => step,
            };

            match step {
                Ok(output) => {
                    for message in output.messages {
                        let stored = self.store.append(key, message)?;
                        if stored.role == Role::Assistant && stored.tool.is_none() && !stored.content.is_empty() {
                            outbound.push(OutboundEvent::to_session(key, stored.content, OutboundKind::Reply));
                        }
                    }
                    if output.done {
                        return Ok(outbound);
                    }
                }
                Err(Error::Cancelled) => {
                    self.store.append(key, Message::incomplete_marker("[turn stopped before completion]"))?;
                    info!("Turn for {} stopped", key);
                    outbound.push(OutboundEvent::to_session(key, "The task was stopped.", OutboundKind::Notice));
                    return Ok(outbound);
                }
                // Executor errors, I/O included, fail the turn only.
                Err(e) => {
                    warn!("Turn for {} failed: {}", key, e);
                    let text = e.user_message();
                    self.store.append(key, Message::error_marker(text.clone()))?;
                    outbound.push(OutboundEvent::to_session(key, text, OutboundKind::Error));
                    return Ok(outbound);
                }
            }
        }

        warn!("Turn for {} hit the tool iteration limit ({})", key, self.max_tool_iterations);
        let text = format!(
            "Sorry, I stopped after {} tool rounds without finishing.",
            self.max_tool_iterations
        );
        self.store.append(key, Message::error_marker(text.clone()))?;
        outbound.push(OutboundEvent::to_session(key, text, OutboundKind::Error));
        Ok(outbound)
    }
}
