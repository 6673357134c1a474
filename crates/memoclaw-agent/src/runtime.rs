//! Agent runtime: wires the stores, dispatcher and background loops together

use crate::collaborators::{CandidateExtractor, Materializer, Summarizer, TurnExecutor, WakeDecider};
use crate::consolidation::Consolidator;
use crate::dispatcher::Dispatcher;
use crate::fatal::FatalSignal;
use crate::heartbeat::Heartbeat;
use crate::kaizen::{DispatchMaterializer, KaizenLoop};
use crate::locks::SessionLocks;
use crate::memory::MemoryStore;
use crate::store::SessionStore;
use memoclaw_core::{Error, InboundEvent, MemoclawConfig, OutboundEvent, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// The external collaborators a runtime needs.
pub struct Collaborators {
    pub executor: Arc<dyn TurnExecutor>,
    pub summarizer: Arc<dyn Summarizer>,
    pub decider: Arc<dyn WakeDecider>,
    pub extractor: Arc<dyn CandidateExtractor>,
    /// Defaults to materializing through the agent's own dispatcher.
    pub materializer: Option<Arc<dyn Materializer>>,
}

pub struct AgentRuntime {
    config: MemoclawConfig,
    workspace: PathBuf,
    store: Arc<SessionStore>,
    memory: Arc<MemoryStore>,
    consolidator: Arc<Consolidator>,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Arc<Heartbeat>,
    kaizen: Arc<KaizenLoop>,
    fatal: Arc<FatalSignal>,
}

impl AgentRuntime {
    /// Open the workspace and build every component. Storage that cannot be
    /// created is a fatal error.
    pub fn open(workspace: &Path, config: MemoclawConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(workspace)
            .map_err(|e| Error::storage(format!("cannot create {}: {}", workspace.display(), e)))?;

        let store = Arc::new(SessionStore::open(workspace, config.session.max_message_chars)?);
        let memory = Arc::new(MemoryStore::open(workspace, config.consolidation.scope)?);
        let locks = Arc::new(SessionLocks::new(config.session.lock_wait_warn()));
        let fatal = Arc::new(FatalSignal::new());

        let consolidator = Arc::new(Consolidator::new(
            store.clone(),
            memory.clone(),
            collaborators.summarizer,
            config.consolidation.clone(),
            fatal.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            memory.clone(),
            locks,
            collaborators.executor,
            consolidator.clone(),
            config.admission.max_concurrent_turns,
            config.session.max_tool_iterations,
        ));
        let heartbeat = Arc::new(Heartbeat::new(
            dispatcher.clone(),
            memory.clone(),
            collaborators.decider,
            config.heartbeat.clone(),
            workspace.to_path_buf(),
            fatal.clone(),
        ));
        let materializer = collaborators
            .materializer
            .unwrap_or_else(|| Arc::new(DispatchMaterializer::new(dispatcher.clone())));
        let kaizen = Arc::new(KaizenLoop::new(
            memory.clone(),
            collaborators.extractor,
            materializer,
            config.kaizen.clone(),
            consolidator.committed_signal(),
            fatal.clone(),
        ));

        info!("Runtime ready at {}", workspace.display());
        Ok(Self {
            config,
            workspace: workspace.to_path_buf(),
            store,
            memory,
            consolidator,
            dispatcher,
            heartbeat,
            kaizen,
            fatal,
        })
    }

    pub fn config(&self) -> &MemoclawConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn consolidator(&self) -> &Arc<Consolidator> {
        &self.consolidator
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    pub fn kaizen(&self) -> &Arc<KaizenLoop> {
        &self.kaizen
    }

    /// Raised when a background loop hits a storage failure.
    pub fn fatal(&self) -> &Arc<FatalSignal> {
        &self.fatal
    }

    /// Start the enabled background loops.
    pub fn start(&self) {
        if self.config.heartbeat.enabled {
            self.heartbeat.start();
        }
        if self.config.kaizen.enabled {
            self.kaizen.start();
        }
    }

    pub fn shutdown(&self) {
        self.heartbeat.stop();
        self.kaizen.stop();
        info!("Runtime stopped");
    }

    /// Consume inbound events until the channel closes, one task per event.
    /// Replies (including heartbeat replies) go to `outbound`. Returns the
    /// first fatal storage error, whether it came from an event or from a
    /// background loop.
    pub async fn run_bus(
        &self,
        mut inbound: mpsc::Receiver<InboundEvent>,
        outbound: mpsc::Sender<OutboundEvent>,
    ) -> Result<()> {
        self.heartbeat.set_outbound(outbound.clone());
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.fatal.raised() => {
                    tasks.abort_all();
                    return Err(self.fatal_error());
                }
                event = inbound.recv() => {
                    let Some(event) = event else { break };
                    let dispatcher = self.dispatcher.clone();
                    let tx = outbound.clone();
                    tasks.spawn(async move {
                        for reply in dispatcher.handle(event).await? {
                            if tx.send(reply).await.is_err() {
                                warn!("Outbound channel closed, dropping reply");
                            }
                        }
                        Ok(())
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    Self::check_task(joined)?;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            Self::check_task(joined)?;
        }
        if self.fatal.is_raised() {
            return Err(self.fatal_error());
        }
        Ok(())
    }

    fn fatal_error(&self) -> Error {
        self.fatal
            .error()
            .unwrap_or_else(|| Error::storage("fatal error raised by a background loop"))
    }

    fn check_task(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_fatal() => {
                error!("Fatal error handling event: {}", e);
                Err(e)
            }
            Ok(Err(e)) => {
                warn!("Event handling failed: {}", e);
                Ok(())
            }
            Err(e) => {
                warn!("Event task panicked: {}", e);
                Ok(())
            }
        }
    }
}
