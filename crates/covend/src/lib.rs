//! covend - the coven orchestration daemon.
//!
//! Composes the long-lived components leaves-first: broker, state store,
//! process manager, worktree manager, spellbook, scheduler, and the
//! Unix-socket control server. One daemon serves one repository.

pub mod beads;
pub mod broker;
pub mod engine;
pub mod executors;
pub mod git;
pub mod process;
pub mod ring;
pub mod scheduler;
pub mod server;
pub mod spellbook;
pub mod state;
pub mod worktree;

use crate::beads::CliBeadSource;
use crate::broker::Broker;
use crate::engine::EngineParams;
use crate::process::ProcessManager;
use crate::scheduler::Scheduler;
use crate::server::AppState;
use crate::spellbook::Spellbook;
use crate::state::StateStore;
use crate::worktree::WorktreeManager;
use coven_core::events::AgentLifecyclePayload;
use coven_core::{AgentStatus, Config, EventName, EventPayload};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

/// Daemon bootstrap options, before the config file is applied.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Repository the daemon serves.
    pub repo: PathBuf,
    /// Override for the control socket path.
    pub socket_path: Option<PathBuf>,
    /// Extra config file applied over `.coven/config`.
    pub config_file: Option<PathBuf>,
    /// Start with the scheduler paused instead of running.
    pub start_paused: bool,
}

impl DaemonConfig {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            socket_path: None,
            config_file: None,
            start_paused: false,
        }
    }
}

/// The composed daemon.
pub struct Daemon {
    params: EngineParams,
    scheduler: Arc<Scheduler>,
    broker: Arc<Broker>,
    root_cancel: CancellationToken,
    socket_path: PathBuf,
    start_paused: bool,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("repo", &self.params.repo)
            .field("socket", &self.socket_path)
            .finish()
    }
}

impl Daemon {
    pub fn new(options: DaemonConfig) -> AppResult<Self> {
        let repo = options
            .repo
            .canonicalize()
            .map_err(|e| eyre::eyre!("cannot resolve repo path {}: {e}", options.repo.display()))?;
        git::ensure_repo(&repo)?;

        let coven_dir = repo.join(".coven");
        std::fs::create_dir_all(&coven_dir)?;

        // Config precedence: defaults < .coven/config < --config file.
        let mut config = Config::default();
        let repo_config = coven_dir.join("config");
        if repo_config.exists() {
            config.load_file(&repo_config)?;
        }
        if let Some(extra) = &options.config_file {
            config.load_file(extra)?;
        }

        let broker = Arc::new(Broker::new(config.subscriber_buffer));
        let state = Arc::new(StateStore::load_or_default(
            coven_dir.join("state.json"),
            Arc::clone(&broker),
        )?);

        let processes = Arc::new(ProcessManager::new(
            config.process_timeout(),
            config.grace_period(),
            config.buffer_ceiling_bytes,
        ));
        wire_process_events(&processes, &state);

        let spellbook = Arc::new(Spellbook::load(&coven_dir)?);
        info!(grimoires = ?spellbook.grimoire_names(), "spellbook loaded");

        let worktrees = Arc::new(WorktreeManager::new(&repo));
        let bead_source = Arc::new(CliBeadSource::new(config.bead_cmd.clone(), &repo));

        let socket_path = options
            .socket_path
            .unwrap_or_else(|| coven_dir.join("covend.sock"));

        let root_cancel = CancellationToken::new();
        let params = EngineParams {
            repo,
            coven_dir,
            config,
            spellbook,
            processes,
            state,
            worktrees,
            beads: bead_source,
        };
        let scheduler = Arc::new(Scheduler::new(params.clone(), root_cancel.child_token()));

        Ok(Self {
            params,
            scheduler,
            broker,
            root_cancel,
            socket_path,
            start_paused: options.start_paused,
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.params.state
    }

    /// Run until shutdown: persistence, heartbeat, recovery, scheduler
    /// poller, and the control server.
    pub async fn run(&self) -> AppResult<()> {
        let persister = self.params.state.spawn_persister(
            Duration::from_millis(self.params.config.persist_debounce_ms),
            self.root_cancel.child_token(),
        );

        let heartbeat_state = Arc::clone(&self.params.state);
        let heartbeat = broker::spawn_heartbeat(
            Arc::clone(&self.broker),
            self.params.config.heartbeat_interval(),
            self.root_cancel.child_token(),
            move || heartbeat_state.snapshot_json(),
        );

        // Recover persisted workflows and sweep orphans before accepting
        // new work.
        self.scheduler.recover();

        let workspace = self.params.repo.display().to_string();
        self.params
            .state
            .set_session_running(!self.start_paused, &workspace);

        let poller = tokio::spawn(Arc::clone(&self.scheduler).run_poller());

        let app_state = Arc::new(AppState {
            scheduler: Arc::clone(&self.scheduler),
            state: Arc::clone(&self.params.state),
            processes: Arc::clone(&self.params.processes),
            started_at: Instant::now(),
            workspace,
        });
        let router = server::create_router(app_state);

        info!(repo = %self.params.repo.display(), "covend ready");
        let served = server::serve_unix(&self.socket_path, router, self.root_cancel.child_token())
            .await;

        // Shutdown: give workflows the grace period, then kill survivors
        // and flush state.
        self.root_cancel.cancel();
        let grace = Duration::from_secs(self.params.config.shutdown_grace_sec);
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            if self.scheduler.active_beads().is_empty() {
                break;
            }
            tokio::select! {
                () = &mut deadline => break,
                () = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
        for bead_id in self.params.processes.list_running() {
            warn!(bead = %bead_id, "killing agent at shutdown");
            let _ = self.params.processes.kill(&bead_id).await;
        }
        if let Err(e) = self.params.state.persist_now() {
            warn!(error = %e, "final state flush failed");
        }

        let _ = heartbeat.await;
        let _ = persister.await;
        poller.abort();

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }

        served?;
        Ok(())
    }

    /// Request shutdown; `run` drains and returns.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.root_cancel.cancel();
    }
}

/// Feed process lifecycle and output into the broker and state store.
fn wire_process_events(processes: &Arc<ProcessManager>, state: &Arc<StateStore>) {
    let output_state = Arc::clone(state);
    processes.set_on_output(move |bead_id, line| {
        output_state.broker().publish(
            EventName::AgentOutput,
            EventPayload::AgentOutput(coven_core::events::AgentOutputPayload {
                bead_id: bead_id.to_string(),
                line: line.clone(),
            }),
        );
    });

    let complete_state = Arc::clone(state);
    let weak: Weak<ProcessManager> = Arc::downgrade(processes);
    processes.set_on_complete(move |bead_id, result| {
        let Some(manager) = weak.upgrade() else {
            return;
        };
        let Some(record) = manager.get_info(bead_id) else {
            return;
        };
        complete_state.put_agent(record.clone());
        let name = match result.status {
            AgentStatus::Completed => EventName::AgentCompleted,
            _ => EventName::AgentFailed,
        };
        complete_state.broker().publish(
            name,
            EventPayload::AgentLifecycle(AgentLifecyclePayload {
                bead_id: bead_id.to_string(),
                agent: record,
            }),
        );
    });
}
