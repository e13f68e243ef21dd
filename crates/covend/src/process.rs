//! Agent subprocess management.
//!
//! Spawns each agent in its own process group so descendants can be
//! signalled together, scans stdout/stderr line by line into a bounded
//! output ring, and exposes stdin injection for answering questions.
//! Termination escalates: SIGTERM to the group, a grace period, then
//! SIGKILL. Completion is classified exactly once per process.

use crate::ring::OutputRing;
use chrono::Utc;
use coven_core::{AgentRecord, AgentStatus, OutputLine, OutputStream};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum accepted size for one stdin response.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Grace between SIGTERM and SIGKILL when none is configured.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Wait after SIGKILL before giving up on the monitor.
const KILL_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("agent already running for bead {0}")]
    AlreadyRunning(String),
    #[error("no agent process for bead {0}")]
    NotFound(String),
    #[error("failed to spawn agent: {0}")]
    Spawn(std::io::Error),
    #[error("agent stdin closed for bead {0}")]
    StdinClosed(String),
    #[error("response exceeds {MAX_RESPONSE_BYTES} bytes")]
    ResponseTooLarge,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Parameters for one agent spawn.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub bead_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub branch: String,
    /// Step-level deadline; the manager default applies when absent.
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
}

/// Final classification of a finished process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    pub status: AgentStatus,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

type OutputCallback = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;
type CompleteCallback = Arc<dyn Fn(&str, ProcessResult) + Send + Sync>;

struct ProcessEntry {
    record: Mutex<AgentRecord>,
    ring: Arc<OutputRing>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    cancel: CancellationToken,
    done_rx: watch::Receiver<Option<ProcessResult>>,
    pid: u32,
}

impl ProcessEntry {
    fn result(&self) -> Option<ProcessResult> {
        *self.done_rx.borrow()
    }

    fn is_running(&self) -> bool {
        self.result().is_none()
    }
}

/// Table of live and recently finished agent processes, keyed by bead id.
pub struct ProcessManager {
    table: Mutex<HashMap<String, Arc<ProcessEntry>>>,
    default_timeout: Duration,
    grace: Duration,
    ring_ceiling: usize,
    on_output: Mutex<Option<OutputCallback>>,
    on_complete: Mutex<Option<CompleteCallback>>,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("default_timeout", &self.default_timeout)
            .field("grace", &self.grace)
            .finish()
    }
}

impl ProcessManager {
    pub fn new(default_timeout: Duration, grace: Duration, ring_ceiling: usize) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            default_timeout,
            grace,
            ring_ceiling,
            on_output: Mutex::new(None),
            on_complete: Mutex::new(None),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            Duration::from_secs(30 * 60),
            DEFAULT_GRACE,
            crate::ring::DEFAULT_CEILING_BYTES,
        )
    }

    /// Observe every captured output line.
    pub fn set_on_output<F>(&self, f: F)
    where
        F: Fn(&str, &OutputLine) + Send + Sync + 'static,
    {
        *lock(&self.on_output) = Some(Arc::new(f));
    }

    /// Observe completion; fires exactly once per process.
    pub fn set_on_complete<F>(&self, f: F)
    where
        F: Fn(&str, ProcessResult) + Send + Sync + 'static,
    {
        *lock(&self.on_complete) = Some(Arc::new(f));
    }

    /// Spawn an agent for a bead. Refuses while one is still running.
    pub async fn spawn(&self, config: SpawnConfig) -> Result<AgentRecord> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .current_dir(&config.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        // The slot check and the fork happen under the table lock so two
        // spawns for the same bead cannot race past each other.
        let mut table = lock(&self.table);
        if let Some(existing) = table.get(&config.bead_id) {
            if existing.is_running() {
                return Err(ProcessError::AlreadyRunning(config.bead_id.clone()));
            }
        }

        let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
        let pid = child.id().unwrap_or_default();

        debug!(bead = %config.bead_id, pid, program = %config.program, "agent spawned");

        let ring = Arc::new(OutputRing::new(self.ring_ceiling));
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let record = AgentRecord {
            bead_id: config.bead_id.clone(),
            pid: Some(pid),
            status: AgentStatus::Running,
            worktree: config.cwd.display().to_string(),
            branch: config.branch.clone(),
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            timed_out: false,
        };

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);

        let entry = Arc::new(ProcessEntry {
            record: Mutex::new(record.clone()),
            ring: Arc::clone(&ring),
            stdin: AsyncMutex::new(stdin),
            cancel: cancel.clone(),
            done_rx,
            pid,
        });

        table.insert(config.bead_id.clone(), Arc::clone(&entry));
        drop(table);

        // Stream readers: one task per stream, feeding ring + callback.
        let on_output = lock(&self.on_output).clone();
        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(spawn_reader(
                config.bead_id.clone(),
                OutputStream::Stdout,
                stdout,
                Arc::clone(&ring),
                on_output.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            readers.push(spawn_reader(
                config.bead_id.clone(),
                OutputStream::Stderr,
                stderr,
                Arc::clone(&ring),
                on_output,
            ));
        }

        // Monitor: classifies the exit exactly once.
        let timeout = config.timeout.unwrap_or(self.default_timeout);
        let grace = self.grace;
        let bead_id = config.bead_id.clone();
        let on_complete = lock(&self.on_complete).clone();
        let monitor_entry = Arc::clone(&entry);

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            let result = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => classify_exit(status.code()),
                    Err(e) => {
                        warn!(bead = %bead_id, error = %e, "wait on agent failed");
                        ProcessResult {
                            status: AgentStatus::Failed,
                            exit_code: None,
                            timed_out: false,
                        }
                    }
                },
                () = &mut deadline => {
                    info!(bead = %bead_id, timeout_sec = timeout.as_secs(), "agent timed out");
                    terminate_group(pid, grace).await;
                    let _ = tokio::time::timeout(KILL_SETTLE, child.wait()).await;
                    ProcessResult {
                        status: AgentStatus::Failed,
                        exit_code: None,
                        timed_out: true,
                    }
                },
                () = monitor_entry.cancel.cancelled() => {
                    terminate_group(pid, grace).await;
                    let exit = tokio::time::timeout(KILL_SETTLE, child.wait()).await;
                    let exit_code = exit.ok().and_then(|r| r.ok()).and_then(|s| s.code());
                    ProcessResult {
                        status: AgentStatus::Killed,
                        exit_code,
                        timed_out: false,
                    }
                },
            };

            // Drain the scanners so every line is in the ring before the
            // completion callback observes the process as finished.
            for reader in readers {
                let _ = reader.await;
            }

            {
                let mut record = lock(&monitor_entry.record);
                record.status = result.status;
                record.exit_code = result.exit_code;
                record.timed_out = result.timed_out;
                record.ended_at = Some(Utc::now());
            }

            // Closing stdin unblocks any pending respond().
            monitor_entry.stdin.lock().await.take();

            let _ = done_tx.send(Some(result));
            info!(
                bead = %bead_id,
                status = result.status.as_str(),
                exit_code = ?result.exit_code,
                timed_out = result.timed_out,
                "agent finished"
            );
            if let Some(callback) = on_complete {
                callback(&bead_id, result);
            }
        });

        Ok(record)
    }

    fn entry(&self, bead_id: &str) -> Result<Arc<ProcessEntry>> {
        lock(&self.table)
            .get(bead_id)
            .cloned()
            .ok_or_else(|| ProcessError::NotFound(bead_id.to_string()))
    }

    /// Graceful stop: SIGTERM the group, wait the grace period, escalate
    /// to SIGKILL. A no-op for finished or unknown processes.
    pub async fn stop(&self, bead_id: &str) -> Result<()> {
        let Ok(entry) = self.entry(bead_id) else {
            return Ok(());
        };
        if !entry.is_running() {
            return Ok(());
        }
        signal_group(entry.pid, "TERM").await;
        let mut done = entry.done_rx.clone();
        let finished = tokio::time::timeout(self.grace, async {
            while done.borrow().is_none() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if finished.is_err() {
            signal_group(entry.pid, "KILL").await;
            entry.cancel.cancel();
            let _ = tokio::time::timeout(KILL_SETTLE, self.wait_for_completion(bead_id)).await;
        }
        Ok(())
    }

    /// Forced stop: SIGKILL the group immediately. Idempotent.
    pub async fn kill(&self, bead_id: &str) -> Result<()> {
        let Ok(entry) = self.entry(bead_id) else {
            return Ok(());
        };
        if !entry.is_running() {
            return Ok(());
        }
        signal_group(entry.pid, "KILL").await;
        entry.cancel.cancel();
        Ok(())
    }

    /// Cancel via the process's token; used by workflow cancellation so
    /// the classification is `killed`.
    pub fn cancel(&self, bead_id: &str) {
        if let Ok(entry) = self.entry(bead_id) {
            entry.cancel.cancel();
        }
    }

    /// Write a sanitised response line to the agent's stdin.
    pub async fn respond(&self, bead_id: &str, text: &str) -> Result<()> {
        if text.len() > MAX_RESPONSE_BYTES {
            return Err(ProcessError::ResponseTooLarge);
        }
        let entry = self.entry(bead_id)?;
        let mut guard = entry.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(ProcessError::StdinClosed(bead_id.to_string()));
        };

        let mut line = sanitize_response(text);
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            *guard = None;
            warn!(bead = bead_id, error = %e, "agent stdin write failed");
            return Err(ProcessError::StdinClosed(bead_id.to_string()));
        }
        stdin.flush().await.map_err(|_| {
            ProcessError::StdinClosed(bead_id.to_string())
        })?;
        Ok(())
    }

    pub fn get_info(&self, bead_id: &str) -> Option<AgentRecord> {
        lock(&self.table)
            .get(bead_id)
            .map(|entry| lock(&entry.record).clone())
    }

    pub fn get_output(&self, bead_id: &str) -> Result<Vec<OutputLine>> {
        Ok(self.entry(bead_id)?.ring.get_all())
    }

    pub fn get_output_since(&self, bead_id: &str, after_seq: u64) -> Result<Vec<OutputLine>> {
        Ok(self.entry(bead_id)?.ring.get_since(after_seq))
    }

    pub fn get_result(&self, bead_id: &str) -> Option<ProcessResult> {
        lock(&self.table).get(bead_id).and_then(|e| e.result())
    }

    pub fn is_running(&self, bead_id: &str) -> bool {
        lock(&self.table)
            .get(bead_id)
            .map(|e| e.is_running())
            .unwrap_or(false)
    }

    pub fn list_running(&self) -> Vec<String> {
        let mut running: Vec<String> = lock(&self.table)
            .iter()
            .filter(|(_, e)| e.is_running())
            .map(|(id, _)| id.clone())
            .collect();
        running.sort();
        running
    }

    /// Block until the process finishes; returns its classification.
    pub async fn wait_for_completion(&self, bead_id: &str) -> Result<ProcessResult> {
        let entry = self.entry(bead_id)?;
        let mut done = entry.done_rx.clone();
        loop {
            if let Some(result) = *done.borrow() {
                return Ok(result);
            }
            if done.changed().await.is_err() {
                // Monitor dropped without publishing; treat as failed.
                return Ok(ProcessResult {
                    status: AgentStatus::Failed,
                    exit_code: None,
                    timed_out: false,
                });
            }
        }
    }

    /// Drop the table entry for a finished process. Running processes are
    /// left alone.
    pub fn cleanup(&self, bead_id: &str) {
        let mut table = lock(&self.table);
        if let Some(entry) = table.get(bead_id) {
            if !entry.is_running() {
                table.remove(bead_id);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn classify_exit(code: Option<i32>) -> ProcessResult {
    match code {
        Some(0) => ProcessResult {
            status: AgentStatus::Completed,
            exit_code: Some(0),
            timed_out: false,
        },
        Some(code) => ProcessResult {
            status: AgentStatus::Failed,
            exit_code: Some(code),
            timed_out: false,
        },
        // No code means the process died to a signal.
        None => ProcessResult {
            status: AgentStatus::Killed,
            exit_code: None,
            timed_out: false,
        },
    }
}

/// Send a signal to the process group. A missing group (ESRCH) is fine:
/// the process already exited.
async fn signal_group(pid: u32, signal: &str) {
    if pid == 0 {
        return;
    }
    let target = format!("-{pid}");
    match Command::new("kill")
        .args(["-s", signal, "--", &target])
        .output()
        .await
    {
        Ok(output) if !output.status.success() => {
            debug!(pid, signal, "kill reported no such process group");
        }
        Ok(_) => {}
        Err(e) => warn!(pid, signal, error = %e, "failed to run kill"),
    }
}

/// SIGTERM, grace, SIGKILL.
async fn terminate_group(pid: u32, grace: Duration) {
    signal_group(pid, "TERM").await;
    tokio::time::sleep(grace).await;
    signal_group(pid, "KILL").await;
}

/// Strip control characters that could fake terminal input; keep tabs.
fn sanitize_response(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\t')
        .collect()
}

fn spawn_reader<R>(
    bead_id: String,
    stream: OutputStream,
    source: R,
    ring: Arc<OutputRing>,
    on_output: Option<OutputCallback>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(source).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let sequence = ring.write(stream, &line);
                    if let Some(callback) = &on_output {
                        // Fetch the stored line; the ring may have
                        // truncated an oversized payload.
                        if let Some(stored) = ring.get(sequence) {
                            callback(&bead_id, &stored);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(bead = %bead_id, stream = stream.as_str(), error = %e, "output scanner stopped");
                    break;
                }
            }
        }
    })
}
