//! Background executor.
//!
//! Runs units of work on detached OS threads and reports each one's terminal
//! state exactly once on the [`NotificationBus`]. Handles the work off:
//! - Launch with a classified id (`b…` shell work, `a…` agent work)
//! - Blocking and non-blocking output reads that wake on a completion signal
//! - Cooperative stop through a shared flag
//!
//! A terminal transition is first-wins: the worker's finaliser and `stop()`
//! race for it under the record's mutex, and only the winner publishes.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::BackgroundSettings;
use crate::coordination::notifications::{NotificationBus, NotificationEvent, truncate_summary};
use crate::error::{Error, Result};

/// Output recorded for a task ended by `stop()`.
pub const STOPPED_OUTPUT: &str = "stopped by request";

/// What kind of work a background task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundKind {
    /// Shell-like command work
    Shell,
    /// Agent-like work
    Agent,
}

impl BackgroundKind {
    /// Id prefix for this kind.
    pub fn prefix(&self) -> char {
        match self {
            BackgroundKind::Shell => 'b',
            BackgroundKind::Agent => 'a',
        }
    }

    /// Classify an id by its prefix without looking it up.
    pub fn from_id(id: &str) -> Option<Self> {
        match id.chars().next()? {
            'b' => Some(BackgroundKind::Shell),
            'a' => Some(BackgroundKind::Agent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackgroundKind::Shell => "shell",
            BackgroundKind::Agent => "agent",
        }
    }
}

impl fmt::Display for BackgroundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundStatus {
    Running,
    Completed,
    Error,
    Stopped,
}

impl BackgroundStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackgroundStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackgroundStatus::Running => "running",
            BackgroundStatus::Completed => "completed",
            BackgroundStatus::Error => "error",
            BackgroundStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BackgroundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative cancellation flag handed to every unit of work.
///
/// Work should check it at safe points and return early once it is set.
/// Nothing is killed on its behalf.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn request(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Point-in-time view of a background task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundSnapshot {
    pub task_id: String,
    pub kind: BackgroundKind,
    pub label: String,
    pub status: BackgroundStatus,
    /// Present once the task has left `running`.
    pub output: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackgroundSnapshot {
    /// Text handed back to a caller asking for output.
    pub fn render(&self) -> String {
        match &self.output {
            Some(output) => format!("Task {} {}\n\n{}", self.task_id, self.status, output),
            None => format!("Task {} is still running ({})", self.task_id, self.label),
        }
    }
}

#[derive(Debug)]
struct TerminalState {
    status: BackgroundStatus,
    output: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BackgroundRecord {
    id: String,
    kind: BackgroundKind,
    label: String,
    started_at: DateTime<Utc>,
    state: Mutex<TerminalState>,
    stop: StopToken,
    signal: watch::Sender<BackgroundStatus>,
}

impl BackgroundRecord {
    fn snapshot(&self) -> BackgroundSnapshot {
        let state = lock(&self.state);
        BackgroundSnapshot {
            task_id: self.id.clone(),
            kind: self.kind,
            label: self.label.clone(),
            status: state.status,
            output: state.output.clone(),
            started_at: self.started_at,
            finished_at: state.finished_at,
        }
    }

    /// Make the one terminal transition. Returns false if another path got there first.
    fn finish(&self, bus: &NotificationBus, summary_chars: usize, status: BackgroundStatus, output: String) -> bool {
        {
            let mut state = lock(&self.state);
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.output = Some(output.clone());
            state.finished_at = Some(Utc::now());
        }

        // Queue before signalling so a woken waiter that drains sees the event
        bus.publish(NotificationEvent::new(&self.id, self.kind, status, &output, summary_chars));
        self.signal.send_replace(status);
        log::info!("Background task {} finished: {}", self.id, status);
        true
    }
}

/// Finaliser owned by the worker thread. Whatever happens to the work, the
/// drop runs once and attempts the terminal transition.
struct CompletionGuard {
    record: Arc<BackgroundRecord>,
    bus: NotificationBus,
    summary_chars: usize,
    outcome: Option<(BackgroundStatus, String)>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let (status, output) = self
            .outcome
            .take()
            .unwrap_or_else(|| (BackgroundStatus::Error, "Error: worker exited without a result".to_string()));

        if !self.record.finish(&self.bus, self.summary_chars, status, output) {
            log::debug!(
                "Discarding late {} result of background task {} (already terminal)",
                status,
                self.record.id
            );
        }
    }
}

/// Launches and tracks background work.
#[derive(Clone)]
pub struct BackgroundExecutor {
    tasks: Arc<Mutex<HashMap<String, Arc<BackgroundRecord>>>>,
    bus: NotificationBus,
    settings: BackgroundSettings,
}

impl BackgroundExecutor {
    /// Create an executor that reports completions on `bus`.
    pub fn new(bus: NotificationBus, settings: BackgroundSettings) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            bus,
            settings,
        }
    }

    /// The bus completions are published on.
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Start `work` on its own detached thread and return its id immediately.
    pub fn launch<F>(&self, kind: BackgroundKind, label: impl Into<String>, work: F) -> Result<String>
    where
        F: FnOnce(StopToken) -> eyre::Result<String> + Send + 'static,
    {
        let label = label.into();
        let (signal, _) = watch::channel(BackgroundStatus::Running);

        let record = {
            let mut tasks = lock(&self.tasks);
            let id = loop {
                let candidate = new_id(kind);
                if !tasks.contains_key(&candidate) {
                    break candidate;
                }
            };
            let record = Arc::new(BackgroundRecord {
                id: id.clone(),
                kind,
                label,
                started_at: Utc::now(),
                state: Mutex::new(TerminalState {
                    status: BackgroundStatus::Running,
                    output: None,
                    finished_at: None,
                }),
                stop: StopToken::default(),
                signal,
            });
            tasks.insert(id, record.clone());
            prune_finished(&mut tasks, self.settings.retain_finished);
            record
        };

        let id = record.id.clone();
        let bus = self.bus.clone();
        let summary_chars = self.settings.summary_chars;
        let worker_record = record.clone();

        let spawned = thread::Builder::new().name(format!("bg-{}", id)).spawn(move || {
            let stop = worker_record.stop.clone();
            let mut guard = CompletionGuard {
                record: worker_record,
                bus,
                summary_chars,
                outcome: None,
            };

            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(stop))) {
                Ok(Ok(output)) => (BackgroundStatus::Completed, output),
                Ok(Err(e)) => {
                    log::warn!("Background task {} failed: {:#}", guard.record.id, e);
                    (BackgroundStatus::Error, format!("Error: {:#}", e))
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    log::warn!("Background task {} panicked: {}", guard.record.id, message);
                    (BackgroundStatus::Error, format!("Error: work panicked: {}", message))
                }
            };
            guard.outcome = Some(outcome);
        });

        if let Err(e) = spawned {
            lock(&self.tasks).remove(&id);
            return Err(Error::Spawn(format!("could not start worker for {}: {}", id, e)));
        }

        log::info!("Launched background {} task {}: {}", kind, id, record.label);
        Ok(id)
    }

    /// Launch `command` under the configured shell.
    ///
    /// A non-zero exit still completes; the exit code is in the output. Only a
    /// failure to start the process is an `error`.
    pub fn run_command(&self, command: &str, cwd: Option<&Path>) -> Result<String> {
        let shell = self.settings.shell.clone();
        let max_chars = self.settings.max_output_chars;
        let script = command.to_string();
        let cwd: Option<PathBuf> = cwd.map(Path::to_path_buf);

        self.launch(BackgroundKind::Shell, command, move |stop| {
            let mut cmd = Command::new(&shell);
            cmd.arg("-c").arg(&script);
            if let Some(dir) = &cwd {
                cmd.current_dir(dir);
            }

            let output = cmd
                .output()
                .wrap_err_with(|| format!("failed to run `{}` with {}", script, shell))?;
            if stop.is_stopped() {
                log::debug!("Command `{}` ran to completion after a stop request", script);
            }
            Ok(truncate_summary(&format_command_output(&output), max_chars))
        })
    }

    /// Read a task's state.
    ///
    /// With `block`, waits for the terminal transition or `timeout`, whichever
    /// comes first. A timeout is not an error: the running snapshot comes back.
    pub async fn get_output(&self, task_id: &str, block: bool, timeout: Duration) -> Result<BackgroundSnapshot> {
        let record = self.record(task_id)?;

        if block {
            let mut rx = record.signal.subscribe();
            let timed_out = tokio::time::timeout(timeout, rx.wait_for(|status| status.is_terminal()))
                .await
                .is_err();
            if timed_out {
                log::debug!("Wait on background task {} timed out after {:?}", task_id, timeout);
            }
        }

        Ok(record.snapshot())
    }

    /// Request a cooperative stop.
    ///
    /// The task is marked `stopped` at once; its work keeps running until it
    /// notices the flag. Stopping a finished task changes nothing.
    pub fn stop(&self, task_id: &str) -> Result<BackgroundSnapshot> {
        let record = self.record(task_id)?;
        record.stop.request();

        if !record.finish(
            &self.bus,
            self.settings.summary_chars,
            BackgroundStatus::Stopped,
            STOPPED_OUTPUT.to_string(),
        ) {
            log::debug!("Stop requested for background task {} which already finished", task_id);
        }
        Ok(record.snapshot())
    }

    /// Drop a finished task's record, returning its last snapshot.
    ///
    /// Running tasks cannot be forgotten; stop them first.
    pub fn forget(&self, task_id: &str) -> Result<BackgroundSnapshot> {
        let mut tasks = lock(&self.tasks);
        let record = tasks
            .get(task_id)
            .ok_or_else(|| Error::BackgroundTaskNotFound { id: task_id.to_string() })?;

        let snapshot = record.snapshot();
        if !snapshot.status.is_terminal() {
            return Err(Error::Validation(format!("background task {} is still running", task_id)));
        }
        tasks.remove(task_id);
        log::debug!("Forgot background task {}", task_id);
        Ok(snapshot)
    }

    /// Snapshots of every task, oldest first.
    pub fn list(&self) -> Vec<BackgroundSnapshot> {
        let mut all: Vec<BackgroundSnapshot> = lock(&self.tasks).values().map(|r| r.snapshot()).collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.task_id.cmp(&b.task_id)));
        all
    }

    /// Number of tasks still running.
    pub fn running_count(&self) -> usize {
        lock(&self.tasks)
            .values()
            .filter(|r| !lock(&r.state).status.is_terminal())
            .count()
    }

    fn record(&self, task_id: &str) -> Result<Arc<BackgroundRecord>> {
        lock(&self.tasks)
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::BackgroundTaskNotFound { id: task_id.to_string() })
    }
}

impl fmt::Debug for BackgroundExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundExecutor")
            .field("tasks", &lock(&self.tasks).len())
            .field("bus", &self.bus)
            .finish()
    }
}

/// Evict the longest-finished records beyond `keep`. Running tasks are never evicted.
fn prune_finished(tasks: &mut HashMap<String, Arc<BackgroundRecord>>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, String)> = tasks
        .values()
        .filter_map(|r| lock(&r.state).finished_at.map(|at| (at, r.id.clone())))
        .collect();
    if finished.len() <= keep {
        return;
    }

    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        tasks.remove(&id);
        log::debug!("Evicted finished background task {}", id);
    }
}

fn new_id(kind: BackgroundKind) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}{}", kind.prefix(), &hex[..8])
}

fn format_command_output(output: &Output) -> String {
    let code = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "terminated by signal".to_string());
    format!(
        "Exit code: {}\n\nstdout:\n{}\n\nstderr:\n{}",
        code,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
