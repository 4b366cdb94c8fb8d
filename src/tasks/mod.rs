//! Background task manager: cancellable off-loop operations (shell commands,
//! subagent runs) whose partial output is pollable by id. Grounded in the
//! teacher's `BashTool` (timeout/output-capture/truncation shape, in
//! `bash.rs`) for the shell flavor and `SubAgentTool` (`sub_agent.rs`) for
//! the nested-loop flavor; the manager itself generalizes both into a single
//! `Launch(id, fn)` contract rather than being tied to either.

mod shell;
mod subagent;

pub use shell::shell_task;
pub use subagent::subagent_task;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

/// Why a task's `fn` stopped producing output. `Cancelled` is distinguished
/// from `Other` because the manager classifies cancellation as *stopped*,
/// not *failed*.
#[derive(Debug, Clone)]
pub enum TaskRunError {
    Cancelled,
    Other(String),
}

pub type TaskFuture = std::pin::Pin<Box<dyn Future<Output = (String, Option<TaskRunError>)> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("task already exists: {0}")]
    AlreadyExists(String),
    #[error("task '{0}' is not running")]
    NotRunning(String),
    #[error("timed out waiting for task '{0}' to stop")]
    StopTimedOut(String),
}

struct TaskState {
    status: TaskStatus,
    output: String,
    error: Option<String>,
}

/// A snapshot returned by `GetOutput` — a copy, never a live view, so
/// callers can't observe the task mutating underneath them.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub status: TaskStatus,
    pub output: String,
    pub error: Option<String>,
    pub timed_out: bool,
}

pub struct BackgroundTask {
    id: String,
    cancel: CancellationToken,
    state: Mutex<TaskState>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    start_time: Instant,
}

impl BackgroundTask {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> Instant {
        self.start_time
    }

    fn snapshot(&self) -> TaskOutput {
        let state = self.state.lock().unwrap();
        TaskOutput {
            status: state.status,
            output: state.output.clone(),
            error: state.error.clone(),
            timed_out: false,
        }
    }
}

/// Tracks all live and finished background tasks for a session. Tasks are
/// never removed automatically — callers that want cleanup poll `GetOutput`
/// and drop their own references; `spec.md` §4.4 doesn't describe eviction.
#[derive(Default)]
pub struct TaskManager {
    tasks: std::sync::RwLock<HashMap<String, Arc<BackgroundTask>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `f` concurrently under a derived cancellable token, storing the
    /// task under `id`. `f` must itself honor cancellation — the manager only
    /// requests it, it cannot force a future to stop early.
    pub fn launch<F, Fut>(&self, id: impl Into<String>, f: F) -> Result<Arc<BackgroundTask>, TaskError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = (String, Option<TaskRunError>)> + Send + 'static,
    {
        let id = id.into();
        {
            let tasks = self.tasks.read().unwrap();
            if tasks.contains_key(&id) {
                return Err(TaskError::AlreadyExists(id));
            }
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let task = Arc::new(BackgroundTask {
            id: id.clone(),
            cancel: cancel.clone(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Running,
                output: String::new(),
                error: None,
            }),
            done_tx,
            done_rx,
        start_time: Instant::now(),
        });

        let running = task.clone();
        tokio::spawn(async move {
            let (output, outcome) = f(cancel).await;
            let status = match &outcome {
                None => TaskStatus::Completed,
                Some(TaskRunError::Cancelled) => TaskStatus::Stopped,
                Some(TaskRunError::Other(_)) => TaskStatus::Failed,
            };
            {
                let mut state = running.state.lock().unwrap();
                state.output.push_str(&output);
                if let Some(TaskRunError::Other(message)) = outcome {
                    state.error = Some(message);
                }
                state.status = status;
            }
            let _ = running.done_tx.send(true);
        });

        self.tasks.write().unwrap().insert(id, task.clone());
        Ok(task)
    }

    fn lookup(&self, id: &str) -> Result<Arc<BackgroundTask>, TaskError> {
        self.tasks
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// `block=false` snapshots immediately. `block=true` waits for the
    /// done-signal up to `timeout`; on timeout the task keeps running and the
    /// snapshot comes back with `timed_out` set.
    pub async fn get_output(&self, id: &str, block: bool, timeout: Duration) -> Result<TaskOutput, TaskError> {
        let task = self.lookup(id)?;
        if !block {
            return Ok(task.snapshot());
        }

        let mut done_rx = task.done_rx.clone();
        if *done_rx.borrow() {
            return Ok(task.snapshot());
        }

        match tokio::time::timeout(timeout, done_rx.changed()).await {
            Ok(_) => Ok(task.snapshot()),
            Err(_) => {
                let mut snapshot = task.snapshot();
                snapshot.timed_out = true;
                Ok(snapshot)
            }
        }
    }

    /// Requires the task to be *running*; cancels it and waits up to 5s for
    /// acknowledgement. A second `Stop` on the same task fails — it is no
    /// longer running by then.
    pub async fn stop(&self, id: &str) -> Result<(), TaskError> {
        let task = self.lookup(id)?;
        {
            let state = task.state.lock().unwrap();
            if state.status != TaskStatus::Running {
                return Err(TaskError::NotRunning(id.to_string()));
            }
        }

        task.cancel.cancel();

        let mut done_rx = task.done_rx.clone();
        if *done_rx.borrow() {
            return Ok(());
        }
        match tokio::time::timeout(Duration::from_secs(5), done_rx.changed()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(TaskError::StopTimedOut(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_and_block_get_output_returns_final_result() {
        let manager = TaskManager::new();
        manager
            .launch("t1", |_cancel| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ("done".to_string(), None)
            })
            .unwrap();

        let out = manager.get_output("t1", true, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.status, TaskStatus::Completed);
        assert_eq!(out.output, "done");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn non_blocking_get_output_before_completion_is_a_snapshot() {
        let manager = TaskManager::new();
        manager
            .launch("t1", |_cancel| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ("late".to_string(), None)
            })
            .unwrap();

        let out = manager.get_output("t1", false, Duration::from_millis(0)).await.unwrap();
        assert_eq!(out.status, TaskStatus::Running);
        assert_eq!(out.output, "");
    }

    #[tokio::test]
    async fn blocking_get_output_times_out_while_task_keeps_running() {
        let manager = TaskManager::new();
        manager
            .launch("t1", |cancel| async move {
                cancel.cancelled().await;
                ("stopped early".to_string(), Some(TaskRunError::Cancelled))
            })
            .unwrap();

        let out = manager.get_output("t1", true, Duration::from_millis(20)).await.unwrap();
        assert!(out.timed_out);
        assert_eq!(out.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn stop_transitions_a_blocked_task_to_stopped() {
        let manager = TaskManager::new();
        manager
            .launch("t1", |cancel| async move {
                cancel.cancelled().await;
                ("stopped".to_string(), Some(TaskRunError::Cancelled))
            })
            .unwrap();

        manager.stop("t1").await.unwrap();
        let out = manager.get_output("t1", true, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.status, TaskStatus::Stopped);

        let second_stop = manager.stop("t1").await;
        assert!(matches!(second_stop, Err(TaskError::NotRunning(_))));
    }

    #[tokio::test]
    async fn failed_task_keeps_its_error_alongside_output() {
        let manager = TaskManager::new();
        manager
            .launch("t1", |_cancel| async move {
                ("partial output".to_string(), Some(TaskRunError::Other("boom".into())))
            })
            .unwrap();

        let out = manager.get_output("t1", true, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.status, TaskStatus::Failed);
        assert_eq!(out.output, "partial output");
        assert_eq!(out.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_id_is_an_error_for_every_operation() {
        let manager = TaskManager::new();
        assert!(matches!(
            manager.get_output("missing", false, Duration::from_secs(0)).await,
            Err(TaskError::NotFound(_))
        ));
        assert!(matches!(manager.stop("missing").await, Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_launch_is_rejected() {
        let manager = TaskManager::new();
        manager.launch("t1", |_c| async move { ("a".to_string(), None) }).unwrap();
        let second = manager.launch("t1", |_c| async move { ("b".to_string(), None) });
        assert!(matches!(second, Err(TaskError::AlreadyExists(_))));
    }
}
