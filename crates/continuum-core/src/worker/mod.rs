//! Worker Loop: drives claim -> screen -> execute -> finalise for one task
//! at a time, waking on change notifications or a fallback ticker, and
//! running stale-task recovery on every wake.

use std::time::Duration;

use chrono::Utc;
use continuum_db::error::StoreError;
use continuum_db::models::Task;
use continuum_db::queries::{codes, tasks};
use futures::StreamExt;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::SandboxError;
use crate::sandbox::SandboxManager;
use crate::screener::Screener;
use crate::stats::{CurrentTask, WorkerStats};

/// Number of `Sandbox::execute` attempts before a task is given up on.
const MAX_EXECUTE_ATTEMPTS: u32 = 3;
/// Backoff between execute retries.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Run the worker loop until `cancel` fires.
///
/// Subscribes to the task-change notification channel (best-effort: a
/// failure to subscribe falls back to relying solely on the ticker) and
/// to a fallback ticker at `config.polling_interval`. Each wake runs
/// stale-task recovery followed by at most one claim-and-process cycle.
pub async fn run(
    pool: &PgPool,
    worker_id: Uuid,
    config: &WorkerConfig,
    screener: &dyn Screener,
    sandbox: &SandboxManager,
    stats: &WorkerStats,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let worker_id_str = worker_id.to_string();

    let notifications = match continuum_db::notify::subscribe_changes(pool).await {
        Ok(stream) => Some(Box::pin(stream)),
        Err(err) => {
            warn!(error = %err, "failed to subscribe to task-change notifications, relying on the fallback ticker");
            None
        }
    };
    let mut notifications = notifications;

    let mut ticker = tokio::time::interval(config.polling_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if let Err(err) = recover_stale(pool, stats).await {
            error!(error = %err, "stale-task recovery failed");
        }

        if let Err(err) = process_one_cycle(
            pool,
            &worker_id_str,
            config,
            screener,
            sandbox,
            stats,
            &cancel,
        )
        .await
        {
            error!(error = %err, "claim-and-process cycle failed unexpectedly");
        }

        wait_for_wake(&mut notifications, &mut ticker, &cancel).await;
    }

    info!("worker loop observed cancellation, shutting down");
    Ok(())
}

async fn wait_for_wake(
    notifications: &mut Option<std::pin::Pin<Box<dyn futures::Stream<Item = continuum_db::notify::ChangeNotification> + Send>>>,
    ticker: &mut tokio::time::Interval,
    cancel: &CancellationToken,
) {
    let notified = async {
        match notifications.as_mut() {
            Some(stream) => {
                stream.next().await;
            }
            None => futures::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = notified => {}
        _ = ticker.tick() => {}
        _ = cancel.cancelled() => {}
    }
}

async fn recover_stale(pool: &PgPool, stats: &WorkerStats) -> Result<(), StoreError> {
    match tasks::recover_stale(pool, tasks::STALE_THRESHOLD_SECONDS).await {
        Ok(0) => Ok(()),
        Ok(n) => {
            info!(recovered = n, "recovered stale tasks from crashed workers");
            Ok(())
        }
        Err(err) => {
            stats.increment_database_failures();
            Err(err)
        }
    }
}

/// Claim exactly one eligible task and drive it to a terminal state (or
/// leave it for stale recovery on an unrecoverable store error).
async fn process_one_cycle(
    pool: &PgPool,
    worker_id: &str,
    config: &WorkerConfig,
    screener: &dyn Screener,
    sandbox: &SandboxManager,
    stats: &WorkerStats,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let task = match tasks::claim_one(pool, worker_id, config.min_priority, config.max_priority).await {
        Ok(Some(task)) => task,
        Ok(None) => return Ok(()),
        Err(err) => {
            stats.increment_database_failures();
            return Err(err.into());
        }
    };

    info!(task_id = task.id, task_name = %task.name, "claimed task");

    let script = match codes::resolve_code(pool, task.code).await {
        Ok(script) => script,
        Err(err) => {
            stats.increment_database_failures();
            warn!(task_id = task.id, error = %err, "failed to resolve code reference, leaving task for stale recovery");
            return Ok(());
        }
    };

    if screener.analyze(&script) {
        info!(task_id = task.id, "screener flagged task as malicious");
        if let Err(err) = tasks::mark_malicious(pool, task.id).await {
            stats.increment_database_failures();
            warn!(task_id = task.id, error = %err, "failed to mark task malicious");
        }
        return Ok(());
    }

    stats.set_current_task(Some(CurrentTask {
        task_id: task.id,
        name: task.name.clone(),
    }));
    stats.increment_processed();

    let outcome = execute_with_retry(sandbox, &script, &task, cancel).await;

    match outcome {
        Attempted::Success(stdout) => {
            if let Err(err) = tasks::mark_completed(pool, task.id, &stdout).await {
                stats.increment_database_failures();
                warn!(task_id = task.id, error = %err, "failed to mark task completed");
            } else {
                stats.increment_successful();
            }
        }
        Attempted::Failed(last_error, last_stdout) => {
            if let Err(err) =
                tasks::mark_failed(pool, task.id, &last_error, last_stdout.as_deref()).await
            {
                stats.increment_database_failures();
                warn!(task_id = task.id, error = %err, "failed to mark task failed");
            } else {
                stats.increment_failed();
            }
        }
        Attempted::Cancelled => {
            info!(task_id = task.id, "execution cancelled, leaving task for stale recovery");
        }
    }

    stats.set_current_task(None);
    Ok(())
}

enum Attempted {
    Success(String),
    /// Error message plus any stdout captured by the last attempt, if it
    /// got far enough to run the script (e.g. a non-zero exit). `None`
    /// when the failure never reached a script run.
    Failed(String, Option<String>),
    Cancelled,
}

/// Execute the task's script up to [`MAX_EXECUTE_ATTEMPTS`] times.
///
/// Cancellation is checked before each backoff sleep and observed inside
/// `Sandbox::execute` itself; a cancellation mid-retry aborts without a
/// further store update, per the corrected retry semantics (the upstream
/// source retried on cancellation-shaped errors before checking context).
async fn execute_with_retry(
    sandbox: &SandboxManager,
    script: &str,
    task: &Task,
    cancel: &CancellationToken,
) -> Attempted {
    let payload = serde_json::to_vec(&task.payload).unwrap_or_else(|_| b"{}".to_vec());
    let mut last_error = String::new();
    let mut last_stdout: Option<String> = None;

    for attempt in 1..=MAX_EXECUTE_ATTEMPTS {
        match sandbox.execute(script.as_bytes(), &payload, cancel).await {
            Ok(stdout) => return Attempted::Success(stdout),
            Err(err) if err.is_cancelled() => return Attempted::Cancelled,
            Err(err) => {
                last_error = describe_sandbox_error(&err);
                last_stdout = stdout_from_sandbox_error(&err);
                warn!(
                    task_id = task.id,
                    attempt,
                    error = %last_error,
                    "sandbox execution attempt failed"
                );
            }
        }

        if attempt < MAX_EXECUTE_ATTEMPTS {
            if cancel.is_cancelled() {
                return Attempted::Cancelled;
            }
            tokio::select! {
                _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                _ = cancel.cancelled() => return Attempted::Cancelled,
            }
        }
    }

    Attempted::Failed(last_error, last_stdout)
}

fn describe_sandbox_error(err: &SandboxError) -> String {
    match err {
        SandboxError::NonZeroExit { exit_code, stderr_excerpt, .. } => {
            format!("script exited with status {exit_code}: {stderr_excerpt}")
        }
        other => other.to_string(),
    }
}

/// Stdout captured before a non-zero exit, if the error carries any.
/// Every other sandbox error variant never reached a script run, so there
/// is nothing to persist.
fn stdout_from_sandbox_error(err: &SandboxError) -> Option<String> {
    match err {
        SandboxError::NonZeroExit { stdout, .. } => Some(stdout.clone()),
        _ => None,
    }
}

/// Record a timestamp helper used by tests that need a deterministic
/// "now" without depending on wall-clock skew between assertions.
#[cfg(test)]
pub(crate) fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screener::DenyListScreener;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::sandbox::runtime::{ContainerRuntime, ContainerSpec, ExecOutput};

    struct AlwaysFailRuntime {
        exec_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ContainerRuntime for AlwaysFailRuntime {
        async fn create_container(&self, _name: &str, _spec: &ContainerSpec) -> Result<String, SandboxError> {
            Ok("fake".to_string())
        }
        async fn start_container(&self, _id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn exec(&self, _id: &str, shell_command: &str) -> Result<ExecOutput, SandboxError> {
            if shell_command.contains("python") {
                self.exec_calls.fetch_add(1, Ordering::SeqCst);
                return Ok(ExecOutput {
                    stdout: "partial output before the crash\n".to_string(),
                    stderr: "permanent fault".to_string(),
                    exit_code: 1,
                });
            }
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
        async fn copy_in(&self, _id: &str, _dest: &str, _tar_bytes: Vec<u8>) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn is_running(&self, _id: &str) -> Result<bool, SandboxError> {
            Ok(true)
        }
        async fn remove_container(&self, _id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn list_networks(&self) -> Result<Vec<String>, SandboxError> {
            Ok(vec![])
        }
        async fn create_network(&self, _name: &str) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn sample_task() -> Task {
        Task {
            id: 1,
            name: "t".to_string(),
            description: None,
            status: continuum_db::models::TaskStatus::Running,
            priority: 0,
            payload: serde_json::json!({}),
            code: Uuid::new_v4(),
            worker_id: Some("w1".to_string()),
            started: Some(now()),
            finished: None,
            locked_at: Some(now()),
            last_error: None,
            output: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_yields_failed_with_three_attempts() {
        let exec_calls = Arc::new(AtomicUsize::new(0));
        let runtime = Arc::new(AlwaysFailRuntime {
            exec_calls: exec_calls.clone(),
        });
        let sandbox = SandboxManager::new(
            runtime,
            crate::config::SandboxConfig {
                image: "python:3.9-slim".to_string(),
                memory_mb: 512,
                cpu_limit: 0.5,
                idle_timeout: Duration::from_secs(300),
                network_name: "continuum_sandbox".to_string(),
            },
            "w1".to_string(),
        );

        let task = sample_task();
        let cancel = CancellationToken::new();
        let outcome = execute_with_retry(&sandbox, "raise", &task, &cancel).await;

        match outcome {
            Attempted::Failed(msg, stdout) => {
                assert!(msg.contains("permanent fault"));
                assert_eq!(stdout.as_deref(), Some("partial output before the crash\n"));
            }
            _ => panic!("expected Failed"),
        }
        assert_eq!(exec_calls.load(Ordering::SeqCst), MAX_EXECUTE_ATTEMPTS as usize);
    }

    #[test]
    fn screener_flags_before_execution_would_be_needed() {
        let screener = DenyListScreener::default();
        assert!(screener.analyze("os.system(\"rm -rf /\")"));
    }
}
