//! End-to-end tests of the worker loop against a real Postgres instance,
//! with a fake container runtime standing in for `docker`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use continuum_core::config::{SandboxConfig, WorkerConfig};
use continuum_core::error::SandboxError;
use continuum_core::sandbox::runtime::{ContainerRuntime, ContainerSpec, ExecOutput};
use continuum_core::sandbox::SandboxManager;
use continuum_core::screener::DenyListScreener;
use continuum_core::stats::WorkerStats;
use continuum_db::models::TaskStatus;
use continuum_db::queries::{codes, tasks};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A fake container runtime whose script-exec behaviour is scripted by the
/// test: a queue of results is consumed one per `python` invocation, with
/// the last entry repeating once exhausted.
#[derive(Default)]
struct ScriptedRuntime {
    results: std::sync::Mutex<Vec<ExecOutput>>,
    python_calls: AtomicUsize,
}

impl ScriptedRuntime {
    fn always_succeeding(stdout: &str) -> Self {
        Self {
            results: std::sync::Mutex::new(vec![ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            }]),
            python_calls: AtomicUsize::new(0),
        }
    }

    fn sequence(results: Vec<ExecOutput>) -> Self {
        Self {
            results: std::sync::Mutex::new(results),
            python_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn create_container(&self, _name: &str, _spec: &ContainerSpec) -> Result<String, SandboxError> {
        Ok("fake-container".to_string())
    }

    async fn start_container(&self, _id: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn exec(&self, _id: &str, shell_command: &str) -> Result<ExecOutput, SandboxError> {
        if shell_command.contains("python") {
            let idx = self.python_calls.fetch_add(1, Ordering::SeqCst);
            let results = self.results.lock().unwrap();
            let result = results
                .get(idx)
                .or_else(|| results.last())
                .cloned()
                .unwrap_or(ExecOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                });
            return Ok(result);
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

fn test_worker_config() -> WorkerConfig {
    WorkerConfig {
        polling_interval: Duration::from_secs(5),
        min_priority: 0,
        max_priority: 0,
        sandbox: SandboxConfig {
            image: "python:3.9-slim".to_string(),
            memory_mb: 512,
            cpu_limit: 0.5,
            idle_timeout: Duration::from_secs(300),
            network_name: "continuum_sandbox".to_string(),
        },
    }
}

/// Run the worker loop in the background for up to `timeout`, polling for
/// the task to reach a terminal state, then cancel it.
async fn run_until_terminal(
    pool: sqlx::PgPool,
    sandbox: Arc<SandboxManager>,
    task_id: i64,
    timeout: Duration,
) -> continuum_db::models::Task {
    let config = test_worker_config();
    let screener = DenyListScreener::default();
    let stats = WorkerStats::new(Uuid::new_v4());
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let poll_pool = pool.clone();

    let handle = tokio::spawn(async move {
        let _ = continuum_core::worker::run(
            &pool,
            Uuid::new_v4(),
            &config,
            &screener,
            sandbox.as_ref(),
            &stats,
            cancel_clone,
        )
        .await;
        pool
    });

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(task) = tasks::get_task(&poll_pool, task_id).await.unwrap() {
            if task.status.is_terminal() {
                break;
            }
        }
        if tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
    let pool = handle.await.expect("worker loop task panicked");
    tasks::get_task(&pool, task_id)
        .await
        .unwrap()
        .expect("task should still exist")
}

#[tokio::test]
async fn happy_path_completes_with_output() {
    let (pool, db_name) = continuum_test_utils::create_test_db().await;

    let code = codes::insert_code(&pool, "print('hi')").await.unwrap();
    let task = tasks::insert_task(&pool, "happy", None, 0, serde_json::json!({}), code)
        .await
        .unwrap();

    let runtime = Arc::new(ScriptedRuntime::always_succeeding("hi\n"));
    let sandbox = Arc::new(SandboxManager::new(
        runtime,
        test_worker_config().sandbox,
        "w1".to_string(),
    ));

    let finished = run_until_terminal(pool.clone(), sandbox, task.id, Duration::from_secs(3)).await;

    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(finished.output.as_deref(), Some("hi\n"));
    assert!(finished.started.is_some());
    assert!(finished.finished.is_some());
    assert!(finished.finished.unwrap() >= finished.started.unwrap());

    pool.close().await;
    continuum_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn malicious_script_short_circuits_without_output() {
    let (pool, db_name) = continuum_test_utils::create_test_db().await;

    let code = codes::insert_code(&pool, "print(__pwn__)").await.unwrap();
    let task = tasks::insert_task(&pool, "probe", None, 0, serde_json::json!({}), code)
        .await
        .unwrap();

    let runtime = Arc::new(ScriptedRuntime::always_succeeding("should not run"));
    let sandbox = Arc::new(SandboxManager::new(
        runtime.clone(),
        test_worker_config().sandbox,
        "w1".to_string(),
    ));

    let finished = run_until_terminal(pool.clone(), sandbox, task.id, Duration::from_secs(3)).await;

    assert_eq!(finished.status, TaskStatus::Malicious);
    assert!(finished.output.is_none());
    assert_eq!(runtime.python_calls.load(Ordering::SeqCst), 0);

    pool.close().await;
    continuum_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_then_succeed_reaches_completed() {
    let (pool, db_name) = continuum_test_utils::create_test_db().await;

    let code = codes::insert_code(&pool, "flaky()").await.unwrap();
    let task = tasks::insert_task(&pool, "flaky", None, 0, serde_json::json!({}), code)
        .await
        .unwrap();

    let runtime = Arc::new(ScriptedRuntime::sequence(vec![
        ExecOutput {
            stdout: String::new(),
            stderr: "transient".to_string(),
            exit_code: 1,
        },
        ExecOutput {
            stdout: String::new(),
            stderr: "transient".to_string(),
            exit_code: 1,
        },
        ExecOutput {
            stdout: "finally\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        },
    ]));
    let sandbox = Arc::new(SandboxManager::new(
        runtime.clone(),
        test_worker_config().sandbox,
        "w1".to_string(),
    ));

    let finished = run_until_terminal(pool.clone(), sandbox, task.id, Duration::from_secs(8)).await;

    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(finished.output.as_deref(), Some("finally\n"));
    assert_eq!(runtime.python_calls.load(Ordering::SeqCst), 3);

    pool.close().await;
    continuum_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn exhausted_retries_marks_task_failed() {
    let (pool, db_name) = continuum_test_utils::create_test_db().await;

    let code = codes::insert_code(&pool, "always_raises()").await.unwrap();
    let task = tasks::insert_task(&pool, "doomed", None, 0, serde_json::json!({}), code)
        .await
        .unwrap();

    let runtime = Arc::new(ScriptedRuntime::sequence(vec![ExecOutput {
        stdout: "partial output before the crash\n".to_string(),
        stderr: "permanent failure".to_string(),
        exit_code: 1,
    }]));
    let sandbox = Arc::new(SandboxManager::new(
        runtime.clone(),
        test_worker_config().sandbox,
        "w1".to_string(),
    ));

    let finished = run_until_terminal(pool.clone(), sandbox, task.id, Duration::from_secs(8)).await;

    assert_eq!(finished.status, TaskStatus::Failed);
    assert!(finished.last_error.as_deref().unwrap().contains("1"));
    assert_eq!(
        finished.output.as_deref(),
        Some("partial output before the crash\n")
    );
    assert_eq!(runtime.python_calls.load(Ordering::SeqCst), 3);

    pool.close().await;
    continuum_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stale_task_is_recovered_on_first_wake() {
    let (pool, db_name) = continuum_test_utils::create_test_db().await;

    let code = codes::insert_code(&pool, "pass").await.unwrap();
    let ghost_locked_at = chrono::Utc::now() - chrono::Duration::hours(2);
    let ghost = tasks::seed_running_task(&pool, "ghost", code, "dead-worker", ghost_locked_at)
        .await
        .unwrap();

    let runtime = Arc::new(ScriptedRuntime::always_succeeding("unused"));
    let sandbox = Arc::new(SandboxManager::new(
        runtime,
        test_worker_config().sandbox,
        "w1".to_string(),
    ));

    let finished = run_until_terminal(pool.clone(), sandbox, ghost.id, Duration::from_secs(3)).await;

    assert_eq!(finished.status, TaskStatus::Failed);
    assert!(finished
        .last_error
        .as_deref()
        .unwrap()
        .contains("crash"));

    pool.close().await;
    continuum_test_utils::drop_test_db(&db_name).await;
}
