//! Database query functions for the `tasks` table: claim, transition, and
//! recovery operations.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::StoreError;
use crate::models::Task;

/// Default staleness threshold for [`recover_stale`]: one hour.
pub const STALE_THRESHOLD_SECONDS: i64 = 60 * 60;

/// Claim exactly one eligible task for `worker_id`.
///
/// Selects the highest-priority `pending` row within `[min_priority,
/// max_priority]` (a zero bound means unbounded on that side), locking it
/// with `FOR UPDATE SKIP LOCKED` so contended rows are skipped rather than
/// awaited, then transitions it to `running` in the same statement.
/// Returns the task as observed *before* the update, for logging; the
/// caller should treat `status` as already logically `running`.
pub async fn claim_one(
    pool: &PgPool,
    worker_id: &str,
    min_priority: i32,
    max_priority: i32,
) -> Result<Option<Task>, StoreError> {
    let task = sqlx::query_as::<_, Task>(
        "WITH claimable AS ( \
            SELECT id FROM tasks \
            WHERE status = 'pending' \
              AND locked_at IS NULL \
              AND ($1 = 0 OR priority >= $1) \
              AND ($2 = 0 OR priority <= $2) \
            ORDER BY priority ASC, id ASC \
            LIMIT 1 \
            FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE tasks \
         SET status = 'running', worker_id = $3, locked_at = NOW(), started = NOW() \
         WHERE id IN (SELECT id FROM claimable) \
         RETURNING *",
    )
    .bind(min_priority)
    .bind(max_priority)
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;

    Ok(task)
}

/// Set a task's status to `malicious`. Terminal; no timestamps altered.
pub async fn mark_malicious(pool: &PgPool, task_id: i64) -> Result<(), StoreError> {
    sqlx::query("UPDATE tasks SET status = 'malicious' WHERE id = $1")
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Set a task's status to `completed`, recording its stdout.
pub async fn mark_completed(pool: &PgPool, task_id: i64, output: &str) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE tasks SET status = 'completed', finished = NOW(), output = $1 WHERE id = $2",
    )
    .bind(output)
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Set a task's status to `failed`, recording the error message and any
/// stdout the script produced before exiting non-zero. `output` is `None`
/// when the failure never reached a script run (e.g. a bring-up error).
pub async fn mark_failed(
    pool: &PgPool,
    task_id: i64,
    error_message: &str,
    output: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE tasks SET status = 'failed', finished = NOW(), last_error = $1, output = $2 WHERE id = $3",
    )
    .bind(error_message)
    .bind(output)
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Transition every stale `running` task (locked before the threshold) to
/// `failed`. Returns the number of rows recovered.
pub async fn recover_stale(pool: &PgPool, stale_threshold_seconds: i64) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', finished = NOW(), last_error = 'timeout/worker crash' \
         WHERE status = 'running' \
           AND locked_at < NOW() - ($1 || ' seconds')::interval",
    )
    .bind(stale_threshold_seconds.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Fetch a single task by id, mostly useful for tests and diagnostics.
pub async fn get_task(pool: &PgPool, id: i64) -> Result<Option<Task>, StoreError> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(task)
}

/// Insert a new pending task. Used by tests and any external enqueue path.
pub async fn insert_task(
    pool: &PgPool,
    name: &str,
    description: Option<&str>,
    priority: i32,
    payload: serde_json::Value,
    code: uuid::Uuid,
) -> Result<Task, StoreError> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (name, description, priority, payload, code) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(name)
    .bind(description)
    .bind(priority)
    .bind(payload)
    .bind(code)
    .fetch_one(pool)
    .await?;

    Ok(task)
}

/// Directly seed a `running` row with an explicit `locked_at`, for
/// exercising [`recover_stale`] deterministically in tests.
pub async fn seed_running_task(
    pool: &PgPool,
    name: &str,
    code: uuid::Uuid,
    worker_id: &str,
    locked_at: DateTime<Utc>,
) -> Result<Task, StoreError> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (name, status, payload, code, worker_id, started, locked_at) \
         VALUES ($1, 'running', '{}'::json, $2, $3, $4, $4) \
         RETURNING *",
    )
    .bind(name)
    .bind(code)
    .bind(worker_id)
    .bind(locked_at)
    .fetch_one(pool)
    .await?;

    Ok(task)
}
