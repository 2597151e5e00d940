//! Query functions for the `sync_task_executions` table.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ExecutionStatus, ExecutionType, SyncTaskExecution};

/// Insert a new execution row with status `pending`.
pub async fn insert_execution(
    pool: &PgPool,
    task_id: Uuid,
    execution_type: ExecutionType,
) -> Result<SyncTaskExecution> {
    let exec = sqlx::query_as::<_, SyncTaskExecution>(
        "INSERT INTO sync_task_executions (task_id, execution_type) \
         VALUES ($1, $2) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(execution_type)
    .fetch_one(pool)
    .await
    .context("failed to insert execution")?;

    Ok(exec)
}

/// Fetch a single execution by ID.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<Option<SyncTaskExecution>> {
    let exec =
        sqlx::query_as::<_, SyncTaskExecution>("SELECT * FROM sync_task_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch execution")?;

    Ok(exec)
}

/// List executions for a task, newest first.
pub async fn list_executions_for_task(
    pool: &PgPool,
    task_id: Uuid,
    limit: i64,
) -> Result<Vec<SyncTaskExecution>> {
    let rows = sqlx::query_as::<_, SyncTaskExecution>(
        "SELECT * FROM sync_task_executions \
         WHERE task_id = $1 \
         ORDER BY created_at DESC \
         LIMIT $2",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list executions")?;

    Ok(rows)
}

/// Count executions currently in `running` for a task. Invariant: at most
/// one while the engine holds the task in its running map.
pub async fn count_running_executions(pool: &PgPool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sync_task_executions WHERE task_id = $1 AND status = 'running'",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to count running executions")?;

    Ok(row.0)
}

/// Mark an execution as started: `pending -> running`, stamping
/// `start_time`. Optimistically locked on the current status.
pub async fn start_execution(pool: &PgPool, id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE sync_task_executions \
         SET status = 'running', start_time = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to start execution")?;

    if result.rows_affected() == 0 {
        bail!("execution {id} not found or not pending");
    }

    Ok(())
}

/// Close an execution with its final status and result payload.
///
/// `duration_ms` is computed server-side from `start_time`. Only a
/// `running` execution can be closed.
pub async fn finish_execution(
    pool: &PgPool,
    id: Uuid,
    status: ExecutionStatus,
    processed_rows: i64,
    success_rows: i64,
    error_rows: i64,
    statistics: &serde_json::Value,
    error_message: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE sync_task_executions \
         SET status = $1, \
             end_time = NOW(), \
             processed_rows = $2, \
             success_rows = $3, \
             error_rows = $4, \
             duration_ms = (EXTRACT(EPOCH FROM (NOW() - COALESCE(start_time, NOW()))) * 1000)::bigint, \
             statistics = $5, \
             error_message = $6 \
         WHERE id = $7 AND status = 'running'",
    )
    .bind(status)
    .bind(processed_rows)
    .bind(success_rows)
    .bind(error_rows)
    .bind(statistics)
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish execution")?;

    if result.rows_affected() == 0 {
        bail!("execution {id} not found or not running");
    }

    Ok(())
}

/// Close any executions left dangling in `pending`/`running` for a task.
/// Restart-recovery companion to `tasks::reset_orphaned_tasks`.
pub async fn close_dangling_executions(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sync_task_executions \
         SET status = 'failed', \
             end_time = NOW(), \
             error_message = 'interrupted by restart' \
         WHERE task_id = $1 AND status IN ('pending', 'running')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to close dangling executions")?;

    Ok(result.rows_affected())
}
