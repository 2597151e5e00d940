//! Query functions for the `sync_tasks` table, including the task status
//! machine.
//!
//! The allowed transition graph:
//!
//! ```text
//! pending -> running
//! pending -> cancelled
//! running -> success | failed | cancelled | paused
//! paused  -> running | cancelled
//! failed  -> pending   (retry)
//! ```
//!
//! Every transition goes through [`transition_task_status`], which rejects
//! edges outside the graph and uses optimistic locking (`WHERE status =
//! $from`) so concurrent writers cannot race a task into an illegal state.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{LibraryType, SyncTask, SyncType, TaskStatus};

/// Check whether a transition from `from` to `to` is a valid edge in the
/// task status graph.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Pending, TaskStatus::Cancelled)
            | (TaskStatus::Running, TaskStatus::Success)
            | (TaskStatus::Running, TaskStatus::Failed)
            | (TaskStatus::Running, TaskStatus::Cancelled)
            | (TaskStatus::Running, TaskStatus::Paused)
            | (TaskStatus::Paused, TaskStatus::Running)
            | (TaskStatus::Paused, TaskStatus::Cancelled)
            | (TaskStatus::Failed, TaskStatus::Pending)
    )
}

/// Insert a new sync task with status `pending`. Returns the inserted row.
pub async fn insert_task(
    pool: &PgPool,
    library_type: LibraryType,
    library_id: Uuid,
    datasource_id: Uuid,
    sync_type: SyncType,
    config: &serde_json::Value,
    created_by: Option<&str>,
    scheduler_id: Option<&str>,
) -> Result<SyncTask> {
    let task = sqlx::query_as::<_, SyncTask>(
        "INSERT INTO sync_tasks \
         (library_type, library_id, datasource_id, sync_type, config, created_by, scheduler_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(library_type)
    .bind(library_id)
    .bind(datasource_id)
    .bind(sync_type)
    .bind(config)
    .bind(created_by)
    .bind(scheduler_id)
    .fetch_one(pool)
    .await
    .context("failed to insert sync task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<SyncTask>> {
    let task = sqlx::query_as::<_, SyncTask>("SELECT * FROM sync_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch sync task")?;

    Ok(task)
}

/// Find the newest task matching the legacy (library, datasource, sync
/// type) entrypoint.
pub async fn find_latest_task(
    pool: &PgPool,
    library_type: LibraryType,
    library_id: Uuid,
    datasource_id: Uuid,
    sync_type: SyncType,
) -> Result<Option<SyncTask>> {
    let task = sqlx::query_as::<_, SyncTask>(
        "SELECT * FROM sync_tasks \
         WHERE library_type = $1 AND library_id = $2 \
           AND datasource_id = $3 AND sync_type = $4 \
         ORDER BY created_at DESC \
         LIMIT 1",
    )
    .bind(library_type)
    .bind(library_id)
    .bind(datasource_id)
    .bind(sync_type)
    .fetch_optional(pool)
    .await
    .context("failed to find latest sync task")?;

    Ok(task)
}

/// List tasks by status, newest first.
pub async fn list_tasks_by_status(pool: &PgPool, status: TaskStatus) -> Result<Vec<SyncTask>> {
    let tasks = sqlx::query_as::<_, SyncTask>(
        "SELECT * FROM sync_tasks WHERE status = $1 ORDER BY created_at DESC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list sync tasks by status")?;

    Ok(tasks)
}

/// Execute a status transition with optimistic locking.
///
/// - Rejects edges outside the transition graph.
/// - Sets `start_time` when entering `running` from `pending` (a resume
///   from `paused` keeps the original start).
/// - Sets `end_time` when entering a terminal status.
/// - Writes `error_message` when provided (and clears it on
///   `failed -> pending` retry).
///
/// Returns an error if the transition is invalid, the task does not
/// exist, or the current status no longer matches `from`.
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    error_message: Option<&str>,
) -> Result<()> {
    if !is_valid_transition(from, to) {
        bail!(
            "invalid status transition: {} -> {} for task {}",
            from,
            to,
            task_id
        );
    }

    let start_time = if from == TaskStatus::Pending && to == TaskStatus::Running {
        Some(Utc::now())
    } else {
        None
    };

    let end_time = if to.is_terminal() { Some(Utc::now()) } else { None };

    // A retry wipes the previous failure; other transitions only overwrite
    // the error when a new one is supplied.
    let clear_error = from == TaskStatus::Failed && to == TaskStatus::Pending;

    let result = sqlx::query(
        "UPDATE sync_tasks \
         SET status = $1, \
             start_time = COALESCE($2, start_time), \
             end_time = COALESCE($3, end_time), \
             error_message = CASE WHEN $4 THEN NULL ELSE COALESCE($5, error_message) END \
         WHERE id = $6 AND status = $7",
    )
    .bind(to)
    .bind(start_time)
    .bind(end_time)
    .bind(clear_error)
    .bind(error_message)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .with_context(|| format!("failed to transition task {task_id} from {from} to {to}"))?;

    if result.rows_affected() == 0 {
        // Either the task does not exist or the status did not match.
        let task = get_task(pool, task_id).await?;
        match task {
            None => bail!("task {} not found", task_id),
            Some(t) => bail!(
                "optimistic lock failed: task {} has status {}, expected {}",
                task_id,
                t.status,
                from
            ),
        }
    }

    Ok(())
}

/// Reset a finished (or still pending) task for a manual re-run: status
/// back to `running`, error cleared, `start_time` stamped.
///
/// This is the operator path that collapses `failed -> pending -> running`
/// into one statement; strategy-driven transitions never use it. Returns
/// the number of rows affected (0 when the task is currently `running` or
/// `paused`, which cannot be re-run).
pub async fn rerun_task(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sync_tasks \
         SET status = 'running', \
             error_message = NULL, \
             start_time = NOW(), \
             end_time = NULL \
         WHERE id = $1 AND status IN ('pending', 'success', 'failed', 'cancelled')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to reset task for re-run")?;

    Ok(result.rows_affected())
}

/// Force a non-terminal task to `failed` with an error message.
///
/// Submit-path escape hatch for failures that bypass a run entirely
/// (queue full, execution row creation failed): collapses
/// `pending -> running -> failed` into one statement.
pub async fn mark_task_failed(pool: &PgPool, task_id: Uuid, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sync_tasks \
         SET status = 'failed', \
             error_message = $1, \
             end_time = NOW() \
         WHERE id = $2 AND status IN ('pending', 'running', 'paused')",
    )
    .bind(error)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to mark task failed")?;

    Ok(result.rows_affected())
}

/// Persist the run result onto the task: last run timestamp and counters
/// folded into the config mapping.
pub async fn update_task_result(
    pool: &PgPool,
    task_id: Uuid,
    processed_rows: i64,
    error_rows: i64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE sync_tasks \
         SET last_run_time = NOW(), \
             config = config || jsonb_build_object( \
                 'last_processed_rows', $1::bigint, \
                 'last_error_rows', $2::bigint) \
         WHERE id = $3",
    )
    .bind(processed_rows)
    .bind(error_rows)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to update task result")?;

    if result.rows_affected() == 0 {
        bail!("task {task_id} not found");
    }

    Ok(())
}

/// Advance the incremental cursor stored at `config.last_sync_time`.
///
/// Monotonic: the row is only updated when the new cursor sorts after the
/// stored one. Cursors are RFC3339 UTC strings, so lexicographic order is
/// chronological order. Returns `true` when the cursor moved.
pub async fn advance_cursor(pool: &PgPool, task_id: Uuid, new_cursor: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE sync_tasks \
         SET config = jsonb_set(config, '{last_sync_time}', to_jsonb($1::text), true) \
         WHERE id = $2 \
           AND (config->>'last_sync_time' IS NULL OR config->>'last_sync_time' < $1)",
    )
    .bind(new_cursor)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to advance sync cursor")?;

    Ok(result.rows_affected() > 0)
}

/// Set the next scheduled fire time. The external cron scheduler computes
/// the value; the engine only records it after a successful scheduled run.
pub async fn advance_next_run_time(
    pool: &PgPool,
    task_id: Uuid,
    next_run_time: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query("UPDATE sync_tasks SET next_run_time = $1 WHERE id = $2")
        .bind(next_run_time)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to advance next run time")?;

    Ok(())
}

/// List tasks whose `next_run_time` has arrived and that are not
/// mid-flight. The scheduler submits these under the distributed lock.
pub async fn list_due_tasks(pool: &PgPool) -> Result<Vec<SyncTask>> {
    let tasks = sqlx::query_as::<_, SyncTask>(
        "SELECT * FROM sync_tasks \
         WHERE next_run_time IS NOT NULL \
           AND next_run_time <= NOW() \
           AND status IN ('pending', 'success', 'failed') \
         ORDER BY next_run_time ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list due tasks")?;

    Ok(tasks)
}

/// Reset tasks orphaned in `running` by a crash back to `failed`.
///
/// Used for restart recovery: a task in `running` with no live engine
/// entry can never finish. Returns the tasks that were reset.
pub async fn reset_orphaned_tasks(pool: &PgPool) -> Result<Vec<SyncTask>> {
    let tasks = sqlx::query_as::<_, SyncTask>(
        "UPDATE sync_tasks \
         SET status = 'failed', \
             end_time = NOW(), \
             error_message = 'interrupted by restart' \
         WHERE status = 'running' \
         RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned tasks")?;

    Ok(tasks)
}

/// Delete a task. Cascades to executions and interface joins.
pub async fn delete_task(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sync_tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete sync task")?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_edges() {
        use TaskStatus::*;

        let allowed = [
            (Pending, Running),
            (Pending, Cancelled),
            (Running, Success),
            (Running, Failed),
            (Running, Cancelled),
            (Running, Paused),
            (Paused, Running),
            (Paused, Cancelled),
            (Failed, Pending),
        ];
        for (from, to) in allowed {
            assert!(is_valid_transition(from, to), "{from} -> {to} should be allowed");
        }

        let rejected = [
            (Pending, Success),
            (Pending, Failed),
            (Pending, Paused),
            (Success, Running),
            (Success, Pending),
            (Cancelled, Running),
            (Cancelled, Pending),
            (Failed, Running),
            (Paused, Success),
            (Paused, Failed),
            (Running, Pending),
        ];
        for (from, to) in rejected {
            assert!(!is_valid_transition(from, to), "{from} -> {to} should be rejected");
        }
    }
}
