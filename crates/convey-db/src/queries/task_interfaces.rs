//! Query functions for the `sync_task_interfaces` join table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ExecutionStatus, SyncTaskInterface};

/// Link a task to an interface.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn link_task_interface(pool: &PgPool, task_id: Uuid, interface_id: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_task_interfaces (task_id, interface_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(interface_id)
    .execute(pool)
    .await
    .context("failed to link task to interface")?;

    Ok(())
}

/// List the interface joins for a task.
pub async fn list_task_interfaces(pool: &PgPool, task_id: Uuid) -> Result<Vec<SyncTaskInterface>> {
    let rows = sqlx::query_as::<_, SyncTaskInterface>(
        "SELECT * FROM sync_task_interfaces WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list task interfaces")?;

    Ok(rows)
}

/// Get the interface IDs associated with a task, in link order.
pub async fn get_interface_ids(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT interface_id FROM sync_task_interfaces WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task interface ids")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Mark an interface run as started.
pub async fn start_task_interface(pool: &PgPool, task_id: Uuid, interface_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE sync_task_interfaces \
         SET status = 'running', start_time = NOW(), end_time = NULL, error_message = NULL \
         WHERE task_id = $1 AND interface_id = $2",
    )
    .bind(task_id)
    .bind(interface_id)
    .execute(pool)
    .await
    .context("failed to start task interface")?;

    Ok(())
}

/// Close an interface run with its final status, row count, and error.
pub async fn finish_task_interface(
    pool: &PgPool,
    task_id: Uuid,
    interface_id: Uuid,
    status: ExecutionStatus,
    processed_rows: i64,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_task_interfaces \
         SET status = $1, end_time = NOW(), processed_rows = $2, error_message = $3 \
         WHERE task_id = $4 AND interface_id = $5",
    )
    .bind(status)
    .bind(processed_rows)
    .bind(error_message)
    .bind(task_id)
    .bind(interface_id)
    .execute(pool)
    .await
    .context("failed to finish task interface")?;

    Ok(())
}
