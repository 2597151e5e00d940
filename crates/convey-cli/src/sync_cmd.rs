//! One-shot sync: run a single task to completion in-process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use convey_core::datasource::{DatasourceManager, DatasourceRegistry};
use convey_core::engine::{EngineConfig, SubmitRequest, SyncEngine};
use convey_core::sink::PostgresSink;
use convey_db::models::TaskStatus;
use convey_db::queries::{executions, tasks};

/// Submit a task manually and wait for it to finish.
pub async fn run_sync(catalog: PgPool, warehouse: PgPool, task_id: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id).with_context(|| format!("invalid task ID: {task_id}"))?;

    let manager = Arc::new(DatasourceManager::new(DatasourceRegistry::with_builtin_kinds()));
    let sink = Arc::new(PostgresSink::new(warehouse));
    let engine = SyncEngine::start(
        catalog.clone(),
        manager,
        sink,
        EngineConfig::default(),
        None,
        None,
    )
    .await?;

    engine
        .submit(SubmitRequest {
            task_id: Some(task_id),
            manual: true,
            ..SubmitRequest::default()
        })
        .await?;
    println!("Task {task_id} submitted, waiting...");

    // Poll the catalog until the run reaches a terminal status.
    let task = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let task = tasks::get_task(&catalog, task_id)
            .await?
            .context("task vanished while running")?;
        if task.status.is_terminal() {
            break task;
        }
        if let (_, Some(progress)) = engine.status(task_id).await? {
            tracing::info!(
                phase = %progress.phase,
                rows = progress.processed_rows,
                speed = format!("{:.0}/s", progress.speed),
                "in progress"
            );
        }
    };

    engine.stop().await;

    let executions = executions::list_executions_for_task(&catalog, task_id, 1).await?;
    if let Some(execution) = executions.first() {
        println!(
            "Task {} -> {} ({} rows, {} errors, {} ms)",
            task_id,
            task.status,
            execution.processed_rows,
            execution.error_rows,
            execution.duration_ms.unwrap_or(0),
        );
    }

    if task.status != TaskStatus::Success {
        bail!(
            "sync ended {}: {}",
            task.status,
            task.error_message.as_deref().unwrap_or("no error recorded")
        );
    }
    Ok(())
}
