//! Task status display.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use convey_db::models::TaskStatus;
use convey_db::queries::{executions, task_interfaces, tasks};

/// Show one task (with recent executions), or every non-terminal task.
pub async fn run_status(pool: &PgPool, task_id: Option<&str>) -> Result<()> {
    match task_id {
        Some(raw) => {
            let id = Uuid::parse_str(raw).with_context(|| format!("invalid task ID: {raw}"))?;
            let task = tasks::get_task(pool, id)
                .await?
                .with_context(|| format!("task {id} not found"))?;

            println!("Task {}", task.id);
            println!("  type:      {} / {}", task.library_type, task.sync_type);
            println!("  status:    {}", task.status);
            if let Some(error) = &task.error_message {
                println!("  error:     {error}");
            }
            if let Some(last_run) = task.last_run_time {
                println!("  last run:  {last_run}");
            }
            if let Some(next_run) = task.next_run_time {
                println!("  next run:  {next_run}");
            }

            let joins = task_interfaces::list_task_interfaces(pool, id).await?;
            if !joins.is_empty() {
                println!("  interfaces:");
                for join in joins {
                    println!(
                        "    {} {} ({} rows{})",
                        join.interface_id,
                        join.status,
                        join.processed_rows,
                        join.error_message
                            .as_deref()
                            .map(|e| format!(", error: {e}"))
                            .unwrap_or_default()
                    );
                }
            }

            let recent = executions::list_executions_for_task(pool, id, 5).await?;
            if !recent.is_empty() {
                println!("  executions:");
                for execution in recent {
                    println!(
                        "    {} {} {} ({} rows, {} errors)",
                        execution.id,
                        execution.execution_type,
                        execution.status,
                        execution.processed_rows,
                        execution.error_rows
                    );
                }
            }
        }
        None => {
            let mut shown = 0;
            for status in [TaskStatus::Running, TaskStatus::Pending, TaskStatus::Paused] {
                for task in tasks::list_tasks_by_status(pool, status).await? {
                    println!("{:<38} {:<12} {}", task.id, task.status.to_string(), task.sync_type);
                    shown += 1;
                }
            }
            if shown == 0 {
                println!("No active tasks.");
            }
        }
    }
    Ok(())
}
