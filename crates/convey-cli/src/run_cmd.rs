//! The `convey run` service: engine plus the scheduler tick loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;

use convey_core::datasource::{DatasourceManager, DatasourceRegistry};
use convey_core::engine::{EngineConfig, SubmitRequest, SyncEngine};
use convey_core::lock::{LockedExecutor, RedisLock};
use convey_core::sink::PostgresSink;
use convey_db::queries::tasks;

/// Lock TTL for one scheduler tick.
const SCHEDULER_LOCK_TTL: Duration = Duration::from_secs(30);

pub struct RunOptions {
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub scheduler: bool,
    pub tick_secs: u64,
}

/// Start the engine and serve until ctrl-c.
pub async fn run_service(catalog: PgPool, warehouse: PgPool, options: RunOptions) -> Result<()> {
    let manager = Arc::new(DatasourceManager::new(DatasourceRegistry::with_builtin_kinds()));
    let sink = Arc::new(PostgresSink::new(warehouse));

    let config = EngineConfig {
        max_concurrent: options.max_concurrent,
        queue_size: options.queue_size,
        ..EngineConfig::default()
    };

    let engine = SyncEngine::start(catalog.clone(), manager, sink, config, None, None).await?;
    tracing::info!(
        max_concurrent = options.max_concurrent,
        queue_size = options.queue_size,
        "engine running"
    );

    // The scheduler polls for due tasks and submits them under the
    // distributed lock so replicas never double-fire.
    let scheduler = if options.scheduler {
        let lock = Arc::new(RedisLock::from_env()?);
        let executor = LockedExecutor::new(lock);
        let engine = Arc::clone(&engine);
        let tick = Duration::from_secs(options.tick_secs.max(1));

        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let due = match tasks::list_due_tasks(&catalog).await {
                    Ok(due) => due,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to list due tasks");
                        continue;
                    }
                };

                for task in due {
                    let key = format!("task:{}", task.id);
                    let submit = || async {
                        engine
                            .submit(SubmitRequest {
                                task_id: Some(task.id),
                                scheduled: true,
                                ..SubmitRequest::default()
                            })
                            .await
                    };
                    match executor.run(&key, SCHEDULER_LOCK_TTL, None, submit).await {
                        Ok(Some(Ok(_))) => {
                            tracing::info!(task_id = %task.id, "scheduled task submitted");
                        }
                        Ok(Some(Err(e))) => {
                            tracing::warn!(task_id = %task.id, error = %e, "scheduled submit failed");
                        }
                        Ok(None) => {
                            tracing::debug!(task_id = %task.id, "another replica holds the lock");
                        }
                        Err(e) => {
                            // Lock backend trouble never authorizes a
                            // duplicate fire; skip this tick.
                            tracing::warn!(task_id = %task.id, error = %e, "lock unavailable, skipping tick");
                        }
                    }
                }
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");

    if let Some(handle) = scheduler {
        handle.abort();
    }
    engine.stop().await;
    Ok(())
}
