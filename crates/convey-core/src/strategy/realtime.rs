//! Realtime synchronization: drain a resident instance (MQTT subscriber
//! or HTTP-POST receiver) until cancelled, landing batches by size or
//! age.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use convey_db::models::{DataInterface, ExecutionStatus, SyncTask};
use convey_db::queries::task_interfaces;

use crate::datasource::DataRequest;
use crate::engine::progress::SyncProgress;
use crate::error::SyncError;
use crate::mapping::{ColumnType, FieldMapping, normalize_rows};
use crate::sink::{Sink, TableRef};

use super::{StrategyContext, StrategyOutcome, SyncStrategy, acquire_instance};

/// Runtime knobs read from the task config.
#[derive(Debug, Clone)]
struct RealtimeConfig {
    poll_interval: Duration,
    batch_timeout: Duration,
    max_retries: u32,
    retry_interval: Duration,
    dead_letter_enabled: bool,
    flush_on_shutdown: bool,
}

impl RealtimeConfig {
    fn from_task(task: &SyncTask) -> Self {
        let secs = |key: &str, default: u64| -> u64 {
            task.config.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
        };
        Self {
            poll_interval: Duration::from_secs(secs("poll_interval_secs", 5)),
            batch_timeout: Duration::from_secs(secs("batch_timeout_secs", 30)),
            max_retries: secs("max_retries", 3) as u32,
            retry_interval: Duration::from_secs(secs("retry_interval_secs", 5)),
            dead_letter_enabled: task
                .config
                .get("dead_letter_enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            flush_on_shutdown: task
                .config
                .get("flush_on_shutdown")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
        }
    }
}

pub struct RealtimeStrategy;

#[async_trait]
impl SyncStrategy for RealtimeStrategy {
    async fn process(
        &self,
        ctx: &StrategyContext,
        cancel: &CancellationToken,
        task: &SyncTask,
        interfaces: &[DataInterface],
        progress: &SyncProgress,
    ) -> Result<StrategyOutcome, SyncError> {
        let instance = acquire_instance(ctx, cancel, task).await?;
        if !instance.is_resident() {
            return Err(SyncError::Config(format!(
                "realtime sync requires a resident datasource, got kind {}",
                instance.kind()
            )));
        }

        let interface = interfaces.first().ok_or_else(|| {
            SyncError::Config("realtime task has no interface linked".to_owned())
        })?;
        if interfaces.len() > 1 {
            tracing::warn!(
                task_id = %task.id,
                count = interfaces.len(),
                "realtime sync uses the first linked interface only"
            );
        }

        let config = RealtimeConfig::from_task(task);
        let batch_size = task.batch_size(ctx.default_batch_size);
        let mapping = FieldMapping::from_parse_config(&interface.parse_config);
        let columns = ctx.mapper.column_types(interface).await;
        let table = TableRef::new(&interface.schema_name, &interface.table_name);

        if let Err(e) =
            task_interfaces::start_task_interface(&ctx.catalog, task.id, interface.id).await
        {
            tracing::warn!(interface_id = %interface.id, error = %e, "failed to mark interface running");
        }

        tracing::info!(
            task_id = %task.id,
            interface = %interface.name,
            poll_interval_secs = config.poll_interval.as_secs(),
            "realtime sync running"
        );
        progress.set_phase(format!("{}: streaming", interface.name));

        let mut pending: Vec<Map<String, Value>> = Vec::new();
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if config.flush_on_shutdown {
                        // One final drain so records delivered since the
                        // last poll are not stranded in the buffer.
                        if let Ok(response) = instance
                            .execute(cancel, &DataRequest::drain(batch_size))
                            .await
                        {
                            let rows = normalize_rows(&response.data);
                            let mapped = ctx.mapper.map_rows(interface, &mapping, &rows).await;
                            pending.extend(mapped);
                        }
                        if !pending.is_empty() {
                            self.flush(
                                ctx.sink.as_ref(),
                                cancel,
                                &table,
                                &columns,
                                &mut pending,
                                &config,
                                progress,
                            )
                            .await;
                        }
                    }
                    let snapshot = progress.snapshot();
                    let _ = task_interfaces::finish_task_interface(
                        &ctx.catalog,
                        task.id,
                        interface.id,
                        ExecutionStatus::Cancelled,
                        snapshot.processed_rows as i64,
                        None,
                    )
                    .await;
                    tracing::info!(task_id = %task.id, rows = snapshot.processed_rows, "realtime sync stopped");
                    return Err(SyncError::Cancelled);
                }
                _ = tokio::time::sleep(config.poll_interval) => {
                    let response = match instance
                        .execute(cancel, &DataRequest::drain(batch_size))
                        .await
                    {
                        Ok(response) => response,
                        Err(SyncError::Cancelled) => continue,
                        Err(e) => {
                            let _ = task_interfaces::finish_task_interface(
                                &ctx.catalog,
                                task.id,
                                interface.id,
                                ExecutionStatus::Failed,
                                progress.snapshot().processed_rows as i64,
                                Some(&e.to_string()),
                            )
                            .await;
                            return Err(e);
                        }
                    };

                    let rows = normalize_rows(&response.data);
                    if !rows.is_empty() {
                        let mapped = ctx.mapper.map_rows(interface, &mapping, &rows).await;
                        pending.extend(mapped);
                    }

                    let batch_full = pending.len() >= batch_size;
                    let batch_stale =
                        !pending.is_empty() && last_flush.elapsed() >= config.batch_timeout;
                    if batch_full || batch_stale {
                        self.flush(
                            ctx.sink.as_ref(),
                            cancel,
                            &table,
                            &columns,
                            &mut pending,
                            &config,
                            progress,
                        )
                        .await;
                        last_flush = Instant::now();
                    }
                }
            }
        }
    }
}

impl RealtimeStrategy {
    /// Land a pending batch, retrying per the task's retry policy. On
    /// exhaustion the batch is dead-lettered (when enabled) or dropped
    /// with a log line; either way the stream keeps flowing.
    #[allow(clippy::too_many_arguments)]
    async fn flush(
        &self,
        sink: &dyn Sink,
        cancel: &CancellationToken,
        table: &TableRef,
        columns: &HashMap<String, ColumnType>,
        pending: &mut Vec<Map<String, Value>>,
        config: &RealtimeConfig,
        progress: &SyncProgress,
    ) {
        let mut attempt = 0u32;
        loop {
            match sink.append(cancel, table, columns, pending).await {
                Ok(written) => {
                    progress.add_rows(written, 0);
                    pending.clear();
                    return;
                }
                Err(SyncError::Cancelled) => {
                    // Shutdown mid-flush: the batch stays pending; the
                    // cancellation branch decides what happens to it.
                    return;
                }
                Err(e) if attempt < config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = config.max_retries,
                        error = %e,
                        "batch landing failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(config.retry_interval) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    let lost = pending.len() as u64;
                    if config.dead_letter_enabled {
                        match sink.dead_letter(table, pending, &e.to_string()).await {
                            Ok(_) => tracing::warn!(
                                rows = lost,
                                error = %e,
                                "batch landing exhausted retries, dead-lettered"
                            ),
                            Err(dl) => tracing::error!(
                                rows = lost,
                                error = %e,
                                dead_letter_error = %dl,
                                "batch landing exhausted retries and dead-letter failed, dropping"
                            ),
                        }
                    } else {
                        tracing::error!(
                            rows = lost,
                            error = %e,
                            "batch landing exhausted retries, dropping"
                        );
                    }
                    progress.add_rows(0, lost);
                    pending.clear();
                    return;
                }
            }
        }
    }
}
