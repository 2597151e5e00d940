//! Incremental synchronization: upsert rows newer than the persisted
//! cursor, then advance the cursor.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use convey_db::models::{DataInterface, ExecutionStatus, SyncTask};
use convey_db::queries::{task_interfaces, tasks};

use crate::datasource::DatasourceInstance;
use crate::engine::progress::SyncProgress;
use crate::error::SyncError;
use crate::mapping::{FieldMapping, normalize_rows, parse_primary_keys};
use crate::query::{PageParams, SyncMode, SyncParams, builder_for};
use crate::sink::TableRef;

use super::{StrategyContext, StrategyOutcome, SyncStrategy, acquire_instance, execute_counted};

/// Cursor value used when a task has never synced: the epoch, which
/// makes the first run a full drain bounded by the upstream.
const EPOCH_CURSOR: &str = "1970-01-01T00:00:00Z";

pub struct IncrementalStrategy;

#[async_trait]
impl SyncStrategy for IncrementalStrategy {
    async fn process(
        &self,
        ctx: &StrategyContext,
        cancel: &CancellationToken,
        task: &SyncTask,
        interfaces: &[DataInterface],
        progress: &SyncProgress,
    ) -> Result<StrategyOutcome, SyncError> {
        let instance = acquire_instance(ctx, cancel, task).await?;
        let batch_size = task.batch_size(ctx.default_batch_size);
        let cursor = task
            .last_sync_time()
            .unwrap_or(EPOCH_CURSOR)
            .to_owned();

        // The new cursor is stamped before extraction: rows arriving
        // mid-run are picked up again next run rather than skipped.
        let next_cursor = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut consecutive_transport_errors = 0u32;
        let mut outcome = StrategyOutcome::default();
        let mut per_interface = serde_json::Map::new();

        for interface in interfaces {
            if let Err(e) =
                task_interfaces::start_task_interface(&ctx.catalog, task.id, interface.id).await
            {
                tracing::warn!(interface_id = %interface.id, error = %e, "failed to mark interface running");
            }

            let landed = self
                .sync_interface(
                    ctx,
                    cancel,
                    task,
                    interface,
                    &instance,
                    batch_size,
                    &cursor,
                    &mut consecutive_transport_errors,
                    progress,
                )
                .await;

            match landed {
                Ok(rows) => {
                    let _ = task_interfaces::finish_task_interface(
                        &ctx.catalog,
                        task.id,
                        interface.id,
                        ExecutionStatus::Success,
                        rows as i64,
                        None,
                    )
                    .await;
                    outcome.processed_rows += rows as i64;
                    outcome.success_rows += rows as i64;
                    per_interface.insert(interface.name.clone(), json!(rows));
                }
                Err(e) => {
                    let status = if matches!(e, SyncError::Cancelled) {
                        ExecutionStatus::Cancelled
                    } else {
                        ExecutionStatus::Failed
                    };
                    let _ = task_interfaces::finish_task_interface(
                        &ctx.catalog,
                        task.id,
                        interface.id,
                        status,
                        0,
                        Some(&e.to_string()),
                    )
                    .await;
                    // The cursor is not advanced on failure.
                    return Err(e);
                }
            }
        }

        // Persist the cursor only after every interface landed. The
        // repository keeps it monotonic.
        let moved = tasks::advance_cursor(&ctx.catalog, task.id, &next_cursor)
            .await
            .map_err(|e| SyncError::Sink(e.to_string()))?;
        tracing::info!(
            task_id = %task.id,
            cursor = %next_cursor,
            moved,
            "incremental cursor persisted"
        );

        outcome.statistics = json!({
            "interfaces": interfaces.len(),
            "rows_per_interface": per_interface,
            "cursor": next_cursor,
        });
        progress.set_phase("complete");
        Ok(outcome)
    }
}

impl IncrementalStrategy {
    #[allow(clippy::too_many_arguments)]
    async fn sync_interface(
        &self,
        ctx: &StrategyContext,
        cancel: &CancellationToken,
        task: &SyncTask,
        interface: &DataInterface,
        instance: &std::sync::Arc<dyn DatasourceInstance>,
        batch_size: usize,
        cursor: &str,
        consecutive_transport_errors: &mut u32,
        progress: &SyncProgress,
    ) -> Result<u64, SyncError> {
        let builder = builder_for(instance.kind(), interface)?;
        let mapping = FieldMapping::from_parse_config(&interface.parse_config);
        let columns = ctx.mapper.column_types(interface).await;
        let table = TableRef::new(&interface.schema_name, &interface.table_name);
        let keys = parse_primary_keys(&interface.table_fields_config);
        if keys.is_empty() {
            tracing::warn!(
                interface = %interface.name,
                "no primary keys declared, incremental falls back to append"
            );
        }

        let params = SyncParams {
            batch_size,
            last_sync_time: Some(cursor.to_owned()),
        };

        tracing::info!(
            task_id = %task.id,
            interface = %interface.name,
            cursor = %cursor,
            "starting incremental sync"
        );

        let mut landed: u64 = 0;
        let mut page: u64 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            progress.set_phase(format!("{}: page {page}", interface.name));
            let request = if builder.pagination_enabled() {
                builder.build_page_request(
                    SyncMode::Incremental,
                    &params,
                    &PageParams {
                        page,
                        page_size: batch_size as u64,
                    },
                )?
            } else {
                builder.build_sync_request(SyncMode::Incremental, &params)?
            };

            let response =
                execute_counted(instance, cancel, &request, consecutive_transport_errors).await?;
            let rows = normalize_rows(&response.data);
            if rows.is_empty() {
                break;
            }

            let fetched = rows.len();
            let mapped = ctx.mapper.map_rows(interface, &mapping, &rows).await;
            let written = if keys.is_empty() {
                ctx.sink.append(cancel, &table, &columns, &mapped).await?
            } else {
                ctx.sink
                    .upsert(cancel, &table, &columns, &mapped, &keys)
                    .await?
            };
            landed += written;
            progress.add_rows(written, 0);

            if !builder.pagination_enabled() || fetched < batch_size {
                break;
            }
            page += 1;
        }

        tracing::info!(
            task_id = %task.id,
            interface = %interface.name,
            rows = landed,
            "incremental sync finished"
        );
        Ok(landed)
    }
}
