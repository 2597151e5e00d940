//! Full (snapshot) synchronization: replace the target table with a
//! paged extraction of the upstream.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use convey_db::models::{DataInterface, ExecutionStatus, SyncTask};
use convey_db::queries::task_interfaces;

use crate::datasource::DatasourceInstance;
use crate::engine::progress::SyncProgress;
use crate::error::SyncError;
use crate::mapping::{FieldMapping, normalize_rows};
use crate::query::{PageParams, SyncMode, SyncParams, builder_for};
use crate::sink::TableRef;

use super::{StrategyContext, StrategyOutcome, SyncStrategy, acquire_instance, execute_counted};

pub struct FullSyncStrategy;

#[async_trait]
impl SyncStrategy for FullSyncStrategy {
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
                    return Err(e);
                }
            }
        }

        outcome.statistics = json!({
            "interfaces": interfaces.len(),
            "rows_per_interface": per_interface,
        });
        progress.set_phase("complete");
        Ok(outcome)
    }
}

impl FullSyncStrategy {
    #[allow(clippy::too_many_arguments)]
    async fn sync_interface(
        &self,
        ctx: &StrategyContext,
        cancel: &CancellationToken,
        task: &SyncTask,
        interface: &DataInterface,
        instance: &std::sync::Arc<dyn DatasourceInstance>,
        batch_size: usize,
        consecutive_transport_errors: &mut u32,
        progress: &SyncProgress,
    ) -> Result<u64, SyncError> {
        let builder = builder_for(instance.kind(), interface)?;
        let mapping = FieldMapping::from_parse_config(&interface.parse_config);
        let columns = ctx.mapper.column_types(interface).await;
        let table = TableRef::new(&interface.schema_name, &interface.table_name);
        let params = SyncParams {
            batch_size,
            last_sync_time: None,
        };

        tracing::info!(
            task_id = %task.id,
            interface = %interface.name,
            sink_table = %format!("{}.{}", table.schema, table.table),
            paginated = builder.pagination_enabled(),
            "starting full sync"
        );

        if !builder.pagination_enabled() {
            progress.set_phase(format!("{}: extracting", interface.name));
            let request = builder.build_sync_request(SyncMode::Full, &params)?;
            let response =
                execute_counted(instance, cancel, &request, consecutive_transport_errors).await?;
            let rows = normalize_rows(&response.data);
            let mapped = ctx.mapper.map_rows(interface, &mapping, &rows).await;
            let written = ctx
                .sink
                .replace(cancel, &table, &columns, &mapped)
                .await?;
            progress.add_rows(written, 0);
            return Ok(written);
        }

        let mut page: u64 = 1;
        let mut landed: u64 = 0;
        let mut replaced = false;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            progress.set_phase(format!("{}: page {page}", interface.name));
            let request = builder.build_page_request(
                SyncMode::Full,
                &params,
                &PageParams {
                    page,
                    page_size: batch_size as u64,
                },
            )?;
            let response =
                execute_counted(instance, cancel, &request, consecutive_transport_errors).await?;
            let rows = normalize_rows(&response.data);

            if rows.is_empty() {
                // First page empty: the snapshot is empty, truncate the
                // target so replace semantics still hold.
                if !replaced {
                    ctx.sink.replace(cancel, &table, &columns, &[]).await?;
                }
                break;
            }

            let fetched = rows.len();
            let mapped = ctx.mapper.map_rows(interface, &mapping, &rows).await;
            let written = if replaced {
                ctx.sink.append(cancel, &table, &columns, &mapped).await?
            } else {
                ctx.sink.replace(cancel, &table, &columns, &mapped).await?
            };
            replaced = true;
            landed += written;
            progress.add_rows(written, 0);

            // A short page terminates; a full page triggers the next
            // fetch unless the reported total is already met.
            if fetched < batch_size {
                break;
            }
            if let Some(total) = response.metadata.total {
                if landed >= total {
                    break;
                }
            }
            page += 1;
        }

        tracing::info!(
            task_id = %task.id,
            interface = %interface.name,
            rows = landed,
            pages = page,
            "full sync finished"
        );
        Ok(landed)
    }
}
