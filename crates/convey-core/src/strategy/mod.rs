//! Synchronization strategies.
//!
//! One strategy per sync contract: [`FullSyncStrategy`] replaces the
//! target table from a paged extraction, [`IncrementalStrategy`] upserts
//! rows newer than the persisted cursor, [`RealtimeStrategy`] drains a
//! resident instance until cancelled.

pub mod full;
pub mod incremental;
pub mod realtime;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use convey_db::models::{DataInterface, SyncTask, SyncType};
use convey_db::queries::datasources;

use crate::datasource::{DataRequest, DataResponse, DatasourceInstance, DatasourceManager};
use crate::engine::progress::SyncProgress;
use crate::error::SyncError;
use crate::mapping::FieldMapper;
use crate::sink::Sink;

pub use full::FullSyncStrategy;
pub use incremental::IncrementalStrategy;
pub use realtime::RealtimeStrategy;

/// Consecutive transport errors tolerated before a run aborts.
pub const MAX_CONSECUTIVE_TRANSPORT_ERRORS: u32 = 10;

/// Shared collaborators a strategy works against.
pub struct StrategyContext {
    /// Catalog pool: interface bookkeeping and cursor persistence.
    pub catalog: PgPool,
    pub manager: Arc<DatasourceManager>,
    pub mapper: Arc<FieldMapper>,
    pub sink: Arc<dyn Sink>,
    /// Batch size used when the task config supplies none.
    pub default_batch_size: usize,
}

/// What a completed run reports back to the engine.
#[derive(Debug, Clone, Default)]
pub struct StrategyOutcome {
    pub processed_rows: i64,
    pub success_rows: i64,
    pub error_rows: i64,
    pub statistics: Value,
}

/// One sync run. Implementations drive extraction, mapping, and landing;
/// the engine owns status transitions and event emission.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    async fn process(
        &self,
        ctx: &StrategyContext,
        cancel: &CancellationToken,
        task: &SyncTask,
        interfaces: &[DataInterface],
        progress: &SyncProgress,
    ) -> Result<StrategyOutcome, SyncError>;
}

/// Select the strategy for a sync type.
pub fn strategy_for(sync_type: SyncType) -> Box<dyn SyncStrategy> {
    match sync_type {
        SyncType::Full => Box::new(FullSyncStrategy),
        SyncType::Incremental => Box::new(IncrementalStrategy),
        SyncType::Realtime => Box::new(RealtimeStrategy),
    }
}

/// Resolve the live instance for a task's datasource: cached when
/// registered, otherwise registered from the catalog record and fetched
/// again. Residents are started here on first use.
pub(crate) async fn acquire_instance(
    ctx: &StrategyContext,
    cancel: &CancellationToken,
    task: &SyncTask,
) -> Result<Arc<dyn DatasourceInstance>, SyncError> {
    let instance = match ctx.manager.get(task.datasource_id).await {
        Ok(instance) => instance,
        Err(_) => {
            let datasource = datasources::get_datasource(&ctx.catalog, task.datasource_id)
                .await
                .map_err(|e| SyncError::Sink(e.to_string()))?
                .ok_or_else(|| {
                    SyncError::Config(format!("datasource {} not found", task.datasource_id))
                })?;
            ctx.manager.register(&datasource).await?;
            ctx.manager.get(task.datasource_id).await?
        }
    };

    if instance.is_resident() && !instance.is_started() {
        instance.start(cancel).await?;
    }

    Ok(instance)
}

/// Execute a request, tolerating up to
/// [`MAX_CONSECUTIVE_TRANSPORT_ERRORS`] consecutive transport errors
/// (tracked across the whole run via `consecutive`). A refused response
/// becomes a protocol error, which is never retried.
pub(crate) async fn execute_counted(
    instance: &Arc<dyn DatasourceInstance>,
    cancel: &CancellationToken,
    request: &DataRequest,
    consecutive: &mut u32,
) -> Result<DataResponse, SyncError> {
    loop {
        match instance.execute(cancel, request).await {
            Ok(response) => {
                if !response.success {
                    return Err(SyncError::Protocol(
                        response
                            .error
                            .unwrap_or_else(|| "upstream refused request".to_owned()),
                    ));
                }
                *consecutive = 0;
                return Ok(response);
            }
            Err(SyncError::Transport(message)) => {
                *consecutive += 1;
                if *consecutive > MAX_CONSECUTIVE_TRANSPORT_ERRORS {
                    return Err(SyncError::Transport(format!(
                        "aborting after {consecutive} consecutive transport errors: {message}"
                    )));
                }
                tracing::warn!(
                    attempt = *consecutive,
                    error = %message,
                    "transport error, retrying request"
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                }
            }
            Err(other) => return Err(other),
        }
    }
}
