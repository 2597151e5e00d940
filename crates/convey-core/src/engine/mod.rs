//! The engine core: submission, queue, worker pool, execution
//! bookkeeping, events, and cancellation.
//!
//! A bounded FIFO queue feeds a dispatcher loop that leases semaphore
//! permits and launches one worker per submission. Each worker owns the
//! full run: execution row, status transitions, strategy invocation, and
//! result persistence. The running map is the single source of truth for
//! live tasks.

pub mod events;
pub mod progress;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use convey_db::models::{
    ExecutionStatus, ExecutionType, LibraryType, SyncTask, SyncType, TaskStatus,
};
use convey_db::queries::{executions, interfaces as interface_db, task_interfaces, tasks};

use crate::datasource::DatasourceManager;
use crate::error::SyncError;
use crate::mapping::FieldMapper;
use crate::sink::Sink;
use crate::strategy::{StrategyContext, strategy_for};

pub use events::{EventNotifier, SyncEvent, SyncEventType};
pub use progress::{ProgressSnapshot, SyncProgress};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size.
    pub max_concurrent: usize,
    /// Bounded queue capacity; submissions beyond it are refused.
    pub queue_size: usize,
    /// How long `stop` waits for running tasks before force-cancelling.
    pub drain_timeout: Duration,
    /// Batch size when a task config supplies none.
    pub default_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            queue_size: 1000,
            drain_timeout: Duration::from_secs(30),
            default_batch_size: 1000,
        }
    }
}

/// Fields for creating a task at submit time.
#[derive(Debug, Clone)]
pub struct NewTaskSpec {
    pub library_type: LibraryType,
    pub library_id: Uuid,
    pub datasource_id: Uuid,
    pub sync_type: SyncType,
    pub config: Value,
    pub interface_ids: Vec<Uuid>,
    pub created_by: Option<String>,
}

/// A submission: either an existing task by id, or a spec that resolves
/// through the legacy (library, datasource, sync type) lookup before
/// creating a fresh task.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub task_id: Option<Uuid>,
    /// Manual re-run: reset a finished task and run it again.
    pub manual: bool,
    /// Scheduled fire (drives the execution type and next-run advance).
    pub scheduled: bool,
    pub spec: Option<NewTaskSpec>,
}

/// Callback invoked after a task completes successfully.
pub type CompletionCallback = Arc<dyn Fn(&SyncTask) + Send + Sync>;

struct WorkItem {
    task_id: Uuid,
    execution_type: ExecutionType,
}

struct RunningTask {
    cancel: CancellationToken,
    progress: Arc<SyncProgress>,
    execution_id: Uuid,
}

/// A live view of one running task.
#[derive(Debug, Clone)]
pub struct RunningTaskInfo {
    pub task_id: Uuid,
    pub execution_id: Uuid,
    pub progress: ProgressSnapshot,
}

/// Counters reported by [`SyncEngine::statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatistics {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub queued: usize,
    pub running: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// The sync engine.
pub struct SyncEngine {
    catalog: PgPool,
    manager: Arc<DatasourceManager>,
    mapper: Arc<FieldMapper>,
    sink: Arc<dyn Sink>,
    config: EngineConfig,
    notifier: Option<EventNotifier>,
    completion: Option<CompletionCallback>,
    queue_tx: mpsc::Sender<WorkItem>,
    running: RwLock<HashMap<Uuid, RunningTask>>,
    root_cancel: CancellationToken,
    accepting: AtomicBool,
    counters: Counters,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build and start the engine: restart recovery, then the dispatcher
    /// loop.
    pub async fn start(
        catalog: PgPool,
        manager: Arc<DatasourceManager>,
        sink: Arc<dyn Sink>,
        config: EngineConfig,
        notifier: Option<EventNotifier>,
        completion: Option<CompletionCallback>,
    ) -> Result<Arc<Self>> {
        // Restart recovery: tasks orphaned in `running` by a previous
        // process can never finish; reset them and close their dangling
        // executions.
        let orphaned = tasks::reset_orphaned_tasks(&catalog)
            .await
            .context("restart recovery failed")?;
        for task in &orphaned {
            let _ = executions::close_dangling_executions(&catalog, task.id).await;
            tracing::warn!(task_id = %task.id, "reset orphaned task to failed");
        }

        let (queue_tx, queue_rx) = mpsc::channel::<WorkItem>(config.queue_size);

        let engine = Arc::new(Self {
            catalog,
            manager,
            mapper: Arc::new(FieldMapper::new()),
            sink,
            config,
            notifier,
            completion,
            queue_tx,
            running: RwLock::new(HashMap::new()),
            root_cancel: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            counters: Counters::default(),
            dispatcher: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::dispatch_loop(Arc::clone(&engine), queue_rx));
        *engine.dispatcher.lock().await = Some(handle);

        Ok(engine)
    }

    /// Submit a task for execution.
    ///
    /// With `task_id` + `manual`, the existing task is reset and re-run.
    /// With a `spec`, the newest matching task is reused (legacy
    /// entrypoint) or a fresh one is created `pending`. A full queue
    /// refuses the submission and marks the task `failed`.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SyncTask, SyncError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SyncError::Config("engine is stopping".to_owned()));
        }

        let as_sink_err = |e: anyhow::Error| SyncError::Sink(e.to_string());

        // Resolve or create the task.
        let mut task = match (&request.task_id, &request.spec) {
            (Some(id), _) => tasks::get_task(&self.catalog, *id)
                .await
                .map_err(as_sink_err)?
                .ok_or_else(|| SyncError::Config(format!("task {id} not found")))?,
            (None, Some(spec)) => {
                let existing = tasks::find_latest_task(
                    &self.catalog,
                    spec.library_type,
                    spec.library_id,
                    spec.datasource_id,
                    spec.sync_type,
                )
                .await
                .map_err(as_sink_err)?;
                match existing {
                    Some(task) => task,
                    None => {
                        let task = tasks::insert_task(
                            &self.catalog,
                            spec.library_type,
                            spec.library_id,
                            spec.datasource_id,
                            spec.sync_type,
                            &spec.config,
                            spec.created_by.as_deref(),
                            None,
                        )
                        .await
                        .map_err(as_sink_err)?;
                        for interface_id in &spec.interface_ids {
                            task_interfaces::link_task_interface(
                                &self.catalog,
                                task.id,
                                *interface_id,
                            )
                            .await
                            .map_err(as_sink_err)?;
                        }
                        task
                    }
                }
            }
            (None, None) => {
                return Err(SyncError::Config(
                    "submit requires a task id or a task spec".to_owned(),
                ));
            }
        };

        // A finished task is reset for its new run: status back to
        // running, error cleared, start stamped. A task mid-flight cannot
        // be submitted again (one live execution per task).
        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Running | TaskStatus::Paused => {
                return Err(SyncError::Config(format!(
                    "task {} is {} and cannot be submitted",
                    task.id, task.status
                )));
            }
            _ => {
                let rows = tasks::rerun_task(&self.catalog, task.id)
                    .await
                    .map_err(as_sink_err)?;
                if rows == 0 {
                    return Err(SyncError::Config(format!(
                        "task {} could not be reset for re-run",
                        task.id
                    )));
                }
                task = tasks::get_task(&self.catalog, task.id)
                    .await
                    .map_err(as_sink_err)?
                    .ok_or_else(|| SyncError::Config(format!("task {} vanished", task.id)))?;
            }
        }

        let execution_type = if request.scheduled {
            ExecutionType::Scheduled
        } else {
            ExecutionType::Manual
        };

        let item = WorkItem {
            task_id: task.id,
            execution_type,
        };

        if let Err(e) = self.queue_tx.try_send(item) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "engine stopped",
            };
            let _ = tasks::mark_task_failed(&self.catalog, task.id, reason).await;
            tracing::warn!(task_id = %task.id, reason, "submission refused");
            return Err(SyncError::Config(format!("sync {reason}")));
        }

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::info!(task_id = %task.id, sync_type = %task.sync_type, "task submitted");
        Ok(task)
    }

    /// Cancel a running task. Non-running tasks cannot be cancelled.
    pub async fn cancel(&self, task_id: Uuid) -> Result<(), SyncError> {
        let cancel = {
            let running = self.running.read().await;
            running
                .get(&task_id)
                .map(|entry| entry.cancel.clone())
                .ok_or_else(|| SyncError::Config(format!("task {task_id} is not running")))?
        };

        cancel.cancel();
        // The worker also races toward this transition; whichever lands
        // first wins, the loser's optimistic lock failure is fine.
        let _ = tasks::transition_task_status(
            &self.catalog,
            task_id,
            TaskStatus::Running,
            TaskStatus::Cancelled,
            None,
        )
        .await;

        events::emit(
            &self.notifier,
            SyncEvent::new(task_id, SyncEventType::Cancel, json!({})),
        );
        tracing::info!(task_id = %task_id, "task cancelled");
        Ok(())
    }

    /// The task's catalog row plus live progress when it is running.
    pub async fn status(
        &self,
        task_id: Uuid,
    ) -> Result<(Option<SyncTask>, Option<ProgressSnapshot>), SyncError> {
        let task = tasks::get_task(&self.catalog, task_id)
            .await
            .map_err(|e| SyncError::Sink(e.to_string()))?;
        let progress = {
            let running = self.running.read().await;
            running.get(&task_id).map(|entry| entry.progress.snapshot())
        };
        Ok((task, progress))
    }

    /// Snapshots of every running task.
    pub async fn running_tasks(&self) -> Vec<RunningTaskInfo> {
        let running = self.running.read().await;
        running
            .iter()
            .map(|(task_id, entry)| RunningTaskInfo {
                task_id: *task_id,
                execution_id: entry.execution_id,
                progress: entry.progress.snapshot(),
            })
            .collect()
    }

    /// Engine counters.
    pub async fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            queued: self.config.queue_size - self.queue_tx.capacity(),
            running: self.running.read().await.len(),
        }
    }

    /// Stop the engine: refuse new submissions, cancel the root scope,
    /// wait up to the drain timeout for workers, then shut the
    /// datasource manager down so resident listeners release.
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.root_cancel.cancel();

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            if self.running.read().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.running.read().await.len();
                tracing::warn!(remaining, "drain timeout expired, abandoning running tasks");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }

        self.manager.shutdown().await;
        tracing::info!("engine stopped");
    }

    fn strategy_context(&self) -> StrategyContext {
        StrategyContext {
            catalog: self.catalog.clone(),
            manager: Arc::clone(&self.manager),
            mapper: Arc::clone(&self.mapper),
            sink: Arc::clone(&self.sink),
            default_batch_size: self.config.default_batch_size,
        }
    }

    /// Dispatcher: pull submissions in FIFO order, lease a permit, launch
    /// a worker. A saturated pool blocks here, so older submissions are
    /// never overtaken.
    async fn dispatch_loop(engine: Arc<Self>, mut queue_rx: mpsc::Receiver<WorkItem>) {
        let semaphore = Arc::new(Semaphore::new(engine.config.max_concurrent));

        loop {
            let item = tokio::select! {
                item = queue_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = engine.root_cancel.cancelled() => break,
            };

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = engine.root_cancel.cancelled() => break,
            };

            let worker_engine = Arc::clone(&engine);
            tokio::spawn(async move {
                worker_engine.run_task(item).await;
                drop(permit);
            });
        }

        tracing::debug!("dispatcher stopped");
    }

    /// One worker: the full lifecycle of a single run.
    async fn run_task(&self, item: WorkItem) {
        let task_id = item.task_id;

        let task = match tasks::get_task(&self.catalog, task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::error!(task_id = %task_id, "queued task no longer exists");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "failed to load queued task");
                return;
            }
        };

        let execution = match executions::insert_execution(&self.catalog, task_id, item.execution_type)
            .await
        {
            Ok(execution) => execution,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "failed to create execution");
                let _ = tasks::mark_task_failed(&self.catalog, task_id, &e.to_string()).await;
                return;
            }
        };

        let cancel = self.root_cancel.child_token();
        let progress = Arc::new(SyncProgress::new());

        {
            let mut running = self.running.write().await;
            running.insert(
                task_id,
                RunningTask {
                    cancel: cancel.clone(),
                    progress: Arc::clone(&progress),
                    execution_id: execution.id,
                },
            );
        }

        let result = self
            .execute_run(&task, execution.id, item.execution_type, &cancel, &progress)
            .await;

        {
            let mut running = self.running.write().await;
            running.remove(&task_id);
        }

        if let Err(e) = result {
            tracing::error!(task_id = %task_id, error = %e, "run bookkeeping failed");
        }
    }

    /// Status transitions, strategy invocation, and result persistence
    /// for one run. Returns bookkeeping errors only; sync failures are
    /// folded into the task and execution rows.
    async fn execute_run(
        &self,
        task: &SyncTask,
        execution_id: Uuid,
        execution_type: ExecutionType,
        cancel: &CancellationToken,
        progress: &Arc<SyncProgress>,
    ) -> Result<()> {
        // A manually re-run task is already `running`; a fresh one moves
        // pending -> running here.
        if task.status == TaskStatus::Pending {
            tasks::transition_task_status(
                &self.catalog,
                task.id,
                TaskStatus::Pending,
                TaskStatus::Running,
                None,
            )
            .await?;
        }
        executions::start_execution(&self.catalog, execution_id).await?;

        events::emit(
            &self.notifier,
            SyncEvent::new(
                task.id,
                SyncEventType::Start,
                json!({"sync_type": task.sync_type, "execution_id": execution_id}),
            ),
        );
        tracing::info!(task_id = %task.id, execution_id = %execution_id, "run started");

        // Progress events stream from a monitor so strategies stay off
        // the notification path entirely.
        let monitor_cancel = CancellationToken::new();
        let monitor = {
            let notifier = self.notifier.clone();
            let progress = Arc::clone(progress);
            let task_id = task.id;
            let stop = monitor_cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            let snapshot = progress.snapshot();
                            events::emit(
                                &notifier,
                                SyncEvent::new(
                                    task_id,
                                    SyncEventType::Progress,
                                    json!({
                                        "phase": snapshot.phase,
                                        "processed_rows": snapshot.processed_rows,
                                        "error_rows": snapshot.error_rows,
                                        "speed": snapshot.speed,
                                    }),
                                ),
                            );
                        }
                    }
                }
            })
        };

        let interfaces = {
            let ids = task_interfaces::get_interface_ids(&self.catalog, task.id).await?;
            let mut list = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(interface) = interface_db::get_interface(&self.catalog, id).await? {
                    list.push(interface);
                }
            }
            list
        };

        let ctx = self.strategy_context();
        let strategy = strategy_for(task.sync_type);
        let result = if interfaces.is_empty() {
            Err(SyncError::Config(format!(
                "task {} has no interfaces linked",
                task.id
            )))
        } else {
            strategy
                .process(&ctx, cancel, task, &interfaces, progress)
                .await
        };

        monitor_cancel.cancel();
        let _ = monitor.await;

        match result {
            Ok(outcome) => {
                executions::finish_execution(
                    &self.catalog,
                    execution_id,
                    ExecutionStatus::Success,
                    outcome.processed_rows,
                    outcome.success_rows,
                    outcome.error_rows,
                    &outcome.statistics,
                    None,
                )
                .await?;
                tasks::update_task_result(
                    &self.catalog,
                    task.id,
                    outcome.processed_rows,
                    outcome.error_rows,
                )
                .await?;
                tasks::transition_task_status(
                    &self.catalog,
                    task.id,
                    TaskStatus::Running,
                    TaskStatus::Success,
                    None,
                )
                .await?;

                // Scheduled runs advance the next fire time when the task
                // declares an interval; the cron scheduler reads it back.
                if execution_type == ExecutionType::Scheduled {
                    if let Some(interval) = task.config.get("interval_secs").and_then(|v| v.as_i64())
                    {
                        let next = Utc::now() + chrono::Duration::seconds(interval);
                        tasks::advance_next_run_time(&self.catalog, task.id, Some(next)).await?;
                    }
                }

                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                events::emit(
                    &self.notifier,
                    SyncEvent::new(
                        task.id,
                        SyncEventType::Complete,
                        json!({
                            "processed_rows": outcome.processed_rows,
                            "success_rows": outcome.success_rows,
                            "error_rows": outcome.error_rows,
                        }),
                    ),
                );
                tracing::info!(
                    task_id = %task.id,
                    rows = outcome.processed_rows,
                    "run succeeded"
                );

                if let Some(callback) = &self.completion {
                    if let Ok(Some(task)) = tasks::get_task(&self.catalog, task.id).await {
                        callback(&task);
                    }
                }
            }
            Err(SyncError::Cancelled) => {
                let snapshot = progress.snapshot();
                executions::finish_execution(
                    &self.catalog,
                    execution_id,
                    ExecutionStatus::Cancelled,
                    (snapshot.processed_rows + snapshot.error_rows) as i64,
                    snapshot.processed_rows as i64,
                    snapshot.error_rows as i64,
                    &json!({}),
                    None,
                )
                .await?;
                // `cancel` usually set the status already; this covers
                // cancellation via engine stop.
                let _ = tasks::transition_task_status(
                    &self.catalog,
                    task.id,
                    TaskStatus::Running,
                    TaskStatus::Cancelled,
                    None,
                )
                .await;
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                tracing::info!(task_id = %task.id, "run cancelled");
            }
            Err(e) => {
                let snapshot = progress.snapshot();
                let message = e.to_string();
                executions::finish_execution(
                    &self.catalog,
                    execution_id,
                    ExecutionStatus::Failed,
                    (snapshot.processed_rows + snapshot.error_rows) as i64,
                    snapshot.processed_rows as i64,
                    snapshot.error_rows as i64,
                    &json!({"error_kind": e.kind()}),
                    Some(&message),
                )
                .await?;
                let _ = tasks::transition_task_status(
                    &self.catalog,
                    task.id,
                    TaskStatus::Running,
                    TaskStatus::Failed,
                    Some(&message),
                )
                .await;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                events::emit(
                    &self.notifier,
                    SyncEvent::new(
                        task.id,
                        SyncEventType::Error,
                        json!({"error": message, "kind": e.kind()}),
                    ),
                );
                tracing::error!(task_id = %task.id, error = %message, "run failed");
            }
        }

        Ok(())
    }
}
