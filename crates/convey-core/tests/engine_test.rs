//! End-to-end engine tests: submission, the worker pool, strategies
//! against fake and real datasource instances, cancellation, and queue
//! backpressure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use convey_db::models::{
    DataSource, DataSourceKind, ExecutionStatus, LibraryType, SyncTask, SyncType, TaskStatus,
};
use convey_db::queries::{datasources, executions, interfaces, task_interfaces, tasks};
use convey_test_utils::{create_test_db, drop_test_db};

use convey_core::datasource::{
    DataRequest, DataResponse, DatasourceInstance, DatasourceManager, DatasourceRegistry,
};
use convey_core::engine::{EngineConfig, SubmitRequest, SyncEngine};
use convey_core::error::SyncError;
use convey_core::sink::PostgresSink;

// ===========================================================================
// Test harness
// ===========================================================================

struct TestHarness {
    pool: PgPool,
    db_name: String,
}

impl TestHarness {
    async fn new() -> Self {
        let (pool, db_name) = create_test_db().await;
        Self { pool, db_name }
    }

    async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }

    async fn create_target(&self, table: &str) {
        let sql = format!(
            "CREATE TABLE public.{table} (id TEXT PRIMARY KEY, n INTEGER, updated_at TIMESTAMP)"
        );
        sqlx::query(&sql).execute(&self.pool).await.expect("create target");
    }

    async fn target_count(&self, table: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) FROM public.{table}");
        let row: (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await.unwrap();
        row.0
    }

    /// Seed a datasource + interface + task triple for a fake upstream.
    async fn seed(
        &self,
        table: &str,
        parse_config: Value,
        fields_config: Value,
        sync_type: SyncType,
        task_config: Value,
    ) -> SyncTask {
        let ds = datasources::insert_datasource(
            &self.pool,
            &format!("ds-{}", Uuid::new_v4().simple()),
            DataSourceKind::ApiHttp,
            &json!({"base_url": "https://fake.invalid"}),
        )
        .await
        .unwrap();

        let iface = interfaces::insert_interface(
            &self.pool,
            &format!("iface-{table}"),
            ds.id,
            "public",
            table,
            &parse_config,
            &fields_config,
        )
        .await
        .unwrap();

        let task = tasks::insert_task(
            &self.pool,
            LibraryType::Basic,
            Uuid::new_v4(),
            ds.id,
            sync_type,
            &task_config,
            Some("tests"),
            None,
        )
        .await
        .unwrap();
        task_interfaces::link_task_interface(&self.pool, task.id, iface.id)
            .await
            .unwrap();

        task
    }

    async fn wait_terminal(&self, task_id: Uuid, timeout: Duration) -> SyncTask {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = tasks::get_task(&self.pool, task_id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} did not finish in time (status {})",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn start_engine(
    harness: &TestHarness,
    instance: Arc<dyn DatasourceInstance>,
    config: EngineConfig,
) -> Arc<SyncEngine> {
    let mut registry = DatasourceRegistry::new();
    registry.register_kind(DataSourceKind::ApiHttp, move |_ds| Ok(Arc::clone(&instance)));
    let manager = Arc::new(DatasourceManager::new(registry));
    let sink = Arc::new(PostgresSink::new(harness.pool.clone()));

    SyncEngine::start(harness.pool.clone(), manager, sink, config, None, None)
        .await
        .expect("engine should start")
}

fn paged_parse_config() -> Value {
    json!({
        "request": {"url_suffix": "/rows"},
        "pagination": {
            "enabled": true,
            "page_param": "page",
            "size_param": "size",
            "start_value": 1,
        },
    })
}

fn id_n_fields() -> Value {
    json!([
        {"field_name": "id", "data_type": "varchar", "primary_key": true},
        {"field_name": "n", "data_type": "integer"},
        {"field_name": "updated_at", "data_type": "timestamp"},
    ])
}

// ===========================================================================
// Fake upstreams
// ===========================================================================

/// Serves `total` synthetic rows through page/size query params, with an
/// optional per-request delay.
#[derive(Debug)]
struct PagedUpstream {
    total: usize,
    delay: Duration,
    executes: AtomicU32,
}

impl PagedUpstream {
    fn new(total: usize) -> Self {
        Self {
            total,
            delay: Duration::ZERO,
            executes: AtomicU32::new(0),
        }
    }

    fn with_delay(total: usize, delay: Duration) -> Self {
        Self {
            total,
            delay,
            executes: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DatasourceInstance for PagedUpstream {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::ApiHttp
    }

    fn is_started(&self) -> bool {
        true
    }

    async fn start(&self, _cancel: &CancellationToken) -> Result<(), SyncError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &DataRequest,
    ) -> Result<DataResponse, SyncError> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            }
        }

        let query = request.params.get("query").and_then(|v| v.as_object());
        let page = query
            .and_then(|q| q.get("page"))
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as usize;
        let size = query
            .and_then(|q| q.get("size"))
            .and_then(|v| v.as_u64())
            .unwrap_or(1000) as usize;

        let start = (page - 1) * size;
        let end = (start + size).min(self.total);
        let rows: Vec<Value> = (start..end)
            .map(|i| json!({"id": format!("r{i}"), "n": i}))
            .collect();

        Ok(DataResponse::ok(Value::Array(rows)))
    }
}

/// Captures each request and returns a fixed batch of rows.
#[derive(Debug)]
struct CapturingUpstream {
    rows: Vec<Value>,
    requests: std::sync::Mutex<Vec<DataRequest>>,
}

impl CapturingUpstream {
    fn new(rows: Vec<Value>) -> Self {
        Self {
            rows,
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn captured_cursor(&self, param: &str) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| {
                r.params
                    .get("query")
                    .and_then(|q| q.get(param))
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            })
            .collect()
    }
}

#[async_trait]
impl DatasourceInstance for CapturingUpstream {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::ApiHttp
    }

    fn is_started(&self) -> bool {
        true
    }

    async fn start(&self, _cancel: &CancellationToken) -> Result<(), SyncError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        request: &DataRequest,
    ) -> Result<DataResponse, SyncError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(DataResponse::ok(Value::Array(self.rows.clone())))
    }
}

/// A resident upstream whose drain yields `per_drain` rows per call.
#[derive(Debug)]
struct ResidentUpstream {
    per_drain: usize,
    drained: AtomicUsize,
    started: std::sync::atomic::AtomicBool,
}

impl ResidentUpstream {
    fn new(per_drain: usize) -> Self {
        Self {
            per_drain,
            drained: AtomicUsize::new(0),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DatasourceInstance for ResidentUpstream {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::ApiHttp
    }

    fn is_resident(&self) -> bool {
        true
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn start(&self, _cancel: &CancellationToken) -> Result<(), SyncError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _request: &DataRequest,
    ) -> Result<DataResponse, SyncError> {
        let base = self.drained.fetch_add(self.per_drain, Ordering::SeqCst);
        let rows: Vec<Value> = (base..base + self.per_drain)
            .map(|i| json!({"id": format!("m{i}"), "n": i}))
            .collect();
        Ok(DataResponse::ok(Value::Array(rows)))
    }
}

/// Refuses every request with a field-level error.
#[derive(Debug)]
struct RefusingUpstream;

#[async_trait]
impl DatasourceInstance for RefusingUpstream {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::ApiHttp
    }

    fn is_started(&self) -> bool {
        true
    }

    async fn start(&self, _cancel: &CancellationToken) -> Result<(), SyncError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _request: &DataRequest,
    ) -> Result<DataResponse, SyncError> {
        Ok(DataResponse::refused("bad"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test(flavor = "multi_thread")]
async fn full_sync_pages_until_short_page() {
    let harness = TestHarness::new().await;
    harness.create_target("fact_rows").await;

    let upstream = Arc::new(PagedUpstream::new(2501));
    let task = harness
        .seed(
            "fact_rows",
            paged_parse_config(),
            id_n_fields(),
            SyncType::Full,
            json!({"batch_size": 1000}),
        )
        .await;

    let engine = start_engine(
        &harness,
        Arc::clone(&upstream) as Arc<dyn DatasourceInstance>,
        EngineConfig::default(),
    )
    .await;

    engine
        .submit(SubmitRequest {
            task_id: Some(task.id),
            ..SubmitRequest::default()
        })
        .await
        .expect("submit");

    let done = harness.wait_terminal(task.id, Duration::from_secs(30)).await;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(harness.target_count("fact_rows").await, 2501);

    // Pages of 1000/1000/501: the short page terminates the loop.
    assert_eq!(upstream.executes.load(Ordering::SeqCst), 3);

    let execs = executions::list_executions_for_task(&harness.pool, task.id, 10)
        .await
        .unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ExecutionStatus::Success);
    assert_eq!(execs[0].processed_rows, 2501);
    assert_eq!(execs[0].processed_rows, execs[0].success_rows + execs[0].error_rows);

    let stats = engine.statistics().await;
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.succeeded, 1);

    engine.stop().await;
    harness.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn full_sync_replaces_previous_snapshot() {
    let harness = TestHarness::new().await;
    harness.create_target("snap_rows").await;

    // Pre-existing rows from an older snapshot must vanish.
    sqlx::query("INSERT INTO public.snap_rows (id, n) VALUES ('stale', -1)")
        .execute(&harness.pool)
        .await
        .unwrap();

    let upstream = Arc::new(PagedUpstream::new(5));
    let task = harness
        .seed(
            "snap_rows",
            paged_parse_config(),
            id_n_fields(),
            SyncType::Full,
            json!({"batch_size": 1000}),
        )
        .await;

    let engine = start_engine(
        &harness,
        Arc::clone(&upstream) as Arc<dyn DatasourceInstance>,
        EngineConfig::default(),
    )
    .await;
    engine
        .submit(SubmitRequest {
            task_id: Some(task.id),
            ..SubmitRequest::default()
        })
        .await
        .unwrap();

    let done = harness.wait_terminal(task.id, Duration::from_secs(30)).await;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(harness.target_count("snap_rows").await, 5);

    let stale: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM public.snap_rows WHERE id = 'stale'")
            .fetch_one(&harness.pool)
            .await
            .unwrap();
    assert_eq!(stale.0, 0, "replace discards the old snapshot");

    engine.stop().await;
    harness.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn incremental_sends_cursor_and_advances_it() {
    let harness = TestHarness::new().await;
    harness.create_target("inc_rows").await;

    let rows: Vec<Value> = (0..12)
        .map(|i| json!({"id": format!("u{i}"), "n": i, "updated_at": "2024-01-02T10:00:00Z"}))
        .collect();
    let upstream = Arc::new(CapturingUpstream::new(rows));

    let parse_config = json!({
        "request": {"url_suffix": "/events"},
        "incremental": {
            "param_name": "since",
            "param_location": "query",
            "field_type": "timestamp",
        },
    });
    let task = harness
        .seed(
            "inc_rows",
            parse_config,
            id_n_fields(),
            SyncType::Incremental,
            json!({"batch_size": 100, "last_sync_time": "2024-01-01T00:00:00Z"}),
        )
        .await;

    let engine = start_engine(
        &harness,
        Arc::clone(&upstream) as Arc<dyn DatasourceInstance>,
        EngineConfig::default(),
    )
    .await;

    engine
        .submit(SubmitRequest {
            task_id: Some(task.id),
            ..SubmitRequest::default()
        })
        .await
        .unwrap();
    let done = harness.wait_terminal(task.id, Duration::from_secs(30)).await;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(harness.target_count("inc_rows").await, 12);

    // The first request carried the persisted cursor.
    let cursors = upstream.captured_cursor("since");
    assert_eq!(cursors.first().map(String::as_str), Some("2024-01-01T00:00:00Z"));

    // The cursor moved forward (to "now", which is ≥ the newest row).
    let new_cursor = done.last_sync_time().expect("cursor present").to_owned();
    assert!(new_cursor.as_str() > "2024-01-01T00:00:00Z");
    assert!(new_cursor.as_str() >= "2024-01-02T10:00:00Z");

    // Re-running upserts the same keys: still 12 rows, and the request
    // carried the new cursor.
    engine
        .submit(SubmitRequest {
            task_id: Some(task.id),
            manual: true,
            ..SubmitRequest::default()
        })
        .await
        .unwrap();
    let done = harness.wait_terminal(task.id, Duration::from_secs(30)).await;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(harness.target_count("inc_rows").await, 12, "upsert deduplicates by key");

    let cursors = upstream.captured_cursor("since");
    assert_eq!(cursors.last(), Some(&new_cursor));

    engine.stop().await;
    harness.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_response_fails_run_with_upstream_error() {
    let harness = TestHarness::new().await;
    harness.create_target("refused_rows").await;

    let task = harness
        .seed(
            "refused_rows",
            json!({"request": {"url_suffix": "/rows"}}),
            id_n_fields(),
            SyncType::Full,
            json!({}),
        )
        .await;

    let engine = start_engine(
        &harness,
        Arc::new(RefusingUpstream) as Arc<dyn DatasourceInstance>,
        EngineConfig::default(),
    )
    .await;
    engine
        .submit(SubmitRequest {
            task_id: Some(task.id),
            ..SubmitRequest::default()
        })
        .await
        .unwrap();

    let done = harness.wait_terminal(task.id, Duration::from_secs(30)).await;
    assert_eq!(done.status, TaskStatus::Failed);
    assert!(
        done.error_message.as_deref().unwrap_or("").contains("bad"),
        "task error carries the upstream message: {:?}",
        done.error_message
    );
    assert_eq!(harness.target_count("refused_rows").await, 0, "zero rows written");

    engine.stop().await;
    harness.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_keeps_landed_pages_only() {
    let harness = TestHarness::new().await;
    harness.create_target("cancel_rows").await;

    // 10 pages of 1000, each taking ~300ms upstream.
    let upstream = Arc::new(PagedUpstream::with_delay(
        10_000,
        Duration::from_millis(300),
    ));
    let task = harness
        .seed(
            "cancel_rows",
            paged_parse_config(),
            id_n_fields(),
            SyncType::Full,
            json!({"batch_size": 1000}),
        )
        .await;

    let engine = start_engine(
        &harness,
        Arc::clone(&upstream) as Arc<dyn DatasourceInstance>,
        EngineConfig::default(),
    )
    .await;
    engine
        .submit(SubmitRequest {
            task_id: Some(task.id),
            ..SubmitRequest::default()
        })
        .await
        .unwrap();

    // Wait until at least two pages landed, checking the running-task
    // invariants mid-flight.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while harness.target_count("cancel_rows").await < 2000 {
        assert!(tokio::time::Instant::now() < deadline, "pages never landed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let running = engine.running_tasks().await;
    assert_eq!(running.len(), 1, "exactly one running-map entry");
    assert_eq!(running[0].task_id, task.id);
    assert_eq!(
        executions::count_running_executions(&harness.pool, task.id)
            .await
            .unwrap(),
        1,
        "exactly one live execution row"
    );

    engine.cancel(task.id).await.expect("cancel running task");
    let done = harness.wait_terminal(task.id, Duration::from_secs(30)).await;
    assert_eq!(done.status, TaskStatus::Cancelled);

    // Whole chunks only: no partial page survived the rollback.
    let landed = harness.target_count("cancel_rows").await;
    assert!(landed >= 2000, "committed chunks remain ({landed})");
    assert_eq!(landed % 1000, 0, "no partial chunk ({landed})");

    let execs = executions::list_executions_for_task(&harness.pool, task.id, 10)
        .await
        .unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ExecutionStatus::Cancelled);

    // A task that is not running cannot be cancelled.
    let err = engine.cancel(task.id).await.unwrap_err();
    assert_eq!(err.kind(), "config");

    engine.stop().await;
    harness.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn realtime_streams_until_cancelled() {
    let harness = TestHarness::new().await;
    harness.create_target("rt_rows").await;

    let upstream = Arc::new(ResidentUpstream::new(3));
    let task = harness
        .seed(
            "rt_rows",
            json!({}),
            id_n_fields(),
            SyncType::Realtime,
            json!({"batch_size": 3, "poll_interval_secs": 1, "batch_timeout_secs": 1}),
        )
        .await;

    let engine = start_engine(
        &harness,
        Arc::clone(&upstream) as Arc<dyn DatasourceInstance>,
        EngineConfig::default(),
    )
    .await;
    engine
        .submit(SubmitRequest {
            task_id: Some(task.id),
            ..SubmitRequest::default()
        })
        .await
        .unwrap();

    // The strategy must start the resident instance and land batches.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while harness.target_count("rt_rows").await < 3 {
        assert!(tokio::time::Instant::now() < deadline, "no realtime rows landed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(upstream.is_started(), "resident instance started by the strategy");

    engine.cancel(task.id).await.expect("cancel realtime task");
    let done = harness.wait_terminal(task.id, Duration::from_secs(30)).await;
    assert_eq!(done.status, TaskStatus::Cancelled);
    assert!(harness.target_count("rt_rows").await >= 3);

    engine.stop().await;
    harness.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn full_queue_refuses_submission_and_fails_task() {
    let harness = TestHarness::new().await;
    harness.create_target("queue_rows").await;

    // Slow upstream so the single worker stays busy.
    let upstream = Arc::new(PagedUpstream::with_delay(10, Duration::from_secs(3)));
    let config = EngineConfig {
        max_concurrent: 1,
        queue_size: 1,
        ..EngineConfig::default()
    };
    let engine = start_engine(
        &harness,
        Arc::clone(&upstream) as Arc<dyn DatasourceInstance>,
        config,
    )
    .await;

    let mut task_ids = Vec::new();
    for _ in 0..4 {
        let task = harness
            .seed(
                "queue_rows",
                paged_parse_config(),
                id_n_fields(),
                SyncType::Full,
                json!({"batch_size": 1000}),
            )
            .await;
        task_ids.push(task.id);
    }

    // First fills the worker, second sits with the dispatcher, third
    // fills the queue.
    for task_id in &task_ids[..3] {
        engine
            .submit(SubmitRequest {
                task_id: Some(*task_id),
                ..SubmitRequest::default()
            })
            .await
            .expect("submission should be accepted");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Fourth: the queue refuses without enqueueing, the task fails.
    let err = engine
        .submit(SubmitRequest {
            task_id: Some(task_ids[3]),
            ..SubmitRequest::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("queue full"), "{err}");

    let refused = tasks::get_task(&harness.pool, task_ids[3]).await.unwrap().unwrap();
    assert_eq!(refused.status, TaskStatus::Failed);
    assert_eq!(refused.error_message.as_deref(), Some("queue full"));

    engine.stop().await;
    harness.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_recovery_fails_orphaned_running_tasks() {
    let harness = TestHarness::new().await;
    harness.create_target("orphan_rows").await;

    // Simulate a crash: a task left `running` with a dangling execution.
    let task = harness
        .seed(
            "orphan_rows",
            paged_parse_config(),
            id_n_fields(),
            SyncType::Full,
            json!({}),
        )
        .await;
    tasks::transition_task_status(
        &harness.pool,
        task.id,
        TaskStatus::Pending,
        TaskStatus::Running,
        None,
    )
    .await
    .unwrap();
    let exec = executions::insert_execution(
        &harness.pool,
        task.id,
        convey_db::models::ExecutionType::Scheduled,
    )
    .await
    .unwrap();
    executions::start_execution(&harness.pool, exec.id).await.unwrap();

    // Engine start runs recovery before accepting work.
    let engine = start_engine(
        &harness,
        Arc::new(PagedUpstream::new(0)) as Arc<dyn DatasourceInstance>,
        EngineConfig::default(),
    )
    .await;

    let recovered = tasks::get_task(&harness.pool, task.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, TaskStatus::Failed);
    assert_eq!(
        recovered.error_message.as_deref(),
        Some("interrupted by restart")
    );
    let execs = executions::list_executions_for_task(&harness.pool, task.id, 10)
        .await
        .unwrap();
    assert_eq!(execs[0].status, ExecutionStatus::Failed);

    engine.stop().await;
    harness.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn real_postgres_upstream_lands_through_sql_builder() {
    use convey_core::datasource::database::PostgresInstance;

    let harness = TestHarness::new().await;

    // Source table in the same database; target alongside it.
    sqlx::query("CREATE TABLE public.src_items (id TEXT PRIMARY KEY, n INTEGER)")
        .execute(&harness.pool)
        .await
        .unwrap();
    for i in 0..25 {
        sqlx::query("INSERT INTO public.src_items (id, n) VALUES ($1, $2)")
            .bind(format!("s{i}"))
            .bind(i)
            .execute(&harness.pool)
            .await
            .unwrap();
    }
    harness.create_target("db_rows").await;

    let ds = datasources::insert_datasource(
        &harness.pool,
        "pg-src",
        DataSourceKind::DatabasePostgres,
        &json!({"host": "unused", "database": "unused"}),
    )
    .await
    .unwrap();
    let iface = interfaces::insert_interface(
        &harness.pool,
        "items",
        ds.id,
        "public",
        "db_rows",
        &json!({
            "custom_sql": "SELECT id, n FROM public.src_items ORDER BY n",
        }),
        &id_n_fields(),
    )
    .await
    .unwrap();
    let task = tasks::insert_task(
        &harness.pool,
        LibraryType::Basic,
        Uuid::new_v4(),
        ds.id,
        SyncType::Full,
        &json!({}),
        None,
        None,
    )
    .await
    .unwrap();
    task_interfaces::link_task_interface(&harness.pool, task.id, iface.id)
        .await
        .unwrap();

    // The factory hands out a real SQL instance bound to the test pool.
    let source_pool = harness.pool.clone();
    let mut registry = DatasourceRegistry::new();
    registry.register_kind(DataSourceKind::DatabasePostgres, move |_ds: &DataSource| {
        Ok(Arc::new(PostgresInstance::from_pool(source_pool.clone()))
            as Arc<dyn DatasourceInstance>)
    });
    let manager = Arc::new(DatasourceManager::new(registry));
    let sink = Arc::new(PostgresSink::new(harness.pool.clone()));
    let engine = SyncEngine::start(
        harness.pool.clone(),
        manager,
        sink,
        EngineConfig::default(),
        None,
        None,
    )
    .await
    .unwrap();

    engine
        .submit(SubmitRequest {
            task_id: Some(task.id),
            ..SubmitRequest::default()
        })
        .await
        .unwrap();
    let done = harness.wait_terminal(task.id, Duration::from_secs(30)).await;
    assert_eq!(done.status, TaskStatus::Success, "error: {:?}", done.error_message);
    assert_eq!(harness.target_count("db_rows").await, 25);

    engine.stop().await;
    harness.teardown().await;
}
