//! Integration tests for database migrations and connection pooling.
//!
//! Each test creates a unique temporary database inside a shared
//! containerized PostgreSQL instance (via testcontainers), runs migrations,
//! and drops it on completion so tests are fully isolated and idempotent.

use convey_db::pool;
use convey_test_utils::{create_test_db, drop_test_db};

/// Expected tables created by the initial migration.
const EXPECTED_TABLES: &[&str] = &[
    "data_interfaces",
    "datasources",
    "sync_task_executions",
    "sync_task_interfaces",
    "sync_tasks",
];

#[tokio::test]
async fn migrations_create_all_tables() {
    let (temp_pool, db_name) = create_test_db().await;

    // Verify all expected tables exist.
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(&temp_pool)
    .await
    .expect("should list tables");

    let user_tables: Vec<&str> = rows
        .iter()
        .map(|(name,)| name.as_str())
        .filter(|t| !t.starts_with("_sqlx"))
        .collect();

    assert_eq!(
        user_tables, EXPECTED_TABLES,
        "migration should create exactly the expected tables"
    );

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (temp_pool, db_name) = create_test_db().await;

    // create_test_db already ran migrations once; a second run should be a
    // no-op.
    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("second migration run should succeed (idempotent)");

    for table in EXPECTED_TABLES {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let row: (i64,) = sqlx::query_as(&query)
            .fetch_one(&temp_pool)
            .await
            .unwrap_or_else(|e| panic!("table {table} should exist: {e}"));
        assert_eq!(row.0, 0, "table {table} should be empty");
    }

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn status_check_constraint_rejects_unknown_status() {
    let (temp_pool, db_name) = create_test_db().await;

    let ds = convey_db::queries::datasources::insert_datasource(
        &temp_pool,
        "check-constraint-ds",
        convey_db::models::DataSourceKind::ApiHttp,
        &serde_json::json!({}),
    )
    .await
    .expect("insert datasource");

    let result = sqlx::query(
        "INSERT INTO sync_tasks (library_type, library_id, datasource_id, sync_type, status) \
         VALUES ('basic', gen_random_uuid(), $1, 'full', 'bogus')",
    )
    .bind(ds.id)
    .execute(&temp_pool)
    .await;

    assert!(result.is_err(), "CHECK constraint should reject unknown status");

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}
