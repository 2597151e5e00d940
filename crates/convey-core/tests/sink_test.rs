//! Integration tests for the warehouse sink: replace / append / upsert
//! semantics, chunked transactions, typed casts, and dead-letter landing.

use std::collections::HashMap;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use convey_core::mapping::ColumnType;
use convey_core::sink::{PostgresSink, Sink, TableRef};
use convey_test_utils::{create_test_db, drop_test_db};

fn row(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

async fn create_target(pool: &sqlx::PgPool) {
    sqlx::query(
        "CREATE TABLE public.landed ( \
             id TEXT PRIMARY KEY, \
             n INTEGER, \
             flag BOOLEAN, \
             ts TIMESTAMP)",
    )
    .execute(pool)
    .await
    .expect("create target table");
}

fn target_columns() -> HashMap<String, ColumnType> {
    HashMap::from([
        ("id".to_owned(), ColumnType::Varchar),
        ("n".to_owned(), ColumnType::Integer),
        ("flag".to_owned(), ColumnType::Boolean),
        ("ts".to_owned(), ColumnType::Timestamp),
    ])
}

async fn count(pool: &sqlx::PgPool) -> i64 {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM public.landed")
        .fetch_one(pool)
        .await
        .unwrap();
    row.0
}

#[tokio::test]
async fn replace_truncates_then_inserts() {
    let (pool, db_name) = create_test_db().await;
    create_target(&pool).await;
    let sink = PostgresSink::new(pool.clone());
    let table = TableRef::new("public", "landed");
    let cancel = CancellationToken::new();
    let columns = target_columns();

    let first = vec![row(json!({"id": "a", "n": 1})), row(json!({"id": "b", "n": 2}))];
    let written = sink.replace(&cancel, &table, &columns, &first).await.unwrap();
    assert_eq!(written, 2);
    assert_eq!(count(&pool).await, 2);

    // A second replace discards the previous snapshot entirely.
    let second = vec![row(json!({"id": "c", "n": 3}))];
    sink.replace(&cancel, &table, &columns, &second).await.unwrap();
    assert_eq!(count(&pool).await, 1);
    let (id,): (String,) = sqlx::query_as("SELECT id FROM public.landed")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(id, "c");

    // Replacing with nothing still truncates.
    sink.replace(&cancel, &table, &columns, &[]).await.unwrap();
    assert_eq!(count(&pool).await, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn replace_twice_is_idempotent_on_stable_input() {
    let (pool, db_name) = create_test_db().await;
    create_target(&pool).await;
    let sink = PostgresSink::new(pool.clone());
    let table = TableRef::new("public", "landed");
    let cancel = CancellationToken::new();
    let columns = target_columns();

    let rows: Vec<_> = (0..10)
        .map(|i| row(json!({"id": format!("r{i}"), "n": i})))
        .collect();

    sink.replace(&cancel, &table, &columns, &rows).await.unwrap();
    let first: Vec<(String, Option<i32>)> =
        sqlx::query_as("SELECT id, n FROM public.landed ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();

    sink.replace(&cancel, &table, &columns, &rows).await.unwrap();
    let second: Vec<(String, Option<i32>)> =
        sqlx::query_as("SELECT id, n FROM public.landed ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();

    assert_eq!(first, second, "full sync twice lands the same row set");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn coerced_values_land_with_their_declared_types() {
    let (pool, db_name) = create_test_db().await;
    create_target(&pool).await;
    let sink = PostgresSink::new(pool.clone());
    let table = TableRef::new("public", "landed");
    let cancel = CancellationToken::new();
    let columns = target_columns();

    // The shapes the coercer emits: normalized timestamp string, real
    // bool, real integer.
    let rows = vec![row(json!({
        "id": "typed",
        "ts": "2024-05-01 12:34:56.000",
        "flag": true,
        "n": 42,
    }))];
    sink.append(&cancel, &table, &columns, &rows).await.unwrap();

    let (n, flag, ts): (Option<i32>, Option<bool>, Option<chrono::NaiveDateTime>) =
        sqlx::query_as("SELECT n, flag, ts FROM public.landed WHERE id = 'typed'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(n, Some(42));
    assert_eq!(flag, Some(true));
    assert_eq!(
        ts.unwrap().format("%Y-%m-%d %H:%M:%S").to_string(),
        "2024-05-01 12:34:56"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn upsert_inserts_then_updates_by_key() {
    let (pool, db_name) = create_test_db().await;
    create_target(&pool).await;
    let sink = PostgresSink::new(pool.clone());
    let table = TableRef::new("public", "landed");
    let cancel = CancellationToken::new();
    let columns = target_columns();
    let keys = vec!["id".to_owned()];

    sink.upsert(
        &cancel,
        &table,
        &columns,
        &[row(json!({"id": "k", "n": 1}))],
        &keys,
    )
    .await
    .unwrap();

    // Same key, new value: updated in place, no duplicate.
    sink.upsert(
        &cancel,
        &table,
        &columns,
        &[row(json!({"id": "k", "n": 99}))],
        &keys,
    )
    .await
    .unwrap();

    assert_eq!(count(&pool).await, 1);
    let (n,): (Option<i32>,) = sqlx::query_as("SELECT n FROM public.landed WHERE id = 'k'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(n, Some(99));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failing_chunk_rolls_back_but_keeps_prior_chunks() {
    let (pool, db_name) = create_test_db().await;
    create_target(&pool).await;
    // Chunk size 2: rows land two per transaction.
    let sink = PostgresSink::with_batch_size(pool.clone(), 2);
    let table = TableRef::new("public", "landed");
    let cancel = CancellationToken::new();
    let columns = target_columns();

    // Chunk 1 is fine; chunk 2 violates the primary key on its second
    // row, so the whole second chunk rolls back.
    let rows = vec![
        row(json!({"id": "a", "n": 1})),
        row(json!({"id": "b", "n": 2})),
        row(json!({"id": "c", "n": 3})),
        row(json!({"id": "a", "n": 4})),
    ];
    let err = sink.append(&cancel, &table, &columns, &rows).await.unwrap_err();
    assert_eq!(err.kind(), "sink");

    let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM public.landed ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    let ids: Vec<&str> = ids.iter().map(|(id,)| id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"], "only the committed chunk remains");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancellation_before_chunk_stops_landing() {
    let (pool, db_name) = create_test_db().await;
    create_target(&pool).await;
    let sink = PostgresSink::new(pool.clone());
    let table = TableRef::new("public", "landed");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = sink
        .append(
            &cancel,
            &table,
            &target_columns(),
            &[row(json!({"id": "x"}))],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "cancelled");
    assert_eq!(count(&pool).await, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dead_letter_creates_table_and_records_error() {
    let (pool, db_name) = create_test_db().await;
    create_target(&pool).await;
    let sink = PostgresSink::new(pool.clone());
    let table = TableRef::new("public", "landed");

    let rows = vec![row(json!({"id": "dl", "n": 7}))];
    let written = sink.dead_letter(&table, &rows, "landing exploded").await.unwrap();
    assert_eq!(written, 1);

    let (payload, error): (Value, Option<String>) =
        sqlx::query_as("SELECT payload, error FROM public.landed_dead_letter")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payload["id"], json!("dl"));
    assert_eq!(error.as_deref(), Some("landing exploded"));

    pool.close().await;
    drop_test_db(&db_name).await;
}
