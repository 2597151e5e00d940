//! Transactional landing into the warehouse.
//!
//! All operations are scoped by `"schema"."table"`, chunked to the
//! configured batch size, and wrapped in one transaction per chunk so a
//! mid-run failure caps blast radius: chunks landed before the failure
//! stay, the failing chunk rolls back.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::postgres::PgArguments;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::mapping::ColumnType;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// A `"schema"."table"` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Quoted, qualified name. Identifiers come from the catalog, so
    /// embedded quotes are rejected rather than escaped.
    pub fn qualified(&self) -> Result<String, SyncError> {
        Ok(format!(
            "{}.{}",
            quote_ident(&self.schema)?,
            quote_ident(&self.table)?
        ))
    }

    /// The dead-letter companion table.
    pub fn dead_letter(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            table: format!("{}_dead_letter", self.table),
        }
    }
}

pub(crate) fn quote_ident(ident: &str) -> Result<String, SyncError> {
    if ident.is_empty() || ident.contains('"') {
        return Err(SyncError::Config(format!(
            "invalid SQL identifier: {ident:?}"
        )));
    }
    Ok(format!("\"{ident}\""))
}

/// Bind a JSON value with its natural Postgres type.
pub(crate) fn bind_json_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, PgArguments>,
    value: &Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => query.bind(s.clone()),
        // Objects and arrays land as jsonb.
        other => query.bind(other.clone()),
    }
}

/// Transactional writes against the warehouse.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Full-sync landing: delete everything, then insert `rows`. The
    /// DELETE shares the first chunk's transaction.
    async fn replace(
        &self,
        cancel: &CancellationToken,
        table: &TableRef,
        columns: &HashMap<String, ColumnType>,
        rows: &[Map<String, Value>],
    ) -> Result<u64, SyncError>;

    /// Incremental insert landing.
    async fn append(
        &self,
        cancel: &CancellationToken,
        table: &TableRef,
        columns: &HashMap<String, ColumnType>,
        rows: &[Map<String, Value>],
    ) -> Result<u64, SyncError>;

    /// Keyed upsert landing.
    async fn upsert(
        &self,
        cancel: &CancellationToken,
        table: &TableRef,
        columns: &HashMap<String, ColumnType>,
        rows: &[Map<String, Value>],
        keys: &[String],
    ) -> Result<u64, SyncError>;

    /// Land rows that exhausted their retries into the dead-letter
    /// companion table, creating it on first use.
    async fn dead_letter(
        &self,
        table: &TableRef,
        rows: &[Map<String, Value>],
        error: &str,
    ) -> Result<u64, SyncError>;
}

/// The PostgreSQL warehouse sink.
pub struct PostgresSink {
    pool: PgPool,
    batch_size: usize,
}

enum LandMode<'a> {
    Insert,
    Upsert(&'a [String]),
}

impl PostgresSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Build the per-row INSERT with typed casts. One INSERT per row keeps
    /// error attribution exact.
    fn row_sql(
        qualified: &str,
        row: &Map<String, Value>,
        columns: &HashMap<String, ColumnType>,
        mode: &LandMode<'_>,
    ) -> Result<String, SyncError> {
        if row.is_empty() {
            return Err(SyncError::Mapping("cannot land an empty row".to_owned()));
        }

        let mut names = Vec::with_capacity(row.len());
        let mut placeholders = Vec::with_capacity(row.len());
        for (i, column) in row.keys().enumerate() {
            let ty = columns
                .get(column)
                .copied()
                .unwrap_or_else(|| ColumnType::infer_from_name(column));
            names.push(quote_ident(column)?);
            placeholders.push(format!("${}::{}", i + 1, ty.pg_type()));
        }

        let mut sql = format!(
            "INSERT INTO {qualified} ({}) VALUES ({})",
            names.join(", "),
            placeholders.join(", ")
        );

        if let LandMode::Upsert(keys) = mode {
            let quoted_keys: Result<Vec<_>, _> = keys.iter().map(|k| quote_ident(k)).collect();
            let updates: Vec<String> = row
                .keys()
                .filter(|c| !keys.contains(*c))
                .map(|c| quote_ident(c).map(|q| format!("{q} = EXCLUDED.{q}")))
                .collect::<Result<_, _>>()?;
            if updates.is_empty() {
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO NOTHING",
                    quoted_keys?.join(", ")
                ));
            } else {
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    quoted_keys?.join(", "),
                    updates.join(", ")
                ));
            }
        }

        Ok(sql)
    }

    /// Land rows in chunk-sized transactions. `delete_first` runs a
    /// DELETE inside the first chunk's transaction (the replace path).
    async fn land(
        &self,
        cancel: &CancellationToken,
        table: &TableRef,
        columns: &HashMap<String, ColumnType>,
        rows: &[Map<String, Value>],
        delete_first: bool,
        mode: LandMode<'_>,
    ) -> Result<u64, SyncError> {
        let qualified = table.qualified()?;
        let mut written: u64 = 0;
        let mut first_chunk = true;

        // An empty replace still truncates the target.
        if rows.is_empty() && delete_first {
            let mut tx = self.pool.begin().await?;
            sqlx::query(&format!("DELETE FROM {qualified}"))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(0);
        }

        for chunk in rows.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let mut tx = self.pool.begin().await?;

            if first_chunk && delete_first {
                sqlx::query(&format!("DELETE FROM {qualified}"))
                    .execute(&mut *tx)
                    .await?;
            }
            first_chunk = false;

            for row in chunk {
                if cancel.is_cancelled() {
                    // Dropping the transaction rolls the current chunk back.
                    return Err(SyncError::Cancelled);
                }
                let sql = Self::row_sql(&qualified, row, columns, &mode)?;
                let mut query = sqlx::query(&sql);
                for value in row.values() {
                    query = bind_json_value(query, value);
                }
                query.execute(&mut *tx).await?;
            }

            tx.commit().await?;
            written += chunk.len() as u64;
        }

        Ok(written)
    }
}

#[async_trait]
impl Sink for PostgresSink {
    async fn replace(
        &self,
        cancel: &CancellationToken,
        table: &TableRef,
        columns: &HashMap<String, ColumnType>,
        rows: &[Map<String, Value>],
    ) -> Result<u64, SyncError> {
        self.land(cancel, table, columns, rows, true, LandMode::Insert)
            .await
    }

    async fn append(
        &self,
        cancel: &CancellationToken,
        table: &TableRef,
        columns: &HashMap<String, ColumnType>,
        rows: &[Map<String, Value>],
    ) -> Result<u64, SyncError> {
        self.land(cancel, table, columns, rows, false, LandMode::Insert)
            .await
    }

    async fn upsert(
        &self,
        cancel: &CancellationToken,
        table: &TableRef,
        columns: &HashMap<String, ColumnType>,
        rows: &[Map<String, Value>],
        keys: &[String],
    ) -> Result<u64, SyncError> {
        if keys.is_empty() {
            return Err(SyncError::Config(
                "upsert requires at least one key column".to_owned(),
            ));
        }
        self.land(cancel, table, columns, rows, false, LandMode::Upsert(keys))
            .await
    }

    async fn dead_letter(
        &self,
        table: &TableRef,
        rows: &[Map<String, Value>],
        error: &str,
    ) -> Result<u64, SyncError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let dl = table.dead_letter().qualified()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {dl} ( \
                 payload JSONB NOT NULL, \
                 error TEXT, \
                 recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW())"
        ))
        .execute(&mut *tx)
        .await?;

        for row in rows {
            sqlx::query(&format!("INSERT INTO {dl} (payload, error) VALUES ($1, $2)"))
                .bind(Value::Object(row.clone()))
                .bind(error)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(rows.len() as u64)
    }
}
