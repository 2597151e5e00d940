//! The PostgreSQL datasource instance: executes SQL against the source
//! database and returns rows as JSON maps.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, PgPool, Row, TypeInfo};
use tokio_util::sync::CancellationToken;

use convey_db::models::{DataSource, DataSourceKind};

use crate::error::SyncError;
use crate::sink::bind_json_value;

use super::{DataRequest, DataResponse, DatasourceInstance, OP_QUERY};

/// Transient SQL instance: a lazily-connected pool per datasource.
#[derive(Debug)]
pub struct PostgresInstance {
    pool: PgPool,
}

impl PostgresInstance {
    /// Build from a catalog record. The connection config carries
    /// `host`, `port`, `database`, `username`, `password`, and optional
    /// `sslmode` / `connect_timeout_secs`.
    pub fn from_datasource(datasource: &DataSource) -> Result<Self, SyncError> {
        let cfg = &datasource.connection_config;
        let str_field = |key: &str| -> Option<&str> { cfg.get(key).and_then(|v| v.as_str()) };

        let host = str_field("host")
            .ok_or_else(|| SyncError::Config("database datasource requires host".to_owned()))?;
        let database = str_field("database")
            .ok_or_else(|| SyncError::Config("database datasource requires database".to_owned()))?;

        let mut options = PgConnectOptions::new()
            .host(host)
            .port(cfg.get("port").and_then(|v| v.as_u64()).unwrap_or(5432) as u16)
            .database(database);

        if let Some(username) = str_field("username") {
            options = options.username(username);
        }
        if let Some(password) = str_field("password") {
            options = options.password(password);
        }

        let ssl_mode = match str_field("sslmode") {
            Some("disable") => PgSslMode::Disable,
            Some("require") => PgSslMode::Require,
            Some("verify-ca") => PgSslMode::VerifyCa,
            Some("verify-full") => PgSslMode::VerifyFull,
            _ => PgSslMode::Prefer,
        };
        options = options.ssl_mode(ssl_mode);

        let timeout = cfg
            .get("connect_timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(10);

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(timeout))
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Rewrite `:name` placeholders to `$n` binds, pulling values from the
/// request params in occurrence order. `::type` casts and names absent
/// from the params are left untouched.
fn rewrite_named_params(sql: &str, params: &Map<String, Value>) -> (String, Vec<Value>) {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut binds: Vec<Value> = Vec::new();
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if c == '\'' {
            in_string = !in_string;
            out.push(c);
            i += 1;
            continue;
        }

        if !in_string && c == ':' {
            // A `::` cast, not a placeholder.
            if i + 1 < bytes.len() && bytes[i + 1] == b':' {
                out.push_str("::");
                i += 2;
                continue;
            }
            let start = i + 1;
            let mut end = start;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
            {
                end += 1;
            }
            if end > start {
                let name = &sql[start..end];
                if let Some(value) = params.get(name) {
                    binds.push(value.clone());
                    out.push_str(&format!("${}", binds.len()));
                    i = end;
                    continue;
                }
            }
        }

        out.push(c);
        i += 1;
    }

    (out, binds)
}

/// Decode a row column-wise into a JSON map. Columns of types without a
/// JSON representation decode to null with a warning.
fn row_to_json(row: &PgRow) -> Map<String, Value> {
    let mut map = Map::with_capacity(row.columns().len());

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_owned();
        let type_name = column.type_info().name();

        let value = match type_name {
            "INT2" => row
                .try_get::<Option<i16>, _>(i)
                .ok()
                .flatten()
                .map(Value::from),
            "INT4" => row
                .try_get::<Option<i32>, _>(i)
                .ok()
                .flatten()
                .map(Value::from),
            "INT8" => row
                .try_get::<Option<i64>, _>(i)
                .ok()
                .flatten()
                .map(Value::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)
                .ok()
                .flatten()
                .map(|f| Value::from(f as f64)),
            "FLOAT8" | "NUMERIC" => row
                .try_get::<Option<f64>, _>(i)
                .ok()
                .flatten()
                .map(Value::from),
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)
                .ok()
                .flatten()
                .map(Value::from),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                .ok()
                .flatten()
                .map(|dt| Value::String(dt.to_rfc3339())),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(i)
                .ok()
                .flatten()
                .map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(i)
                .ok()
                .flatten()
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
            "TIME" => row
                .try_get::<Option<chrono::NaiveTime>, _>(i)
                .ok()
                .flatten()
                .map(|t| Value::String(t.format("%H:%M:%S").to_string())),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(i)
                .ok()
                .flatten()
                .map(|u| Value::String(u.to_string())),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(i).ok().flatten(),
            _ => match row.try_get::<Option<String>, _>(i) {
                Ok(v) => v.map(Value::String),
                Err(_) => {
                    tracing::warn!(column = %name, pg_type = type_name, "cannot decode column, landing null");
                    None
                }
            },
        };

        map.insert(name, value.unwrap_or(Value::Null));
    }

    map
}

/// Split sqlx failures into retriable transport errors and everything
/// else (bad SQL, constraint violations: protocol).
fn classify(err: sqlx::Error) -> SyncError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => SyncError::Transport(err.to_string()),
        _ => SyncError::Protocol(err.to_string()),
    }
}

#[async_trait]
impl DatasourceInstance for PostgresInstance {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::DatabasePostgres
    }

    fn is_started(&self) -> bool {
        true
    }

    async fn start(&self, _cancel: &CancellationToken) -> Result<(), SyncError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        self.pool.close().await;
        Ok(())
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &DataRequest,
    ) -> Result<DataResponse, SyncError> {
        if request.operation != OP_QUERY {
            return Err(SyncError::Config(format!(
                "database instance cannot handle operation {:?}",
                request.operation
            )));
        }
        let sql = request
            .query
            .as_deref()
            .ok_or_else(|| SyncError::Config("database request carries no query".to_owned()))?;

        let (rewritten, binds) = rewrite_named_params(sql, &request.params);
        let mut query = sqlx::query(&rewritten);
        for value in &binds {
            query = bind_json_value(query, value);
        }

        let rows = tokio::select! {
            result = query.fetch_all(&self.pool) => result.map_err(classify)?,
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        };

        let records: Vec<Value> = rows
            .iter()
            .map(|row| Value::Object(row_to_json(row)))
            .collect();

        Ok(DataResponse::ok(Value::Array(records)))
    }
}
