//! Query functions for the `datasources` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{DataSource, DataSourceKind};

/// Insert a new datasource row. Returns the inserted row with
/// server-generated defaults (id, timestamps).
pub async fn insert_datasource(
    pool: &PgPool,
    name: &str,
    kind: DataSourceKind,
    connection_config: &serde_json::Value,
) -> Result<DataSource> {
    let ds = sqlx::query_as::<_, DataSource>(
        "INSERT INTO datasources (name, kind, connection_config) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(name)
    .bind(kind)
    .bind(connection_config)
    .fetch_one(pool)
    .await
    .context("failed to insert datasource")?;

    Ok(ds)
}

/// Fetch a single datasource by ID.
pub async fn get_datasource(pool: &PgPool, id: Uuid) -> Result<Option<DataSource>> {
    let ds = sqlx::query_as::<_, DataSource>("SELECT * FROM datasources WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch datasource")?;

    Ok(ds)
}

/// List all datasources, ordered by name.
pub async fn list_datasources(pool: &PgPool) -> Result<Vec<DataSource>> {
    let rows = sqlx::query_as::<_, DataSource>("SELECT * FROM datasources ORDER BY name ASC")
        .fetch_all(pool)
        .await
        .context("failed to list datasources")?;

    Ok(rows)
}

/// Replace a datasource's connection config.
///
/// Bumps `updated_at` so cached instances built from the old config are
/// invalidated by the manager on the next `get`.
pub async fn update_connection_config(
    pool: &PgPool,
    id: Uuid,
    connection_config: &serde_json::Value,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE datasources SET connection_config = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(connection_config)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update datasource config")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("datasource {id} not found");
    }

    Ok(())
}

/// Delete a datasource. Cascades to its interfaces.
pub async fn delete_datasource(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM datasources WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete datasource")?;

    Ok(result.rows_affected())
}
