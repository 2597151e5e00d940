//! Query functions for the `data_interfaces` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::DataInterface;

/// Insert a new data interface. Returns the inserted row.
pub async fn insert_interface(
    pool: &PgPool,
    name: &str,
    datasource_id: Uuid,
    schema_name: &str,
    table_name: &str,
    parse_config: &serde_json::Value,
    table_fields_config: &serde_json::Value,
) -> Result<DataInterface> {
    let iface = sqlx::query_as::<_, DataInterface>(
        "INSERT INTO data_interfaces \
         (name, datasource_id, schema_name, table_name, parse_config, table_fields_config) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(name)
    .bind(datasource_id)
    .bind(schema_name)
    .bind(table_name)
    .bind(parse_config)
    .bind(table_fields_config)
    .fetch_one(pool)
    .await
    .context("failed to insert data interface")?;

    Ok(iface)
}

/// Fetch a single interface by ID.
pub async fn get_interface(pool: &PgPool, id: Uuid) -> Result<Option<DataInterface>> {
    let iface = sqlx::query_as::<_, DataInterface>("SELECT * FROM data_interfaces WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch data interface")?;

    Ok(iface)
}

/// List all interfaces bound to a datasource, ordered by creation time.
pub async fn list_interfaces_for_datasource(
    pool: &PgPool,
    datasource_id: Uuid,
) -> Result<Vec<DataInterface>> {
    let rows = sqlx::query_as::<_, DataInterface>(
        "SELECT * FROM data_interfaces WHERE datasource_id = $1 ORDER BY created_at ASC",
    )
    .bind(datasource_id)
    .fetch_all(pool)
    .await
    .context("failed to list interfaces for datasource")?;

    Ok(rows)
}

/// Replace an interface's parse config and table fields config.
///
/// Bumps `updated_at` so the field mapper's column-type cache is
/// invalidated on next use.
pub async fn update_interface_configs(
    pool: &PgPool,
    id: Uuid,
    parse_config: &serde_json::Value,
    table_fields_config: &serde_json::Value,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE data_interfaces \
         SET parse_config = $1, table_fields_config = $2, updated_at = NOW() \
         WHERE id = $3",
    )
    .bind(parse_config)
    .bind(table_fields_config)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update interface configs")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("data interface {id} not found");
    }

    Ok(())
}

/// Delete an interface.
pub async fn delete_interface(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM data_interfaces WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete data interface")?;

    Ok(result.rows_affected())
}
