//! Catalog management commands: datasources, interfaces, tasks.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use convey_db::models::{DataSourceKind, LibraryType, SyncType};
use convey_db::queries::{datasources, interfaces, task_interfaces, tasks};

/// Parse an inline JSON argument or `@file` reference.
fn json_arg(raw: &str) -> Result<serde_json::Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?
        }
        None => raw.to_owned(),
    };
    serde_json::from_str(&text).with_context(|| format!("invalid JSON: {raw}"))
}

pub async fn datasource_add(pool: &PgPool, name: &str, kind: &str, config: &str) -> Result<()> {
    let kind: DataSourceKind = kind.parse()?;
    let config = json_arg(config)?;
    let ds = datasources::insert_datasource(pool, name, kind, &config).await?;
    println!("Datasource {} created: {}", ds.name, ds.id);
    Ok(())
}

pub async fn datasource_list(pool: &PgPool) -> Result<()> {
    let list = datasources::list_datasources(pool).await?;
    if list.is_empty() {
        println!("No datasources.");
        return Ok(());
    }
    println!("{:<38} {:<22} NAME", "ID", "KIND");
    for ds in list {
        println!("{:<38} {:<22} {}", ds.id, ds.kind.to_string(), ds.name);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn interface_add(
    pool: &PgPool,
    name: &str,
    datasource_id: &str,
    schema: &str,
    table: &str,
    parse_config: &str,
    fields_config: &str,
) -> Result<()> {
    let datasource_id = Uuid::parse_str(datasource_id)
        .with_context(|| format!("invalid datasource ID: {datasource_id}"))?;
    let iface = interfaces::insert_interface(
        pool,
        name,
        datasource_id,
        schema,
        table,
        &json_arg(parse_config)?,
        &json_arg(fields_config)?,
    )
    .await?;
    println!(
        "Interface {} created: {} -> {}.{}",
        iface.name, iface.id, iface.schema_name, iface.table_name
    );
    Ok(())
}

pub async fn interface_list(pool: &PgPool, datasource_id: &str) -> Result<()> {
    let datasource_id = Uuid::parse_str(datasource_id)
        .with_context(|| format!("invalid datasource ID: {datasource_id}"))?;
    let list = interfaces::list_interfaces_for_datasource(pool, datasource_id).await?;
    if list.is_empty() {
        println!("No interfaces for datasource {datasource_id}.");
        return Ok(());
    }
    println!("{:<38} {:<30} TARGET", "ID", "NAME");
    for iface in list {
        println!(
            "{:<38} {:<30} {}.{}",
            iface.id, iface.name, iface.schema_name, iface.table_name
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn task_create(
    pool: &PgPool,
    library_type: &str,
    library_id: &str,
    datasource_id: &str,
    sync_type: &str,
    config: &str,
    interface_ids: &str,
) -> Result<()> {
    let library_type: LibraryType = library_type.parse()?;
    let sync_type: SyncType = sync_type.parse()?;
    let library_id =
        Uuid::parse_str(library_id).with_context(|| format!("invalid library ID: {library_id}"))?;
    let datasource_id = Uuid::parse_str(datasource_id)
        .with_context(|| format!("invalid datasource ID: {datasource_id}"))?;

    let task = tasks::insert_task(
        pool,
        library_type,
        library_id,
        datasource_id,
        sync_type,
        &json_arg(config)?,
        Some("cli"),
        None,
    )
    .await?;

    for raw in interface_ids.split(',').filter(|s| !s.is_empty()) {
        let interface_id =
            Uuid::parse_str(raw.trim()).with_context(|| format!("invalid interface ID: {raw}"))?;
        task_interfaces::link_task_interface(pool, task.id, interface_id).await?;
    }

    println!("Task created: {} ({} {})", task.id, task.sync_type, task.status);
    Ok(())
}
