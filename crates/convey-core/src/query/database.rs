//! SQL request assembly for the database datasource kind.

use serde_json::{Map, Value};

use convey_db::models::DataInterface;

use crate::datasource::DataRequest;
use crate::error::SyncError;

use super::{PageParams, QueryBuilder, SyncMode, SyncParams};

/// Quote a SQL identifier, rejecting embedded quotes rather than escaping
/// them: catalog identifiers are operator input, not end-user input.
fn quote_ident(ident: &str) -> Result<String, SyncError> {
    if ident.is_empty() || ident.contains('"') {
        return Err(SyncError::Config(format!(
            "invalid SQL identifier: {ident:?}"
        )));
    }
    Ok(format!("\"{ident}\""))
}

/// Builds `SELECT` statements against the source table described by an
/// interface's parse config.
///
/// Recognized parse-config keys (all optional): `custom_sql`,
/// `query_params`, `select_fields`, `where_clause`, `order_by`,
/// `increment_field`, and `pagination.enabled`.
#[derive(Debug, Clone)]
pub struct DatabaseQueryBuilder {
    schema: String,
    table: String,
    custom_sql: Option<String>,
    query_params: Map<String, Value>,
    select_fields: Vec<String>,
    where_clause: Option<String>,
    order_by: Option<String>,
    increment_field: Option<String>,
    pagination: bool,
}

impl DatabaseQueryBuilder {
    pub fn from_interface(interface: &DataInterface) -> Result<Self, SyncError> {
        let cfg = &interface.parse_config;

        let select_fields = cfg
            .get("select_fields")
            .and_then(|v| v.as_array())
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        let query_params = cfg
            .get("query_params")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            schema: interface.schema_name.clone(),
            table: interface.table_name.clone(),
            custom_sql: cfg
                .get("custom_sql")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            query_params,
            select_fields,
            where_clause: cfg
                .get("where_clause")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            order_by: cfg
                .get("order_by")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            increment_field: cfg
                .get("increment_field")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            pagination: cfg
                .get("pagination")
                .and_then(|p| p.get("enabled"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }

    /// Assemble the SELECT, honoring `custom_sql` verbatim when set.
    fn build_sql(&self, mode: SyncMode, page: Option<&PageParams>) -> Result<String, SyncError> {
        if let Some(custom) = &self.custom_sql {
            let mut sql = custom.clone();
            if let Some(page) = page {
                let offset = page.page.saturating_sub(1) * page.page_size;
                sql = format!("{sql} LIMIT {} OFFSET {offset}", page.page_size);
            }
            return Ok(sql);
        }

        let projection = if self.select_fields.is_empty() {
            "*".to_owned()
        } else {
            let quoted: Result<Vec<_>, _> =
                self.select_fields.iter().map(|f| quote_ident(f)).collect();
            quoted?.join(", ")
        };

        let mut sql = format!(
            "SELECT {projection} FROM {}.{}",
            quote_ident(&self.schema)?,
            quote_ident(&self.table)?
        );

        let mut predicates = Vec::new();
        if let Some(clause) = &self.where_clause {
            predicates.push(format!("({clause})"));
        }
        if mode == SyncMode::Incremental {
            let field = self.increment_field.as_deref().ok_or_else(|| {
                SyncError::Config("incremental sync requires increment_field".to_owned())
            })?;
            // The cursor is bound as text; the cast makes the comparison
            // valid against timestamp columns.
            predicates.push(format!(
                "{} > :last_sync_time::timestamptz",
                quote_ident(field)?
            ));
        }
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }

        if let Some(order) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }

        if let Some(page) = page {
            let offset = page.page.saturating_sub(1) * page.page_size;
            sql.push_str(&format!(" LIMIT {} OFFSET {offset}", page.page_size));
        }

        Ok(sql)
    }

    fn bind_params(&self, mode: SyncMode, params: &SyncParams) -> Result<Map<String, Value>, SyncError> {
        let mut binds = self.query_params.clone();
        if mode == SyncMode::Incremental {
            let cursor = params.last_sync_time.clone().unwrap_or_default();
            binds.insert("last_sync_time".to_owned(), Value::String(cursor));
        }
        Ok(binds)
    }
}

impl QueryBuilder for DatabaseQueryBuilder {
    fn build_sync_request(
        &self,
        mode: SyncMode,
        params: &SyncParams,
    ) -> Result<DataRequest, SyncError> {
        let mut request = DataRequest::query(self.build_sql(mode, None)?);
        request.params = self.bind_params(mode, params)?;
        Ok(request)
    }

    fn build_page_request(
        &self,
        mode: SyncMode,
        params: &SyncParams,
        page: &PageParams,
    ) -> Result<DataRequest, SyncError> {
        let mut request = DataRequest::query(self.build_sql(mode, Some(page))?);
        request.params = self.bind_params(mode, params)?;
        Ok(request)
    }

    fn pagination_enabled(&self) -> bool {
        self.pagination
    }

    fn next_page_params(&self, current_page: u64, page_size: u64) -> Map<String, Value> {
        let next = current_page + 1;
        let mut map = Map::new();
        map.insert("page".to_owned(), Value::from(next));
        map.insert("limit".to_owned(), Value::from(page_size));
        map.insert(
            "offset".to_owned(),
            Value::from(next.saturating_sub(1) * page_size),
        );
        map
    }
}
