//! HTTP request assembly for the API datasource kinds.

use chrono::DateTime;
use serde_json::{Map, Value};

use convey_db::models::DataInterface;

use crate::datasource::DataRequest;
use crate::error::SyncError;

use super::{PageParams, QueryBuilder, SyncMode, SyncParams};

/// Where a parameter is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Query,
    Body,
}

impl ParamLocation {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("body") => Self::Body,
            _ => Self::Query,
        }
    }
}

/// How the incremental cursor is rendered for the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorFieldType {
    Timestamp,
    Number,
    String,
}

#[derive(Debug, Clone)]
struct PaginationConfig {
    enabled: bool,
    page_param: String,
    size_param: String,
    location: ParamLocation,
    start_value: u64,
    default_size: u64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            page_param: "page".to_owned(),
            size_param: "size".to_owned(),
            location: ParamLocation::Query,
            start_value: 1,
            default_size: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct IncrementalConfig {
    param_name: String,
    location: ParamLocation,
    field_type: CursorFieldType,
    field_format: Option<String>,
}

/// Builds HTTP requests from an interface's parse config.
///
/// Recognized parse-config sections: `request` (`url_suffix`,
/// `path_params`, `query_params`, `method`, `body`, `use_form_data`,
/// `headers`), `pagination`, and `incremental`.
#[derive(Debug, Clone)]
pub struct HttpQueryBuilder {
    url_suffix: String,
    path_params: Map<String, Value>,
    query_params: Map<String, Value>,
    method: String,
    body: Option<Value>,
    use_form_data: bool,
    headers: Map<String, Value>,
    pagination: PaginationConfig,
    incremental: Option<IncrementalConfig>,
}

impl HttpQueryBuilder {
    pub fn from_interface(interface: &DataInterface) -> Result<Self, SyncError> {
        let cfg = &interface.parse_config;
        let request = cfg.get("request").cloned().unwrap_or(Value::Null);

        let str_of = |v: &Value, key: &str| -> Option<String> {
            v.get(key).and_then(|s| s.as_str()).map(str::to_owned)
        };
        let map_of = |v: &Value, key: &str| -> Map<String, Value> {
            v.get(key)
                .and_then(|m| m.as_object())
                .cloned()
                .unwrap_or_default()
        };

        let pagination = match cfg.get("pagination") {
            Some(p) => {
                let defaults = PaginationConfig::default();
                PaginationConfig {
                    enabled: p.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false),
                    page_param: str_of(p, "page_param").unwrap_or(defaults.page_param),
                    size_param: str_of(p, "size_param").unwrap_or(defaults.size_param),
                    location: ParamLocation::parse(
                        p.get("param_location").and_then(|v| v.as_str()),
                    ),
                    start_value: p
                        .get("start_value")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(defaults.start_value),
                    default_size: p
                        .get("default_size")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(defaults.default_size),
                }
            }
            None => PaginationConfig::default(),
        };

        let incremental = cfg.get("incremental").map(|inc| {
            let field_type = match inc.get("field_type").and_then(|v| v.as_str()) {
                Some("number") => CursorFieldType::Number,
                Some("string") => CursorFieldType::String,
                _ => CursorFieldType::Timestamp,
            };
            IncrementalConfig {
                param_name: str_of(inc, "param_name").unwrap_or_else(|| "since".to_owned()),
                location: ParamLocation::parse(inc.get("param_location").and_then(|v| v.as_str())),
                field_type,
                field_format: str_of(inc, "field_format"),
            }
        });

        Ok(Self {
            url_suffix: str_of(&request, "url_suffix").unwrap_or_default(),
            path_params: map_of(&request, "path_params"),
            query_params: map_of(&request, "query_params"),
            method: str_of(&request, "method").unwrap_or_else(|| "GET".to_owned()),
            body: request.get("body").cloned().filter(|b| !b.is_null()),
            use_form_data: request
                .get("use_form_data")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            headers: map_of(&request, "headers"),
            pagination,
            incremental,
        })
    }

    /// Substitute `{name}` path parameters into the URL suffix.
    fn render_path(&self) -> String {
        let mut path = self.url_suffix.clone();
        for (name, value) in &self.path_params {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            path = path.replace(&format!("{{{name}}}"), &rendered);
        }
        path
    }

    /// Render the cursor value for the upstream.
    fn render_cursor(inc: &IncrementalConfig, cursor: &str) -> Value {
        match inc.field_type {
            CursorFieldType::String => Value::String(cursor.to_owned()),
            CursorFieldType::Number => {
                // An RFC3339 cursor becomes epoch seconds; a numeric cursor
                // is passed through as a number.
                if let Ok(dt) = DateTime::parse_from_rfc3339(cursor) {
                    Value::from(dt.timestamp())
                } else if let Ok(n) = cursor.parse::<i64>() {
                    Value::from(n)
                } else {
                    Value::String(cursor.to_owned())
                }
            }
            CursorFieldType::Timestamp => match &inc.field_format {
                Some(format) => match DateTime::parse_from_rfc3339(cursor) {
                    Ok(dt) => Value::String(dt.to_utc().format(format).to_string()),
                    Err(_) => Value::String(cursor.to_owned()),
                },
                None => Value::String(cursor.to_owned()),
            },
        }
    }

    fn assemble(
        &self,
        mode: SyncMode,
        params: &SyncParams,
        page: Option<&PageParams>,
    ) -> Result<DataRequest, SyncError> {
        let mut query = self.query_params.clone();
        let mut body = match &self.body {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(SyncError::Config(format!(
                    "http body must be a JSON object, got {other}"
                )));
            }
            None => Map::new(),
        };

        if mode == SyncMode::Incremental {
            let inc = self.incremental.as_ref().ok_or_else(|| {
                SyncError::Config("incremental sync requires an incremental section".to_owned())
            })?;
            let cursor = params.last_sync_time.as_deref().unwrap_or("");
            let rendered = Self::render_cursor(inc, cursor);
            match inc.location {
                ParamLocation::Query => query.insert(inc.param_name.clone(), rendered),
                ParamLocation::Body => body.insert(inc.param_name.clone(), rendered),
            };
        }

        if let Some(page) = page {
            let value = self.pagination.start_value + page.page.saturating_sub(1);
            let pairs = [
                (self.pagination.page_param.clone(), Value::from(value)),
                (self.pagination.size_param.clone(), Value::from(page.page_size)),
            ];
            for (k, v) in pairs {
                match self.pagination.location {
                    ParamLocation::Query => query.insert(k, v),
                    ParamLocation::Body => body.insert(k, v),
                };
            }
        }

        let mut request = DataRequest {
            operation: crate::datasource::OP_QUERY.to_owned(),
            query: Some(self.render_path()),
            params: Map::new(),
            data: if body.is_empty() {
                None
            } else {
                Some(Value::Object(body))
            },
        };
        request
            .params
            .insert("method".to_owned(), Value::String(self.method.clone()));
        request
            .params
            .insert("query".to_owned(), Value::Object(query));
        if !self.headers.is_empty() {
            request
                .params
                .insert("headers".to_owned(), Value::Object(self.headers.clone()));
        }
        if self.use_form_data {
            request
                .params
                .insert("use_form_data".to_owned(), Value::Bool(true));
        }
        Ok(request)
    }

    /// The configured page size to use when the task config supplies none.
    pub fn default_page_size(&self) -> u64 {
        self.pagination.default_size
    }
}

impl QueryBuilder for HttpQueryBuilder {
    fn build_sync_request(
        &self,
        mode: SyncMode,
        params: &SyncParams,
    ) -> Result<DataRequest, SyncError> {
        self.assemble(mode, params, None)
    }

    fn build_page_request(
        &self,
        mode: SyncMode,
        params: &SyncParams,
        page: &PageParams,
    ) -> Result<DataRequest, SyncError> {
        self.assemble(mode, params, Some(page))
    }

    fn pagination_enabled(&self) -> bool {
        self.pagination.enabled
    }

    fn next_page_params(&self, current_page: u64, page_size: u64) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            self.pagination.page_param.clone(),
            Value::from(self.pagination.start_value + current_page),
        );
        map.insert(self.pagination.size_param.clone(), Value::from(page_size));
        map
    }
}
