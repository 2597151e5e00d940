//! Field renaming and type coercion for extracted rows.
//!
//! The mapper turns an upstream record into a target row: source keys are
//! renamed per the interface's `fieldMapping`, then each value is coerced
//! to the declared type of its target column. Column types are cached per
//! interface id and invalidated when the interface record changes.

pub mod coerce;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use convey_db::models::DataInterface;

pub use coerce::{ColumnType, coerce_value};

/// A normalized field mapping: ordered (source, target) pairs.
///
/// Two accepted input shapes under `parse_config.fieldMapping`:
/// - a list of `{source, target}` objects, or
/// - a legacy map of `target -> source`.
///
/// Missing or empty mapping means rows pass through unrenamed.
#[derive(Debug, Clone, Default)]
pub struct FieldMapping {
    pairs: Vec<(String, String)>,
}

impl FieldMapping {
    /// Build a mapping from explicit (source, target) pairs.
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    /// Normalize the `fieldMapping` entry of a parse config.
    pub fn from_parse_config(parse_config: &Value) -> Self {
        let Some(mapping) = parse_config.get("fieldMapping") else {
            return Self::default();
        };

        match mapping {
            Value::Array(entries) => {
                let pairs = entries
                    .iter()
                    .filter_map(|e| {
                        let source = e.get("source")?.as_str()?;
                        let target = e.get("target")?.as_str()?;
                        Some((source.to_owned(), target.to_owned()))
                    })
                    .collect();
                Self { pairs }
            }
            // Legacy shape: { target: source }.
            Value::Object(map) => {
                let pairs = map
                    .iter()
                    .filter_map(|(target, source)| {
                        Some((source.as_str()?.to_owned(), target.clone()))
                    })
                    .collect();
                Self { pairs }
            }
            _ => Self::default(),
        }
    }

    /// Whether any renames are configured.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The (source, target) pairs in order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// The inverse mapping (target back to source). Meaningful when the
    /// mapping is a bijection on the keys it names.
    pub fn inverse(&self) -> Self {
        Self {
            pairs: self
                .pairs
                .iter()
                .map(|(s, t)| (t.clone(), s.clone()))
                .collect(),
        }
    }

    /// Rename the keys of a row. Mapped source keys become their targets;
    /// unmapped keys pass through unchanged.
    pub fn apply(&self, row: &Map<String, Value>) -> Map<String, Value> {
        if self.pairs.is_empty() {
            return row.clone();
        }

        let rename: HashMap<&str, &str> = self
            .pairs
            .iter()
            .map(|(s, t)| (s.as_str(), t.as_str()))
            .collect();

        let mut out = Map::with_capacity(row.len());
        for (key, value) in row {
            let target = rename.get(key.as_str()).copied().unwrap_or(key.as_str());
            out.insert(target.to_owned(), value.clone());
        }
        out
    }
}

/// Parse the column type map out of a `table_fields_config` value.
///
/// Accepts a list of objects naming the column under `field_name` (or
/// `name`) and its type under `data_type` (or `type`). Unknown type
/// strings are skipped; the mapper falls back to name inference.
pub fn parse_column_types(table_fields_config: &Value) -> HashMap<String, ColumnType> {
    let mut types = HashMap::new();
    let Some(fields) = table_fields_config.as_array() else {
        return types;
    };

    for field in fields {
        let name = field
            .get("field_name")
            .or_else(|| field.get("name"))
            .and_then(|v| v.as_str());
        let declared = field
            .get("data_type")
            .or_else(|| field.get("type"))
            .and_then(|v| v.as_str());

        if let (Some(name), Some(declared)) = (name, declared) {
            if let Ok(ty) = declared.parse::<ColumnType>() {
                types.insert(name.to_owned(), ty);
            }
        }
    }
    types
}

/// Read the interface's natural key columns from `table_fields_config`
/// (entries flagged `primary_key: true`), used by the upsert path.
pub fn parse_primary_keys(table_fields_config: &Value) -> Vec<String> {
    table_fields_config
        .as_array()
        .map(|fields| {
            fields
                .iter()
                .filter(|f| {
                    f.get("primary_key")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                })
                .filter_map(|f| {
                    f.get("field_name")
                        .or_else(|| f.get("name"))
                        .and_then(|v| v.as_str())
                        .map(str::to_owned)
                })
                .collect()
        })
        .unwrap_or_default()
}

struct CachedColumns {
    fingerprint: DateTime<Utc>,
    types: Arc<HashMap<String, ColumnType>>,
}

/// Maps upstream records to coerced target rows for one or more
/// interfaces, caching each interface's column-type map.
#[derive(Default)]
pub struct FieldMapper {
    columns: RwLock<HashMap<Uuid, CachedColumns>>,
}

impl FieldMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Column types for an interface, from cache when the interface has
    /// not changed since the entry was built.
    pub async fn column_types(&self, interface: &DataInterface) -> Arc<HashMap<String, ColumnType>> {
        {
            let cache = self.columns.read().await;
            if let Some(entry) = cache.get(&interface.id) {
                if entry.fingerprint == interface.updated_at {
                    return Arc::clone(&entry.types);
                }
            }
        }

        let types = Arc::new(parse_column_types(&interface.table_fields_config));
        let mut cache = self.columns.write().await;
        cache.insert(
            interface.id,
            CachedColumns {
                fingerprint: interface.updated_at,
                types: Arc::clone(&types),
            },
        );
        types
    }

    /// Map one upstream record: rename per the interface's field mapping,
    /// then coerce each value to its target column type (declared, or
    /// inferred from the column name when undeclared).
    pub async fn map_row(
        &self,
        interface: &DataInterface,
        mapping: &FieldMapping,
        row: &Map<String, Value>,
    ) -> Map<String, Value> {
        let types = self.column_types(interface).await;
        let renamed = mapping.apply(row);

        let mut out = Map::with_capacity(renamed.len());
        for (column, value) in renamed {
            let ty = types
                .get(&column)
                .copied()
                .unwrap_or_else(|| ColumnType::infer_from_name(&column));
            out.insert(column, coerce_value(&value, ty));
        }
        out
    }

    /// Map a batch of records. Logs the first mapped row per call at
    /// debug level for diagnostics; diagnostics never reach the result.
    pub async fn map_rows(
        &self,
        interface: &DataInterface,
        mapping: &FieldMapping,
        rows: &[Map<String, Value>],
    ) -> Vec<Map<String, Value>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.map_row(interface, mapping, row).await);
        }
        if let Some(first) = out.first() {
            let row_value = Value::Object(first.clone());
            tracing::debug!(
                interface_id = %interface.id,
                row = %row_value,
                "first mapped row"
            );
        }
        out
    }
}

/// Normalize an upstream response payload into a list of records.
///
/// Accepted shapes: a list of maps, a list of scalars (each wrapped as
/// `{"data": v}`), or a single map (wrapped as a one-item list). Anything
/// else yields an empty list.
pub fn normalize_rows(data: &Value) -> Vec<Map<String, Value>> {
    match data {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(map) => map.clone(),
                scalar => {
                    let mut map = Map::with_capacity(1);
                    map.insert("data".to_owned(), scalar.clone());
                    map
                }
            })
            .collect(),
        Value::Object(map) => vec![map.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().expect("object literal").clone()
    }

    fn test_interface(parse_config: Value, fields_config: Value) -> DataInterface {
        DataInterface {
            id: Uuid::new_v4(),
            name: "test".into(),
            datasource_id: Uuid::new_v4(),
            schema_name: "public".into(),
            table_name: "t".into(),
            parse_config,
            table_fields_config: fields_config,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn mapping_from_pair_list() {
        let cfg = json!({"fieldMapping": [
            {"source": "userId", "target": "user_id"},
            {"source": "ts", "target": "updated_at"},
        ]});
        let mapping = FieldMapping::from_parse_config(&cfg);
        let row = obj(json!({"userId": 7, "ts": "2024-01-01", "extra": true}));
        let out = mapping.apply(&row);
        assert_eq!(out.get("user_id"), Some(&json!(7)));
        assert_eq!(out.get("updated_at"), Some(&json!("2024-01-01")));
        // Unmapped keys pass through.
        assert_eq!(out.get("extra"), Some(&json!(true)));
        assert!(out.get("userId").is_none());
    }

    #[test]
    fn mapping_from_legacy_map() {
        let cfg = json!({"fieldMapping": {"user_id": "userId", "updated_at": "ts"}});
        let mapping = FieldMapping::from_parse_config(&cfg);
        let row = obj(json!({"userId": 7, "ts": "x"}));
        let out = mapping.apply(&row);
        assert_eq!(out.get("user_id"), Some(&json!(7)));
        assert_eq!(out.get("updated_at"), Some(&json!("x")));
    }

    #[test]
    fn missing_mapping_passes_row_through() {
        let mapping = FieldMapping::from_parse_config(&json!({}));
        assert!(mapping.is_empty());
        let row = obj(json!({"a": 1, "b": 2}));
        assert_eq!(mapping.apply(&row), row);
    }

    #[test]
    fn mapping_roundtrips_through_inverse() {
        let mapping = FieldMapping::new(vec![
            ("userId".into(), "user_id".into()),
            ("ts".into(), "updated_at".into()),
        ]);
        let row = obj(json!({"userId": 7, "ts": "x", "other": null}));
        let there = mapping.apply(&row);
        let back = mapping.inverse().apply(&there);
        assert_eq!(back, row);
    }

    #[test]
    fn column_types_parse_both_key_styles() {
        let cfg = json!([
            {"field_name": "n", "data_type": "integer"},
            {"name": "flag", "type": "boolean"},
            {"field_name": "weird", "data_type": "geometry"},
        ]);
        let types = parse_column_types(&cfg);
        assert_eq!(types.get("n"), Some(&ColumnType::Integer));
        assert_eq!(types.get("flag"), Some(&ColumnType::Boolean));
        assert!(!types.contains_key("weird"), "unknown type strings are skipped");
    }

    #[test]
    fn primary_keys_extracted() {
        let cfg = json!([
            {"field_name": "id", "data_type": "varchar", "primary_key": true},
            {"field_name": "v", "data_type": "integer"},
        ]);
        assert_eq!(parse_primary_keys(&cfg), vec!["id".to_owned()]);
    }

    #[tokio::test]
    async fn map_row_renames_and_coerces() {
        let iface = test_interface(
            json!({"fieldMapping": [{"source": "ts", "target": "ts"}]}),
            json!([
                {"field_name": "ts", "data_type": "timestamp"},
                {"field_name": "flag", "data_type": "boolean"},
                {"field_name": "n", "data_type": "integer"},
            ]),
        );
        let mapper = FieldMapper::new();
        let mapping = FieldMapping::from_parse_config(&iface.parse_config);

        let row = obj(json!({"ts": "2024-05-01T12:34:56Z", "flag": "yes", "n": "42"}));
        let out = mapper.map_row(&iface, &mapping, &row).await;

        assert_eq!(out.get("ts"), Some(&json!("2024-05-01 12:34:56.000")));
        assert_eq!(out.get("flag"), Some(&json!(true)));
        assert_eq!(out.get("n"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn unknown_column_uses_name_inference() {
        let iface = test_interface(json!({}), json!([]));
        let mapper = FieldMapper::new();
        let mapping = FieldMapping::default();

        let row = obj(json!({"created_at": "2024-05-01", "note": 5}));
        let out = mapper.map_row(&iface, &mapping, &row).await;

        assert_eq!(out.get("created_at"), Some(&json!("2024-05-01 00:00:00.000")));
        // Non-time-ish names land as text.
        assert_eq!(out.get("note"), Some(&json!("5")));
    }

    #[tokio::test]
    async fn column_cache_invalidated_on_interface_change() {
        let mut iface = test_interface(
            json!({}),
            json!([{"field_name": "n", "data_type": "integer"}]),
        );
        let mapper = FieldMapper::new();

        let types = mapper.column_types(&iface).await;
        assert_eq!(types.get("n"), Some(&ColumnType::Integer));

        // Same fingerprint: cache hit returns the same map.
        let again = mapper.column_types(&iface).await;
        assert!(Arc::ptr_eq(&types, &again));

        // Changed interface: cache entry rebuilt.
        iface.table_fields_config = json!([{"field_name": "n", "data_type": "varchar"}]);
        iface.updated_at = Utc::now();
        let rebuilt = mapper.column_types(&iface).await;
        assert_eq!(rebuilt.get("n"), Some(&ColumnType::Varchar));
    }

    #[test]
    fn normalize_rows_shapes() {
        let maps = normalize_rows(&json!([{"a": 1}, {"a": 2}]));
        assert_eq!(maps.len(), 2);

        let scalars = normalize_rows(&json!([1, "two"]));
        assert_eq!(scalars[0].get("data"), Some(&json!(1)));
        assert_eq!(scalars[1].get("data"), Some(&json!("two")));

        let single = normalize_rows(&json!({"a": 1}));
        assert_eq!(single.len(), 1);

        assert!(normalize_rows(&json!(null)).is_empty());
        assert!(normalize_rows(&json!("str")).is_empty());
    }
}
