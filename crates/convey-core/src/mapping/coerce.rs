//! Value coercion to a target column's declared type.
//!
//! Coercion is total: a value that cannot be parsed for its declared type
//! passes through unchanged, and the warehouse decides whether to reject
//! it when the row lands.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;

/// Declared data type of a target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Timestamp,
    Date,
    Time,
    Integer,
    Bigint,
    Decimal,
    Float,
    Boolean,
    Varchar,
    Json,
}

impl ColumnType {
    /// The PostgreSQL type the sink casts bound parameters to.
    pub fn pg_type(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Time => "time",
            Self::Integer => "integer",
            Self::Bigint => "bigint",
            Self::Decimal => "numeric",
            Self::Float => "double precision",
            Self::Boolean => "boolean",
            Self::Varchar => "text",
            Self::Json => "jsonb",
        }
    }

    /// Infer a column type from its name when the interface does not
    /// declare one. Time-ish names map to timestamp; everything else
    /// (including id-suffixed names) lands as text.
    pub fn infer_from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("time")
            || lower.contains("date")
            || lower.ends_with("created_at")
            || lower.ends_with("updated_at")
        {
            Self::Timestamp
        } else {
            Self::Varchar
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Time => "time",
            Self::Integer => "integer",
            Self::Bigint => "bigint",
            Self::Decimal => "decimal",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Varchar => "varchar",
            Self::Json => "json",
        };
        f.write_str(s)
    }
}

impl FromStr for ColumnType {
    type Err = ColumnTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "timestamp" | "timestamptz" | "datetime" => Ok(Self::Timestamp),
            "date" => Ok(Self::Date),
            "time" => Ok(Self::Time),
            "integer" | "int" | "int4" | "smallint" => Ok(Self::Integer),
            "bigint" | "int8" | "long" => Ok(Self::Bigint),
            "decimal" | "numeric" => Ok(Self::Decimal),
            "float" | "double" | "real" | "float8" => Ok(Self::Float),
            "boolean" | "bool" => Ok(Self::Boolean),
            "varchar" | "text" | "string" | "char" => Ok(Self::Varchar),
            "json" | "jsonb" => Ok(Self::Json),
            other => Err(ColumnTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ColumnType`] string.
#[derive(Debug, Clone)]
pub struct ColumnTypeParseError(pub String);

impl fmt::Display for ColumnTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid column type: {:?}", self.0)
    }
}

impl std::error::Error for ColumnTypeParseError {}

/// Normalized timestamp output format.
const TS_OUT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const DATE_OUT: &str = "%Y-%m-%d";
const TIME_OUT: &str = "%H:%M:%S";

/// Parse one of the accepted timestamp shapes into a naive UTC datetime.
///
/// Accepted: RFC3339 (with or without sub-second digits), `T`-separated
/// without zone, space-separated without zone, and a bare date (midnight).
fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.to_utc().naive_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    None
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
        return Some(t);
    }
    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M") {
        return Some(t);
    }
    parse_datetime(s).map(|dt| dt.time())
}

fn coerce_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Some(true),
            "false" | "0" | "no" | "n" | "off" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                n.as_f64().map(|f| f.floor() as i64)
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Some(i)
            } else {
                trimmed.parse::<f64>().ok().map(|f| f.floor() as i64)
            }
        }
        _ => None,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Coerce a value to the declared column type.
///
/// Null always passes through. Unparseable values pass through unchanged.
pub fn coerce_value(value: &Value, ty: ColumnType) -> Value {
    if value.is_null() {
        return Value::Null;
    }

    match ty {
        ColumnType::Timestamp => match value {
            Value::String(s) => match parse_datetime(s) {
                Some(dt) => Value::String(dt.format(TS_OUT).to_string()),
                None => value.clone(),
            },
            _ => value.clone(),
        },
        ColumnType::Date => match value {
            Value::String(s) => match parse_datetime(s) {
                Some(dt) => Value::String(dt.format(DATE_OUT).to_string()),
                None => value.clone(),
            },
            _ => value.clone(),
        },
        ColumnType::Time => match value {
            Value::String(s) => match parse_time(s) {
                Some(t) => Value::String(t.format(TIME_OUT).to_string()),
                None => value.clone(),
            },
            _ => value.clone(),
        },
        ColumnType::Integer | ColumnType::Bigint => match coerce_integer(value) {
            Some(i) => Value::from(i),
            None => value.clone(),
        },
        ColumnType::Float | ColumnType::Decimal => match coerce_float(value) {
            Some(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or_else(|| value.clone()),
            None => value.clone(),
        },
        ColumnType::Boolean => match coerce_boolean(value) {
            Some(b) => Value::Bool(b),
            None => value.clone(),
        },
        ColumnType::Varchar => match value {
            Value::String(_) => value.clone(),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            other => Value::String(other.to_string()),
        },
        ColumnType::Json => match value {
            Value::String(_) | Value::Object(_) | Value::Array(_) => value.clone(),
            other => Value::String(other.to_string()),
        },
    }
}
