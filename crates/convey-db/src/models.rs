use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind tag of a datasource. Determines which instance factory builds the
/// live connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DataSourceKind {
    DatabasePostgres,
    ApiHttp,
    ApiHttpAuth,
    MessagingMqtt,
    MessagingHttpPost,
}

impl DataSourceKind {
    /// Kinds whose instances own a background lifecycle (subscriber or
    /// listener) and stay cached across runs.
    pub fn is_resident(self) -> bool {
        matches!(self, Self::MessagingMqtt | Self::MessagingHttpPost)
    }
}

impl fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DatabasePostgres => "database-postgres",
            Self::ApiHttp => "api-http",
            Self::ApiHttpAuth => "api-http-auth",
            Self::MessagingMqtt => "messaging-mqtt",
            Self::MessagingHttpPost => "messaging-http-post",
        };
        f.write_str(s)
    }
}

impl FromStr for DataSourceKind {
    type Err = KindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database-postgres" => Ok(Self::DatabasePostgres),
            "api-http" => Ok(Self::ApiHttp),
            "api-http-auth" => Ok(Self::ApiHttpAuth),
            "messaging-mqtt" => Ok(Self::MessagingMqtt),
            "messaging-http-post" => Ok(Self::MessagingHttpPost),
            other => Err(KindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DataSourceKind`] string.
#[derive(Debug, Clone)]
pub struct KindParseError(pub String);

impl fmt::Display for KindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid datasource kind: {:?}", self.0)
    }
}

impl std::error::Error for KindParseError {}

// ---------------------------------------------------------------------------

/// Synchronization contract of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Full,
    Incremental,
    Realtime,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Realtime => "realtime",
        };
        f.write_str(s)
    }
}

impl FromStr for SyncType {
    type Err = SyncTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "realtime" => Ok(Self::Realtime),
            other => Err(SyncTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SyncType`] string.
#[derive(Debug, Clone)]
pub struct SyncTypeParseError(pub String);

impl fmt::Display for SyncTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid sync type: {:?}", self.0)
    }
}

impl std::error::Error for SyncTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    /// Terminal statuses: the run is over, only a manual re-run creates a
    /// new execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of one execution (run) of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

// ---------------------------------------------------------------------------

/// How an execution was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Manual,
    Scheduled,
    Retry,
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Retry => "retry",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionType {
    type Err = ExecutionTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "retry" => Ok(Self::Retry),
            other => Err(ExecutionTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionType`] string.
#[derive(Debug, Clone)]
pub struct ExecutionTypeParseError(pub String);

impl fmt::Display for ExecutionTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution type: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionTypeParseError {}

// ---------------------------------------------------------------------------

/// Which library a task syncs into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LibraryType {
    Basic,
    Thematic,
}

impl fmt::Display for LibraryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Basic => "basic",
            Self::Thematic => "thematic",
        };
        f.write_str(s)
    }
}

impl FromStr for LibraryType {
    type Err = LibraryTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Self::Basic),
            "thematic" => Ok(Self::Thematic),
            other => Err(LibraryTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LibraryType`] string.
#[derive(Debug, Clone)]
pub struct LibraryTypeParseError(pub String);

impl fmt::Display for LibraryTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid library type: {:?}", self.0)
    }
}

impl std::error::Error for LibraryTypeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A configured upstream endpoint. Immutable for the lifetime of a cached
/// instance; `updated_at` is the cache fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DataSource {
    pub id: Uuid,
    pub name: String,
    pub kind: DataSourceKind,
    /// Endpoint, credentials, authentication variant. Shape depends on
    /// `kind`; parsed by the matching instance factory.
    pub connection_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A (datasource, target-table) binding plus mapping/parsing rules.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DataInterface {
    pub id: Uuid,
    pub name: String,
    pub datasource_id: Uuid,
    pub schema_name: String,
    pub table_name: String,
    /// Holds `fieldMapping` and per-kind request config.
    pub parse_config: serde_json::Value,
    /// Enumerates target columns with declared data types.
    pub table_fields_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A sync task -- the unit the engine schedules.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncTask {
    pub id: Uuid,
    pub library_type: LibraryType,
    pub library_id: Uuid,
    pub datasource_id: Uuid,
    pub sync_type: SyncType,
    pub status: TaskStatus,
    /// Opaque task configuration (`last_sync_time`, `batch_size`, ...).
    pub config: serde_json::Value,
    pub error_message: Option<String>,
    pub created_by: Option<String>,
    pub scheduler_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
}

impl SyncTask {
    /// Read `batch_size` from the task config, defaulting when absent or
    /// not a positive integer.
    pub fn batch_size(&self, default: usize) -> usize {
        self.config
            .get("batch_size")
            .and_then(|v| v.as_u64())
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(default)
    }

    /// Read the incremental cursor from the task config.
    pub fn last_sync_time(&self) -> Option<&str> {
        self.config.get("last_sync_time").and_then(|v| v.as_str())
    }
}

/// One run of a sync task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncTaskExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub execution_type: ExecutionType,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub processed_rows: i64,
    pub success_rows: i64,
    pub error_rows: i64,
    pub duration_ms: Option<i64>,
    pub statistics: serde_json::Value,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The (task, interface) join row surfacing per-interface progress.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncTaskInterface {
    pub task_id: Uuid,
    pub interface_id: Uuid,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub processed_rows: i64,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
