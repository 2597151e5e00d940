//! Datasource instances: the live connection objects built from catalog
//! datasource records.
//!
//! All upstream interaction goes through the object-safe
//! [`DatasourceInstance`] trait: strategies issue a [`DataRequest`] and
//! get back a [`DataResponse`], no matter whether the upstream is a SQL
//! database, an HTTP API, or a buffering resident listener.

pub mod database;
pub mod http;
pub mod http_post;
pub mod mqtt;
pub mod registry;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use convey_db::models::DataSourceKind;

use crate::error::SyncError;

pub use registry::{DatasourceManager, DatasourceRegistry};

/// Request operations understood by instances.
pub const OP_QUERY: &str = "query";
/// Drain buffered records from a resident instance.
pub const OP_DRAIN: &str = "drain";

/// A synchronous request handed to a datasource instance.
#[derive(Debug, Clone, Default)]
pub struct DataRequest {
    /// Operation tag: [`OP_QUERY`] or [`OP_DRAIN`].
    pub operation: String,
    /// SQL text (database kinds) or URL path suffix (HTTP kinds).
    pub query: Option<String>,
    /// Named parameters: SQL binds, HTTP query params under `"query"`,
    /// drain batch size under `"batch_size"`.
    pub params: Map<String, Value>,
    /// Request body for HTTP kinds.
    pub data: Option<Value>,
}

impl DataRequest {
    pub fn query(sql: impl Into<String>) -> Self {
        Self {
            operation: OP_QUERY.to_owned(),
            query: Some(sql.into()),
            ..Default::default()
        }
    }

    pub fn drain(batch_size: usize) -> Self {
        let mut params = Map::new();
        params.insert("batch_size".to_owned(), Value::from(batch_size as u64));
        Self {
            operation: OP_DRAIN.to_owned(),
            params,
            ..Default::default()
        }
    }
}

/// Pagination metadata echoed by upstreams that report it.
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    pub total: Option<u64>,
    pub page: Option<u64>,
    pub page_size: Option<u64>,
}

/// A response from a datasource instance.
#[derive(Debug, Clone)]
pub struct DataResponse {
    pub success: bool,
    /// Extracted payload: list of records, a single record, or scalars.
    pub data: Value,
    pub error: Option<String>,
    pub metadata: ResponseMetadata,
}

impl DataResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            metadata: ResponseMetadata::default(),
        }
    }

    pub fn refused(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            metadata: ResponseMetadata::default(),
        }
    }
}

/// A live connection object for one datasource.
///
/// Transient kinds (database, HTTP) are constructed per manager `get` and
/// carry no background state. Resident kinds (MQTT subscriber, HTTP-POST
/// receiver) own background I/O started once via [`start`] and stopped by
/// the manager at shutdown.
///
/// # Object Safety
///
/// The trait is object-safe so instances can live in the manager's cache
/// as `Arc<dyn DatasourceInstance>`.
///
/// [`start`]: DatasourceInstance::start
#[async_trait]
pub trait DatasourceInstance: Send + Sync + std::fmt::Debug {
    /// The kind tag this instance was built from.
    fn kind(&self) -> DataSourceKind;

    /// Whether this instance owns a background lifecycle.
    fn is_resident(&self) -> bool {
        self.kind().is_resident()
    }

    /// Whether `start` has completed. Always `true` for transient kinds.
    fn is_started(&self) -> bool;

    /// Start background I/O. No-op when already started or transient.
    async fn start(&self, cancel: &CancellationToken) -> Result<(), SyncError>;

    /// Stop background I/O and release sockets/subscriptions.
    async fn stop(&self) -> Result<(), SyncError>;

    /// Execute a request. Fails with `Transport`, `Protocol`, or
    /// `Cancelled` error kinds; an upstream that answered but refused is a
    /// successful `execute` returning `success = false`.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &DataRequest,
    ) -> Result<DataResponse, SyncError>;
}

// Compile-time assertion: the instance trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn DatasourceInstance) {}
};
