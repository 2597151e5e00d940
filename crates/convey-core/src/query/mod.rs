//! Per-datasource-kind request assembly.
//!
//! A query builder turns an interface's parse config plus the task's
//! runtime parameters into concrete [`DataRequest`]s, including pagination
//! and the incremental cursor predicate.

pub mod database;
pub mod http;

use serde_json::{Map, Value};

use convey_db::models::{DataInterface, DataSourceKind};

use crate::datasource::DataRequest;
use crate::error::SyncError;

pub use database::DatabaseQueryBuilder;
pub use http::HttpQueryBuilder;

/// Which sync contract a request is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

/// Runtime parameters a strategy feeds into request assembly.
#[derive(Debug, Clone, Default)]
pub struct SyncParams {
    /// Rows per page / per drain.
    pub batch_size: usize,
    /// Incremental cursor (RFC3339 UTC) from the task config.
    pub last_sync_time: Option<String>,
}

/// One page of a paged extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParams {
    pub page: u64,
    pub page_size: u64,
}

/// Request assembly for one (datasource kind, interface) pair.
pub trait QueryBuilder: Send + Sync {
    /// Build the base request for a sync run.
    fn build_sync_request(&self, mode: SyncMode, params: &SyncParams)
    -> Result<DataRequest, SyncError>;

    /// Build the request for one page of a paged run.
    fn build_page_request(
        &self,
        mode: SyncMode,
        params: &SyncParams,
        page: &PageParams,
    ) -> Result<DataRequest, SyncError>;

    /// Whether the interface's meta-config enables pagination.
    fn pagination_enabled(&self) -> bool;

    /// Parameters for the page after `current_page`, as the map shape the
    /// upstream expects.
    fn next_page_params(&self, current_page: u64, page_size: u64) -> Map<String, Value>;
}

/// Select the builder for a datasource kind.
///
/// Messaging kinds need no assembly beyond a drain request, handled
/// inline by the realtime strategy.
pub fn builder_for(
    kind: DataSourceKind,
    interface: &DataInterface,
) -> Result<Box<dyn QueryBuilder>, SyncError> {
    match kind {
        DataSourceKind::DatabasePostgres => {
            Ok(Box::new(DatabaseQueryBuilder::from_interface(interface)?))
        }
        DataSourceKind::ApiHttp | DataSourceKind::ApiHttpAuth => {
            Ok(Box::new(HttpQueryBuilder::from_interface(interface)?))
        }
        DataSourceKind::MessagingMqtt | DataSourceKind::MessagingHttpPost => Err(SyncError::Config(
            format!("messaging kind {kind} has no query builder; use drain requests"),
        )),
    }
}
