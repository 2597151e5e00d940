//! The HTTP-POST receiver datasource instance: a resident axum server
//! that accepts pushed records and buffers them for draining.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use convey_db::models::{DataSource, DataSourceKind};

use crate::error::SyncError;

use super::{DataRequest, DataResponse, DatasourceInstance, OP_DRAIN};

const DEFAULT_BUFFER_SIZE: usize = 10_000;
const DEFAULT_MAX_BODY: usize = 1024 * 1024;

/// Where the receiver looks for its auth token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenLocation {
    Header,
    Query,
    Body,
}

#[derive(Debug, Clone)]
struct TokenConfig {
    value: String,
    location: TokenLocation,
    name: String,
}

#[derive(Debug)]
struct Shared {
    buffer: Mutex<VecDeque<Value>>,
    buffer_size: usize,
    path_prefix: String,
    token: Option<TokenConfig>,
    required_fields: Vec<String>,
}

/// Resident HTTP-POST receiver.
///
/// `start` binds the configured port and serves `POST {path_prefix}/*`;
/// `execute` drains records buffered since the previous call.
#[derive(Debug)]
pub struct HttpPostInstance {
    bind_host: String,
    port: u16,
    max_body_size: usize,
    shared: Arc<Shared>,
    started: AtomicBool,
    state: Mutex<Option<CancellationToken>>,
}

impl HttpPostInstance {
    pub fn from_datasource(datasource: &DataSource) -> Result<Self, SyncError> {
        let cfg = &datasource.connection_config;
        let str_field = |v: &Value, key: &str| -> Option<String> {
            v.get(key).and_then(|s| s.as_str()).map(str::to_owned)
        };

        let port = cfg
            .get("port")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| SyncError::Config("http-post datasource requires port".to_owned()))?
            as u16;

        let token = match cfg.get("token") {
            None => None,
            Some(t) => {
                let location = match t.get("location").and_then(|v| v.as_str()) {
                    Some("query") => TokenLocation::Query,
                    Some("body") => TokenLocation::Body,
                    _ => TokenLocation::Header,
                };
                Some(TokenConfig {
                    value: str_field(t, "value").ok_or_else(|| {
                        SyncError::Config("http-post token requires value".to_owned())
                    })?,
                    location,
                    name: str_field(t, "name").unwrap_or_else(|| match location {
                        TokenLocation::Header => "X-Auth-Token".to_owned(),
                        _ => "token".to_owned(),
                    }),
                })
            }
        };

        let path_prefix = str_field(cfg, "path_prefix").unwrap_or_else(|| "/ingest".to_owned());
        let path_prefix = if path_prefix.starts_with('/') {
            path_prefix
        } else {
            format!("/{path_prefix}")
        };

        Ok(Self {
            bind_host: str_field(cfg, "bind_host").unwrap_or_else(|| "0.0.0.0".to_owned()),
            port,
            max_body_size: cfg
                .get("max_body_size")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_MAX_BODY),
            shared: Arc::new(Shared {
                buffer: Mutex::new(VecDeque::new()),
                buffer_size: cfg
                    .get("buffer_size")
                    .and_then(|v| v.as_u64())
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_BUFFER_SIZE),
                path_prefix,
                token,
                required_fields: cfg
                    .get("required_fields")
                    .and_then(|v| v.as_array())
                    .map(|list| {
                        list.iter()
                            .filter_map(|f| f.as_str().map(str::to_owned))
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            started: AtomicBool::new(false),
            state: Mutex::new(None),
        })
    }

    /// Number of records currently buffered.
    pub async fn buffered(&self) -> usize {
        self.shared.buffer.lock().await.len()
    }
}

fn reject(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({"success": false, "error": message})),
    )
        .into_response()
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_owned())
    })
}

/// Decode the pushed body into records. JSON objects and arrays map
/// directly; anything else (plain text, XML, binary) is wrapped as a
/// single `{"payload": ...}` record.
fn decode_body(body: &Bytes) -> Vec<Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Object(map)) => vec![Value::Object(map)],
        Ok(other) => {
            let mut map = Map::with_capacity(1);
            map.insert("data".to_owned(), other);
            vec![Value::Object(map)]
        }
        Err(_) => {
            let mut map = Map::with_capacity(1);
            map.insert(
                "payload".to_owned(),
                Value::String(String::from_utf8_lossy(body).into_owned()),
            );
            vec![Value::Object(map)]
        }
    }
}

async fn ingest(
    State(shared): State<Arc<Shared>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    if !uri.path().starts_with(shared.path_prefix.as_str()) {
        return reject(StatusCode::NOT_FOUND, "unknown path");
    }

    let records = decode_body(&body);

    // Token check, wherever the token was configured to live.
    if let Some(token) = &shared.token {
        let presented = match token.location {
            TokenLocation::Header => headers
                .get(token.name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
            TokenLocation::Query => query_param(&uri, &token.name),
            TokenLocation::Body => records.first().and_then(|r| {
                r.get(&token.name)
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            }),
        };
        if presented.as_deref() != Some(token.value.as_str()) {
            return reject(StatusCode::UNAUTHORIZED, "invalid token");
        }
    }

    // Required fields apply to JSON object records.
    for record in &records {
        for field in &shared.required_fields {
            if record.get(field).is_none() {
                return reject(
                    StatusCode::BAD_REQUEST,
                    &format!("missing required field {field:?}"),
                );
            }
        }
    }

    let accepted = records.len();
    {
        let mut buffer = shared.buffer.lock().await;
        for record in records {
            if buffer.len() >= shared.buffer_size {
                buffer.pop_front();
                tracing::warn!(capacity = shared.buffer_size, "http-post buffer full, dropping oldest record");
            }
            buffer.push_back(record);
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "accepted": accepted})),
    )
        .into_response()
}

#[async_trait]
impl DatasourceInstance for HttpPostInstance {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::MessagingHttpPost
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let app = Router::new()
            .fallback(post(ingest))
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .with_state(Arc::clone(&self.shared));

        let addr: SocketAddr = format!("{}:{}", self.bind_host, self.port)
            .parse()
            .map_err(|e| SyncError::Config(format!("invalid bind address: {e}")))?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::Transport(format!("failed to bind {addr}: {e}")))?;

        let child = cancel.child_token();
        let shutdown = child.clone();
        let prefix = self.shared.path_prefix.clone();

        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "http-post receiver exited with error");
            } else {
                tracing::debug!("http-post receiver stopped");
            }
        });

        *state = Some(child);
        self.started.store(true, Ordering::SeqCst);
        tracing::info!(addr = %addr, prefix = %prefix, "http-post receiver started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.take() {
            cancel.cancel();
        }
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        request: &DataRequest,
    ) -> Result<DataResponse, SyncError> {
        if request.operation != OP_DRAIN {
            return Err(SyncError::Config(format!(
                "http-post instance cannot handle operation {:?}",
                request.operation
            )));
        }
        if !self.is_started() {
            return Err(SyncError::Config(
                "http-post instance not started; drain requires a running receiver".to_owned(),
            ));
        }

        let batch_size = request
            .params
            .get("batch_size")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(1000);

        let mut buffer = self.shared.buffer.lock().await;
        let count = batch_size.min(buffer.len());
        let records: Vec<Value> = buffer.drain(..count).collect();

        Ok(DataResponse::ok(Value::Array(records)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn datasource(config: Value) -> DataSource {
        DataSource {
            id: Uuid::new_v4(),
            name: "receiver".into(),
            kind: DataSourceKind::MessagingHttpPost,
            connection_config: config,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn requires_port() {
        assert!(HttpPostInstance::from_datasource(&datasource(json!({}))).is_err());
        assert!(HttpPostInstance::from_datasource(&datasource(json!({"port": 8099}))).is_ok());
    }

    #[test]
    fn path_prefix_normalized() {
        let instance = HttpPostInstance::from_datasource(&datasource(json!({
            "port": 8099,
            "path_prefix": "hooks",
        })))
        .unwrap();
        assert_eq!(instance.shared.path_prefix, "/hooks");
    }

    #[test]
    fn body_decoding_shapes() {
        let objects = decode_body(&Bytes::from_static(br#"[{"a":1},{"a":2}]"#));
        assert_eq!(objects.len(), 2);

        let single = decode_body(&Bytes::from_static(br#"{"a":1}"#));
        assert_eq!(single, vec![json!({"a": 1})]);

        let scalar = decode_body(&Bytes::from_static(b"17"));
        assert_eq!(scalar, vec![json!({"data": 17})]);

        let raw = decode_body(&Bytes::from_static(b"<xml/>"));
        assert_eq!(raw, vec![json!({"payload": "<xml/>"})]);
    }

    #[test]
    fn query_param_extraction() {
        let uri: Uri = "/ingest/events?token=abc&x=1".parse().unwrap();
        assert_eq!(query_param(&uri, "token").as_deref(), Some("abc"));
        assert_eq!(query_param(&uri, "x").as_deref(), Some("1"));
        assert!(query_param(&uri, "missing").is_none());
    }

    #[tokio::test]
    async fn receiver_roundtrip_and_drain() {
        let instance = HttpPostInstance::from_datasource(&datasource(json!({
            "port": 0,
            "path_prefix": "/ingest",
            "token": {"value": "s3cret", "location": "header", "name": "X-Auth-Token"},
            "required_fields": ["device"],
        })))
        .unwrap();

        // Exercise the handler directly against the shared state.
        let shared = Arc::clone(&instance.shared);

        let mut headers = HeaderMap::new();
        headers.insert("X-Auth-Token", "s3cret".parse().unwrap());
        let uri: Uri = "/ingest/devices".parse().unwrap();

        let ok = ingest(
            State(Arc::clone(&shared)),
            uri.clone(),
            headers.clone(),
            Bytes::from_static(br#"{"device": "d1", "temp": 21}"#),
        )
        .await;
        assert_eq!(ok.status(), StatusCode::OK);

        // Wrong token.
        let mut bad = HeaderMap::new();
        bad.insert("X-Auth-Token", "nope".parse().unwrap());
        let unauthorized = ingest(
            State(Arc::clone(&shared)),
            uri.clone(),
            bad,
            Bytes::from_static(br#"{"device": "d1"}"#),
        )
        .await;
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        // Missing required field.
        let missing = ingest(
            State(Arc::clone(&shared)),
            uri.clone(),
            headers.clone(),
            Bytes::from_static(br#"{"temp": 21}"#),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        // Unknown path.
        let not_found = ingest(
            State(Arc::clone(&shared)),
            "/other".parse().unwrap(),
            headers,
            Bytes::from_static(br#"{"device": "d1"}"#),
        )
        .await;
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        // Only the accepted record is buffered; drain needs a started
        // instance, so mark it started through the lifecycle.
        let cancel = CancellationToken::new();
        instance.start(&cancel).await.expect("bind port 0");
        let response = instance
            .execute(&cancel, &DataRequest::drain(10))
            .await
            .unwrap();
        let drained = response.data.as_array().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0]["device"], json!("d1"));

        instance.stop().await.unwrap();
        assert!(!instance.is_started());
    }
}
