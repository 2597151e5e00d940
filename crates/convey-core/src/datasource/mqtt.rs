//! The MQTT datasource instance: a resident subscriber that buffers
//! delivered messages for periodic draining.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use convey_db::models::{DataSource, DataSourceKind};

use crate::error::SyncError;

use super::{DataRequest, DataResponse, DatasourceInstance, OP_DRAIN};

const DEFAULT_BUFFER_SIZE: usize = 10_000;

#[derive(Debug)]
struct Started {
    client: AsyncClient,
    cancel: CancellationToken,
}

/// Resident MQTT subscriber.
///
/// `start` connects, subscribes the configured topic filters (`+`/`#`
/// wildcards are the broker's business), and spawns the event loop that
/// buffers incoming publishes. `execute` drains buffered records.
#[derive(Debug)]
pub struct MqttInstance {
    host: String,
    port: u16,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    topics: Vec<String>,
    qos: QoS,
    keep_alive: Duration,
    buffer_size: usize,
    buffer: Arc<Mutex<VecDeque<Value>>>,
    started: AtomicBool,
    state: Mutex<Option<Started>>,
}

/// Decode one MQTT payload into a record.
fn decode_payload(topic: &str, payload: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(other) => {
            let mut map = Map::with_capacity(2);
            map.insert("data".to_owned(), other);
            map.insert("topic".to_owned(), Value::String(topic.to_owned()));
            Value::Object(map)
        }
        Err(_) => {
            let mut map = Map::with_capacity(2);
            map.insert(
                "payload".to_owned(),
                Value::String(String::from_utf8_lossy(payload).into_owned()),
            );
            map.insert("topic".to_owned(), Value::String(topic.to_owned()));
            Value::Object(map)
        }
    }
}

async fn buffer_push(buffer: &Mutex<VecDeque<Value>>, capacity: usize, record: Value) {
    let mut guard = buffer.lock().await;
    if guard.len() >= capacity {
        // Oldest-first drop keeps the drain window moving.
        guard.pop_front();
        tracing::warn!(capacity, "mqtt buffer full, dropping oldest record");
    }
    guard.push_back(record);
}

impl MqttInstance {
    pub fn from_datasource(datasource: &DataSource) -> Result<Self, SyncError> {
        let cfg = &datasource.connection_config;
        let str_field = |key: &str| -> Option<String> {
            cfg.get(key).and_then(|v| v.as_str()).map(str::to_owned)
        };

        let host = str_field("host")
            .ok_or_else(|| SyncError::Config("mqtt datasource requires host".to_owned()))?;

        let topics: Vec<String> = match cfg.get("topics") {
            Some(Value::Array(list)) => list
                .iter()
                .filter_map(|t| t.as_str().map(str::to_owned))
                .collect(),
            Some(Value::String(topic)) => vec![topic.clone()],
            _ => str_field("topic").into_iter().collect(),
        };
        if topics.is_empty() {
            return Err(SyncError::Config(
                "mqtt datasource requires at least one topic".to_owned(),
            ));
        }

        let qos = match cfg.get("qos").and_then(|v| v.as_u64()).unwrap_or(1) {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => {
                return Err(SyncError::Config(format!("invalid mqtt qos {other}")));
            }
        };

        Ok(Self {
            host,
            port: cfg.get("port").and_then(|v| v.as_u64()).unwrap_or(1883) as u16,
            client_id: str_field("client_id")
                .unwrap_or_else(|| format!("convey-{}", datasource.id.simple())),
            username: str_field("username"),
            password: str_field("password"),
            topics,
            qos,
            keep_alive: Duration::from_secs(
                cfg.get("keep_alive_secs").and_then(|v| v.as_u64()).unwrap_or(30),
            ),
            buffer_size: cfg
                .get("buffer_size")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_BUFFER_SIZE),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            started: AtomicBool::new(false),
            state: Mutex::new(None),
        })
    }

    /// Number of records currently buffered.
    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

#[async_trait]
impl DatasourceInstance for MqttInstance {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::MessagingMqtt
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        for topic in &self.topics {
            client
                .subscribe(topic.clone(), self.qos)
                .await
                .map_err(|e| SyncError::Transport(format!("mqtt subscribe failed: {e}")))?;
        }

        let child = cancel.child_token();
        let loop_cancel = child.clone();
        let buffer = Arc::clone(&self.buffer);
        let capacity = self.buffer_size;
        let host = self.host.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let record = decode_payload(&publish.topic, &publish.payload);
                            buffer_push(&buffer, capacity, record).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            // Polling again reconnects; back off briefly so a
                            // dead broker does not spin the loop.
                            tracing::warn!(broker = %host, error = %e, "mqtt connection error, reconnecting");
                            tokio::time::sleep(Duration::from_secs(3)).await;
                        }
                    },
                }
            }
            tracing::debug!(broker = %host, "mqtt event loop stopped");
        });

        *state = Some(Started { client, cancel: child });
        self.started.store(true, Ordering::SeqCst);
        tracing::info!(broker = %self.host, topics = ?self.topics, "mqtt subscriber started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if let Some(started) = state.take() {
            started.cancel.cancel();
            if let Err(e) = started.client.disconnect().await {
                tracing::debug!(error = %e, "mqtt disconnect after cancel");
            }
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
                "mqtt instance cannot handle operation {:?}",
                request.operation
            )));
        }
        if !self.is_started() {
            return Err(SyncError::Config(
                "mqtt instance not started; drain requires a running subscriber".to_owned(),
            ));
        }

        let batch_size = request
            .params
            .get("batch_size")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(1000);

        let mut buffer = self.buffer.lock().await;
        let count = batch_size.min(buffer.len());
        let records: Vec<Value> = buffer.drain(..count).collect();

        Ok(DataResponse::ok(Value::Array(records)))
    }
}
