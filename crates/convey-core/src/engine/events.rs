//! Engine event emission.
//!
//! Events go to a user-supplied notifier, dispatched off the hot path so
//! strategies never block on consumers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle events emitted per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    Start,
    Progress,
    Complete,
    Error,
    Pause,
    Resume,
    Cancel,
}

impl fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Progress => "progress",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// One engine event.
#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    pub task_id: Uuid,
    pub event_type: SyncEventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl SyncEvent {
    pub fn new(task_id: Uuid, event_type: SyncEventType, data: Value) -> Self {
        Self {
            task_id,
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// User-supplied event consumer. May be absent.
pub type EventNotifier = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Fire-and-forget dispatch: the notifier runs on its own task.
pub fn emit(notifier: &Option<EventNotifier>, event: SyncEvent) {
    if let Some(notifier) = notifier {
        let notifier = Arc::clone(notifier);
        tokio::spawn(async move {
            notifier(event);
        });
    }
}
