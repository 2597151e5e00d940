//! The engine error taxonomy.
//!
//! Strategies and datasource instances speak [`SyncError`]; the engine
//! folds it into the task/execution error columns and decides the final
//! task status (`Cancelled` ends the task `cancelled`, everything else
//! `failed`). Orchestration edges above the engine use `anyhow`.

use thiserror::Error;

/// Errors surfaced by datasource instances, strategies, and the sink.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed datasource/interface/task configuration, unknown sync
    /// type, missing required field. Not retriable; surfaces at submit or
    /// at the first touch of the bad config.
    #[error("config error: {0}")]
    Config(String),

    /// Network-level failure: connect/timeout/broker disconnect.
    /// Retriable; paged loops count consecutive occurrences.
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream answered but refused us: `success=false` per the
    /// configured success condition, or an unparseable response. Never
    /// retried automatically.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Field mapping / coercion failure that cannot pass through.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Warehouse or catalog transaction failure. The current chunk is
    /// rolled back.
    #[error("sink error: {0}")]
    Sink(String),

    /// The task-scoped cancellation fired.
    #[error("cancelled")]
    Cancelled,

    /// Distributed lock backend unavailable or holder mismatch.
    #[error("lock error: {0}")]
    Lock(String),
}

impl SyncError {
    /// Only transport errors are worth retrying.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short kind tag used in events and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Mapping(_) => "mapping",
            Self::Sink(_) => "sink",
            Self::Cancelled => "cancelled",
            Self::Lock(_) => "lock",
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Sink(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        // Connection-level failures are retriable transport errors; a
        // response we got but could not use is a protocol error.
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transport(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_is_retriable() {
        assert!(SyncError::Transport("timeout".into()).is_retriable());
        assert!(!SyncError::Config("bad".into()).is_retriable());
        assert!(!SyncError::Protocol("refused".into()).is_retriable());
        assert!(!SyncError::Cancelled.is_retriable());
        assert!(!SyncError::Lock("down".into()).is_retriable());
    }

    #[test]
    fn kind_tags() {
        assert_eq!(SyncError::Cancelled.kind(), "cancelled");
        assert_eq!(SyncError::Protocol("x".into()).kind(), "protocol");
        assert_eq!(SyncError::Transport("x".into()).kind(), "transport");
    }
}
