//! Distributed locking for the external scheduler.
//!
//! Before firing a scheduled task, each replica calls `try_lock`; exactly
//! one wins and submits, the others skip the tick. Release and refresh
//! verify the holder atomically (the holder id lives in the lock's
//! value), so a replica can never free or extend a lock it does not
//! hold.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

/// Key namespace for scheduler locks.
const KEY_PREFIX: &str = "sync_task_scheduler:lock:";

/// Delete the key only when the caller still holds it.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Extend the TTL only when the caller still holds the key.
const REFRESH_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Cross-replica lock facility.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire the lock. Returns `false` when another holder exists.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, SyncError>;

    /// Release the lock. No-op when the caller is not the holder.
    async fn unlock(&self, key: &str) -> Result<(), SyncError>;

    /// Extend the TTL. Returns `false` (no-op) when the caller is not
    /// the holder.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<bool, SyncError>;

    /// Whether any holder currently owns the key.
    async fn is_locked(&self, key: &str) -> Result<bool, SyncError>;
}

/// The local instance identity stored as the lock value.
pub fn local_holder_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned());
    format!("{host}:{}", std::process::id())
}

/// Redis-backed lock. Environment reference configuration:
/// `REDIS_HOST` (localhost), `REDIS_PORT` (6379), `REDIS_PASSWORD`,
/// `REDIS_DB` (0).
pub struct RedisLock {
    client: Client,
    holder_id: String,
}

impl RedisLock {
    /// Connect by URL (`redis://host:port/db`).
    pub fn new(url: &str) -> Result<Self, SyncError> {
        Ok(Self {
            client: Client::open(url)
                .map_err(|e| SyncError::Lock(format!("invalid redis url: {e}")))?,
            holder_id: local_holder_id(),
        })
    }

    /// Connect from the `REDIS_*` environment.
    pub fn from_env() -> Result<Self, SyncError> {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_owned());
        let port = std::env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_owned());
        let db = std::env::var("REDIS_DB").unwrap_or_else(|_| "0".to_owned());
        let url = match std::env::var("REDIS_PASSWORD") {
            Ok(password) if !password.is_empty() => {
                format!("redis://:{password}@{host}:{port}/{db}")
            }
            _ => format!("redis://{host}:{port}/{db}"),
        };
        Self::new(&url)
    }

    /// Override the holder identity (tests simulating multiple replicas).
    pub fn with_holder(url: &str, holder_id: impl Into<String>) -> Result<Self, SyncError> {
        let mut lock = Self::new(url)?;
        lock.holder_id = holder_id.into();
        Ok(lock)
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    async fn connection(&self) -> Result<MultiplexedConnection, SyncError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SyncError::Lock(format!("redis unavailable: {e}")))
    }

    fn namespaced(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, SyncError> {
        let mut conn = self.connection().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(Self::namespaced(key))
            .arg(&self.holder_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| SyncError::Lock(format!("try_lock failed: {e}")))?;
        Ok(result.is_some())
    }

    async fn unlock(&self, key: &str) -> Result<(), SyncError> {
        let mut conn = self.connection().await?;
        let released: i64 = Script::new(RELEASE_SCRIPT)
            .key(Self::namespaced(key))
            .arg(&self.holder_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Lock(format!("unlock failed: {e}")))?;
        if released == 0 {
            tracing::debug!(key, holder = %self.holder_id, "unlock skipped, not the holder");
        }
        Ok(())
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<bool, SyncError> {
        let mut conn = self.connection().await?;
        let refreshed: i64 = Script::new(REFRESH_SCRIPT)
            .key(Self::namespaced(key))
            .arg(&self.holder_id)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Lock(format!("refresh failed: {e}")))?;
        Ok(refreshed == 1)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, SyncError> {
        let mut conn = self.connection().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| SyncError::Lock(format!("is_locked failed: {e}")))?;
        Ok(exists)
    }
}

/// Runs a closure under a lock, optionally refreshing it on an interval
/// while the closure runs.
pub struct LockedExecutor<L: DistributedLock + 'static> {
    lock: Arc<L>,
}

impl<L: DistributedLock + 'static> LockedExecutor<L> {
    pub fn new(lock: Arc<L>) -> Self {
        Self { lock }
    }

    /// Acquire `key`, run the closure, release. Returns `None` when the
    /// lock is already held elsewhere (the caller skips its tick). A
    /// lock backend error propagates; it must not silently authorize
    /// duplicate execution.
    pub async fn run<F, Fut, T>(
        &self,
        key: &str,
        ttl: Duration,
        auto_refresh: Option<Duration>,
        f: F,
    ) -> Result<Option<T>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.lock.try_lock(key, ttl).await? {
            return Ok(None);
        }

        let refresh_cancel = CancellationToken::new();
        let refresher = auto_refresh.map(|interval| {
            let lock = Arc::clone(&self.lock);
            let key = key.to_owned();
            let stop = refresh_cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            match lock.refresh(&key, ttl).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    tracing::warn!(key = %key, "lock lost during refresh");
                                    break;
                                }
                                Err(e) => {
                                    tracing::warn!(key = %key, error = %e, "lock refresh failed");
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        });

        let output = f().await;

        refresh_cancel.cancel();
        if let Some(handle) = refresher {
            let _ = handle.await;
        }
        self.lock.unlock(key).await?;

        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_id_is_host_and_pid() {
        let holder = local_holder_id();
        let (_host, pid) = holder.rsplit_once(':').expect("host:pid shape");
        assert_eq!(pid.parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(
            RedisLock::namespaced("taskA"),
            "sync_task_scheduler:lock:taskA"
        );
    }
}
