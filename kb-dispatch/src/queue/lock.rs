//! Single-consumer lease.
//!
//! Ordering holds only while exactly one worker drains the queue. The
//! worker takes this lease before consuming and stops if it loses it.

use crate::error::{QueueError, QueueResult};
use chrono::{DateTime, Utc};
use redis::Client;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Value stored under the lease key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            acquired_at: Utc::now(),
        }
    }
}

pub struct ConsumerLock {
    connection: MultiplexedConnection,
    key: String,
    token: String,
    record: LeaseRecord,
    ttl: Duration,
}

impl ConsumerLock {
    /// Takes the lease or fails with [`QueueError::LeaseHeld`].
    pub async fn acquire(
        client: &Client,
        key: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> QueueResult<Self> {
        let record = LeaseRecord::new(worker_id);
        let token = serde_json::to_string(&record)
            .map_err(|e| QueueError::OperationFailed(format!("encode lease: {e}")))?;
        let mut connection = client.get_multiplexed_async_connection().await?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut connection)
            .await?;

        if acquired.is_none() {
            let holder = read_holder(&mut connection, key)
                .await?
                .map(|r| r.worker_id)
                .unwrap_or_else(|| "unknown".to_string());
            return Err(QueueError::LeaseHeld {
                key: key.to_string(),
                holder,
            });
        }

        tracing::info!(key, worker_id, ttl_ms = ttl_millis(ttl), "consumer lease acquired");
        Ok(Self {
            connection,
            key: key.to_string(),
            token,
            record,
            ttl,
        })
    }

    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// How often the holder should renew to keep the lease alive.
    pub fn renew_interval(&self) -> Duration {
        renew_interval(self.ttl)
    }

    /// Extends the lease. `false` means another worker holds it now.
    pub async fn renew(&self) -> QueueResult<bool> {
        let mut conn = self.connection.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .arg(ttl_millis(self.ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    pub async fn release(self) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;
        if released == 1 {
            tracing::info!(key = %self.key, "consumer lease released");
        } else {
            tracing::warn!(key = %self.key, "consumer lease was already gone at release");
        }
        Ok(())
    }

    /// Current holder of the lease at `key`, if any.
    pub async fn holder(client: &Client, key: &str) -> QueueResult<Option<LeaseRecord>> {
        let mut connection = client.get_multiplexed_async_connection().await?;
        read_holder(&mut connection, key).await
    }
}

async fn read_holder(
    connection: &mut MultiplexedConnection,
    key: &str,
) -> QueueResult<Option<LeaseRecord>> {
    let raw: Option<String> = redis::cmd("GET").arg(key).query_async(connection).await?;
    Ok(raw.and_then(|raw| match serde_json::from_str(&raw) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(key, %e, "unreadable consumer lease value");
            None
        }
    }))
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(100))
}
