//! Redis list backend: RPUSH to enqueue, BLPOP to consume.

use crate::error::{QueueError, QueueResult};
use crate::queue::DurableQueue;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_QUEUE_NAME: &str = "bot_queue";

/// Extra time allowed past the server-side BLPOP timeout for the reply.
const POP_RESPONSE_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis connection URL
    pub url: String,
    /// Key of the list holding queued envelopes
    pub queue_name: String,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

impl RedisQueueConfig {
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Key of the single-consumer lease that guards this queue.
    pub fn lease_key(&self) -> String {
        format!("{}:consumer", self.queue_name)
    }
}

pub struct RedisQueue {
    client: Client,
    connection: MultiplexedConnection,
    config: RedisQueueConfig,
}

impl RedisQueue {
    pub async fn connect(config: RedisQueueConfig) -> QueueResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| QueueError::ConnectionFailed {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                url: config.url.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(url = %config.url, queue = %config.queue_name, "redis queue connected");
        Ok(Self {
            client,
            connection,
            config,
        })
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.config
    }

    /// Underlying client, for components that need their own connection.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DurableQueue for RedisQueue {
    async fn push(&self, payload: String) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.rpush(&self.config.queue_name, payload).await?;
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> QueueResult<Option<String>> {
        let mut conn = self.connection.clone();
        // BLPOP with a zero timeout blocks forever.
        let seconds = timeout.as_secs_f64().max(0.001);
        let popped: Option<(String, String)> = within(
            timeout + POP_RESPONSE_MARGIN,
            conn.blpop(&self.config.queue_name, seconds),
        )
        .await?;
        Ok(popped.map(|(_, payload)| payload))
    }

    async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.connection.clone();
        Ok(conn.llen(&self.config.queue_name).await?)
    }
}

/// Fails a Redis round trip that outlives `deadline`, so a half-open
/// connection cannot park the consumer past a shutdown request.
async fn within<T>(
    deadline: Duration,
    request: impl Future<Output = redis::RedisResult<T>>,
) -> QueueResult<T> {
    match tokio::time::timeout(deadline, request).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(QueueError::OperationFailed(format!(
            "no reply from redis within {}ms",
            deadline.as_millis()
        ))),
    }
}
