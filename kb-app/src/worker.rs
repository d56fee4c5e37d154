//! Worker process: lease, signal handling, delivery loop.

use crate::config::KinobotConfig;
use anyhow::{Context, Result};
use kb_dispatch::{ConsumerLock, DeliveryWorker, QueueResult, RecoveryPolicy, RedisQueue};
use kb_telegram::TelegramBot;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub async fn run(cfg: &KinobotConfig) -> Result<()> {
    let token = cfg.require_bot_token()?;
    let bot = TelegramBot::with_options(token, &cfg.telegram.api_base_url, cfg.request_timeout())
        .context("build telegram client")?;
    let queue = RedisQueue::connect(cfg.redis_queue())
        .await
        .context("connect to redis")?;
    let worker_id = worker_id();
    let lease_key = queue.config().lease_key();

    let lease = if cfg.worker.single_consumer_lock {
        let lease = ConsumerLock::acquire(queue.client(), &lease_key, &worker_id, cfg.lock_ttl())
            .await
            .with_context(|| format!("acquire consumer lease {lease_key}"))?;
        Some(Arc::new(lease))
    } else {
        tracing::warn!(
            queue = %cfg.queue.queue_name,
            "single-consumer lock disabled; ordering holds only if one worker runs"
        );
        None
    };

    tracing::info!(
        worker_id = %worker_id,
        queue = %cfg.queue.queue_name,
        redis_url = %cfg.queue.redis_url,
        "worker starting"
    );

    let shutdown = CancellationToken::new();
    let signal_handle = tokio::spawn(shutdown_signal(shutdown.clone()));
    let renew_handle = lease
        .clone()
        .map(|lease| tokio::spawn(keep_lease(lease, shutdown.clone())));

    let worker = DeliveryWorker::new(Arc::new(queue), Arc::new(bot))
        .with_policy(RecoveryPolicy::new(cfg.worker.media_unavailable_notice.clone()))
        .with_config(cfg.worker_config());
    let report = worker.run(shutdown.clone()).await;

    shutdown.cancel();
    signal_handle.abort();
    let lease_status = match renew_handle {
        Some(handle) => handle.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "lease renewal task join failed during shutdown");
            Ok(())
        }),
        None => Ok(()),
    };
    if let Some(lease) = lease {
        match Arc::try_unwrap(lease) {
            Ok(lease) => {
                if let Err(e) = lease.release().await {
                    tracing::warn!(error = %e, "consumer lease release failed; it will expire");
                }
            }
            Err(_) => tracing::warn!("consumer lease still shared at shutdown; it will expire"),
        }
    }

    if let Err(e) = lease_status {
        tracing::error!(
            worker_id = %worker_id,
            processed = report.processed(),
            error = %e,
            "worker stopped without its consumer lease"
        );
        return Err(e);
    }
    tracing::info!(
        worker_id = %worker_id,
        processed = report.processed(),
        "worker shutdown completed"
    );
    Ok(())
}

fn worker_id() -> String {
    format!("kinobot-{}-{}", std::process::id(), uuid::Uuid::new_v4())
}

#[async_trait::async_trait]
trait RenewableLease: Send + Sync {
    async fn renew(&self) -> QueueResult<bool>;
    fn ttl(&self) -> Duration;
    fn renew_interval(&self) -> Duration;
}

#[async_trait::async_trait]
impl RenewableLease for ConsumerLock {
    async fn renew(&self) -> QueueResult<bool> {
        ConsumerLock::renew(self).await
    }

    fn ttl(&self) -> Duration {
        ConsumerLock::ttl(self)
    }

    fn renew_interval(&self) -> Duration {
        ConsumerLock::renew_interval(self)
    }
}

/// Renews the lease until shutdown. Once the lease is lost, or a full TTL
/// passes without a successful renewal, cancels `shutdown` and fails.
async fn keep_lease<L: RenewableLease>(lease: Arc<L>, shutdown: CancellationToken) -> Result<()> {
    let mut ticker = tokio::time::interval(lease.renew_interval());
    ticker.tick().await;
    let mut last_renewed = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        match lease.renew().await {
            Ok(true) => {
                last_renewed = Instant::now();
                tracing::trace!("consumer lease renewed");
            }
            Ok(false) => {
                tracing::error!("consumer lease lost to another worker; stopping");
                shutdown.cancel();
                return Err(anyhow::anyhow!("consumer lease lost to another worker"));
            }
            Err(e) if last_renewed.elapsed() >= lease.ttl() => {
                tracing::error!(error = %e, "consumer lease expired without renewal; stopping");
                shutdown.cancel();
                return Err(anyhow::anyhow!("consumer lease expired without renewal: {e}"));
            }
            Err(e) => tracing::warn!(error = %e, "consumer lease renewal failed; retrying"),
        }
    }
}

pub async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; finishing current envelope");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; finishing current envelope");
            }
            _ = shutdown.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => tracing::warn!("received ctrl-c; finishing current envelope"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => return,
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_dispatch::QueueError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted renewal results, then keeps renewing or keeps failing.
    struct ScriptedLease {
        results: Mutex<VecDeque<QueueResult<bool>>>,
        then_renews: bool,
        ttl: Duration,
    }

    impl ScriptedLease {
        fn new(results: Vec<QueueResult<bool>>, then_renews: bool) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                then_renews,
                ttl: Duration::from_millis(20),
            })
        }
    }

    #[async_trait::async_trait]
    impl RenewableLease for ScriptedLease {
        async fn renew(&self) -> QueueResult<bool> {
            let next = self.results.lock().expect("results lock").pop_front();
            match next {
                Some(result) => result,
                None if self.then_renews => Ok(true),
                None => Err(QueueError::OperationFailed("connection reset".to_string())),
            }
        }

        fn ttl(&self) -> Duration {
            self.ttl
        }

        fn renew_interval(&self) -> Duration {
            Duration::from_millis(2)
        }
    }

    #[tokio::test]
    async fn losing_the_lease_stops_the_worker_with_an_error() {
        let shutdown = CancellationToken::new();
        let lease = ScriptedLease::new(vec![Ok(true), Ok(false)], true);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            keep_lease(lease, shutdown.clone()),
        )
        .await
        .expect("renewal loop ends");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("lost"), "{err}");
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn renewal_failing_for_a_full_ttl_is_fatal() {
        let shutdown = CancellationToken::new();
        let lease = ScriptedLease::new(Vec::new(), false);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            keep_lease(lease, shutdown.clone()),
        )
        .await
        .expect("renewal loop ends");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("expired"), "{err}");
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn transient_renewal_error_is_retried() {
        let shutdown = CancellationToken::new();
        let lease = ScriptedLease::new(
            vec![Err(QueueError::OperationFailed("timeout".to_string()))],
            true,
        );
        let handle = tokio::spawn(keep_lease(lease.clone(), shutdown.clone()));

        for _ in 0..200 {
            if lease.results.lock().expect("results lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!shutdown.is_cancelled());
        shutdown.cancel();
        handle
            .await
            .expect("renewal task joins")
            .expect("clean shutdown is not an error");
    }

    #[test]
    fn worker_ids_are_unique_per_process_start() {
        let a = worker_id();
        let b = worker_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("kinobot-{}-", std::process::id())));
    }

    #[tokio::test]
    async fn shutdown_signal_returns_once_cancelled_elsewhere() {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(shutdown_signal(shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("signal task exits")
            .expect("signal task joins");
    }
}
