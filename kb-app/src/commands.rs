//! One-shot CLI commands.

use crate::config::KinobotConfig;
use anyhow::{Context, Result};
use kb_dispatch::{ConsumerLock, Delivery, DispatchMode, Dispatcher, DurableQueue, RedisQueue};
use kb_telegram::{ChatId, ParseMode, SendTextOptions, TelegramBot};
use std::sync::Arc;

/// Sends one text message through the dispatcher.
pub async fn enqueue(
    cfg: &KinobotConfig,
    chat_id: &str,
    text: &str,
    parse_mode: Option<ParseMode>,
    direct: bool,
) -> Result<()> {
    let mode = if direct {
        DispatchMode::Direct
    } else {
        DispatchMode::Queued
    };
    let token = match mode {
        DispatchMode::Direct => cfg.require_bot_token()?,
        DispatchMode::Queued => cfg.telegram.bot_token.as_str(),
    };
    let bot = TelegramBot::with_options(token, &cfg.telegram.api_base_url, cfg.request_timeout())
        .context("build telegram client")?;
    let queue = RedisQueue::connect(cfg.redis_queue())
        .await
        .context("connect to redis")?;
    let dispatcher = Dispatcher::new(Arc::new(queue), Arc::new(bot));

    let options = SendTextOptions {
        parse_mode,
        ..Default::default()
    };
    let delivery = dispatcher
        .send_text(parse_chat_id(chat_id), text, options, mode)
        .await
        .with_context(|| format!("send_text to {chat_id}"))?;

    match delivery {
        Delivery::Queued => println!("queued on {}", cfg.queue.queue_name),
        Delivery::Sent(output) => match output.message_id() {
            Some(id) => println!("sent message_id={}", id.0),
            None => println!("sent"),
        },
    }
    Ok(())
}

pub async fn status(cfg: &KinobotConfig) -> Result<()> {
    let queue = RedisQueue::connect(cfg.redis_queue())
        .await
        .context("connect to redis")?;
    let depth = queue.len().await.context("read queue length")?;
    let lease_key = queue.config().lease_key();
    let holder = ConsumerLock::holder(queue.client(), &lease_key)
        .await
        .context("read consumer lease")?;

    tracing::info!(
        queue = %cfg.queue.queue_name,
        depth,
        lease_holder = ?holder.as_ref().map(|h| h.worker_id.as_str()),
        "status ok"
    );
    println!("queue={} depth={depth}", cfg.queue.queue_name);
    match holder {
        Some(record) => println!(
            "consumer={} since={}",
            record.worker_id,
            record.acquired_at.to_rfc3339()
        ),
        None => println!("consumer=none"),
    }
    Ok(())
}

pub async fn doctor(cfg: &KinobotConfig) -> Result<()> {
    cfg.validate()?;
    tracing::info!(
        queue = %cfg.queue.queue_name,
        redis_url = %cfg.queue.redis_url,
        single_consumer_lock = cfg.worker.single_consumer_lock,
        "config ok"
    );

    let queue = RedisQueue::connect(cfg.redis_queue())
        .await
        .context("connect to redis")?;
    queue.ping().await.context("ping redis")?;
    tracing::info!(redis_url = %cfg.queue.redis_url, "redis ok");

    match cfg.require_bot_token() {
        Ok(token) => {
            let bot = TelegramBot::with_options(
                token,
                &cfg.telegram.api_base_url,
                cfg.request_timeout(),
            )
            .context("build telegram client")?;
            let me = bot.get_me().await.context("telegram getMe")?;
            tracing::info!(
                username = ?me.get("username").and_then(|v| v.as_str()),
                "telegram ok"
            );
        }
        Err(e) => tracing::warn!(error = %e, "telegram check skipped"),
    }
    println!("doctor: ok");
    Ok(())
}

/// Numeric ids become `ChatId::Id`; anything else is a username.
fn parse_chat_id(raw: &str) -> ChatId {
    match raw.trim().parse::<i64>() {
        Ok(id) => ChatId::Id(id),
        Err(_) => ChatId::Username(raw.trim().to_string()),
    }
}
