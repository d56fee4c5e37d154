//! Kinobot outbound delivery binary.

mod commands;
mod config;
mod worker;

use clap::{Parser, Subcommand, ValueEnum};
use config::KinobotConfig;
use kb_telegram::ParseMode;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "kinobot", version, about = "Kinobot outbound message queue and worker")]
struct Cli {
    /// Config file (defaults to ~/.kinobot/config.toml).
    #[arg(long, global = true, env = "KINOBOT_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drain the queue and deliver to Telegram until SIGINT/SIGTERM (default).
    Worker,
    /// Send one text message through the dispatcher.
    Enqueue {
        /// Numeric chat id or @username.
        #[arg(allow_hyphen_values = true)]
        chat_id: String,
        text: String,
        #[arg(long, value_enum)]
        parse_mode: Option<ParseModeArg>,
        /// Call Telegram now instead of queueing.
        #[arg(long)]
        direct: bool,
    },
    /// Show queue depth and the current consumer.
    Status,
    /// Validate config and check Redis and Telegram.
    Doctor,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ParseModeArg {
    Html,
    Markdown,
    MarkdownV2,
}

impl From<ParseModeArg> for ParseMode {
    fn from(value: ParseModeArg) -> Self {
        match value {
            ParseModeArg::Html => ParseMode::Html,
            ParseModeArg::Markdown => ParseMode::Markdown,
            ParseModeArg::MarkdownV2 => ParseMode::MarkdownV2,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();
    init_tracing()?;
    install_panic_hook();
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();
    let cfg = KinobotConfig::load(cli.config).await?;

    match cli.command.unwrap_or(Command::Worker) {
        Command::Worker => worker::run(&cfg).await,
        Command::Enqueue {
            chat_id,
            text,
            parse_mode,
            direct,
        } => commands::enqueue(&cfg, &chat_id, &text, parse_mode.map(Into::into), direct).await,
        Command::Status => commands::status(&cfg).await,
        Command::Doctor => commands::doctor(&cfg).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,kinobot=debug,kb_app=debug,kb_dispatch=debug,kb_telegram=debug",
        ),
    };
    let log_format = std::env::var("KINOBOT_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    match log_format.as_str() {
        "json" => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported KINOBOT_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
