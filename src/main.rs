mod config;
mod dispatch;
mod filter;
mod format;
mod gateway;
mod settings;
mod source;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::gateway::Gateway;
use crate::settings::store::SettingsStore;
use crate::settings::ChatId;
use crate::source::JsonLinesSource;

#[derive(Parser, Debug)]
#[command(name = "smsgateway", about = "Forward incoming SMS to webhooks and Telegram chats")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "SMSGATEWAY_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read NDJSON message events and forward them
    Run {
        /// Read events from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Print every accepted message to stdout as JSON
        #[arg(long)]
        echo: bool,
    },
    /// Print all settings as JSON
    Show,
    /// Print one setting
    Get { key: String },
    /// Store one setting; list values are JSON arrays
    Set { key: String, value: String },
    /// Set the Telegram bot token and chat ids together
    Telegram {
        token: String,
        chat_ids: Vec<String>,
    },
    /// Delete every stored setting
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,smsgateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    info!("Loading configuration from: {}", cli.config.display());
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let store = SettingsStore::open(&config.store.database_path)?;

    match cli.command {
        Command::Run { input, echo } => {
            let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("Failed to open input: {}", path.display()))?;
                    Box::new(BufReader::new(file))
                }
                None => Box::new(BufReader::new(tokio::io::stdin())),
            };
            run(&config, store, JsonLinesSource::new(reader), echo).await?;
        }
        Command::Show => {
            let settings = store.get_all().await;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::Get { key } => {
            let value = store.get_by_key(&key).await?;
            println!("{}", value);
        }
        Command::Set { key, value } => {
            store.set_by_key(&key, &value).await?;
            info!("Updated {}", key);
        }
        Command::Telegram { token, chat_ids } => {
            let chat_ids: Vec<ChatId> = chat_ids.into_iter().map(parse_chat_id).collect();
            store.set_telegram_config(&token, &chat_ids).await?;
            info!("Telegram configured with {} chat ids", chat_ids.len());
        }
        Command::Reset => {
            store.reset().await?;
            info!("All settings cleared");
        }
    }

    Ok(())
}

async fn run<R>(
    config: &Config,
    store: SettingsStore,
    mut source: JsonLinesSource<R>,
    echo: bool,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
{
    let settings = store.get_all().await;
    info!("Gateway starting");
    info!("  Enabled: {}", settings.enabled);
    info!("  Delivery mode: {}", settings.delivery_mode);
    info!("  HTTP sinks: {}", settings.http_sinks.len());
    info!("  Telegram chats: {}", settings.telegram_chat_ids.len());
    if !settings.enabled {
        warn!(
            "SMS listener is disabled; messages will be ignored until {} is set",
            crate::settings::store::KEY_ENABLED
        );
    }

    let dispatcher = Arc::new(Dispatcher::new(&config.dispatch)?);
    let gateway = Gateway::new(store, dispatcher.clone());

    let echo_task = if echo {
        let mut rx = gateway.subscribe();
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => match serde_json::to_string(&*payload) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Failed to encode event: {}", e),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged = n, "echo observer lagged behind");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    } else {
        None
    };

    info!("  Observers: {}", gateway.observer_count());

    tokio::select! {
        _ = gateway.run(&mut source) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    info!("{} deliveries in flight", dispatcher.in_flight());
    let aborted = dispatcher.shutdown(config.dispatch.shutdown_grace()).await;
    if aborted > 0 {
        warn!("{} deliveries aborted at shutdown", aborted);
    }

    drop(gateway);
    if let Some(task) = echo_task {
        task.await.ok();
    }

    info!("Gateway stopped");
    Ok(())
}

/// Numeric ids stay numbers so Telegram receives them unquoted.
fn parse_chat_id(raw: String) -> ChatId {
    match raw.trim().parse::<i64>() {
        Ok(n) => ChatId::Number(n),
        Err(_) => ChatId::Text(raw),
    }
}
