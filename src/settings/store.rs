use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{ChatId, DeliveryMode, HttpSink, Settings, DEFAULT_PARSE_MODE};

pub const KEY_ENABLED: &str = "sms_listener_enabled";
pub const KEY_DELIVERY_TYPE: &str = "delivery_type";
pub const KEY_HTTP_CONFIGS: &str = "http_configs";
pub const KEY_TELEGRAM_BOT_TOKEN: &str = "telegram_bot_token";
pub const KEY_TELEGRAM_CHAT_IDS: &str = "telegram_chat_ids";
pub const KEY_TELEGRAM_PARSE_MODE: &str = "telegram_parse_mode";
pub const KEY_PHONE_NUMBER: &str = "phoneNumber";
pub const KEY_SENDERS_FILTER: &str = "senders_filter_list";
pub const KEY_KEYWORDS_FILTER: &str = "msg_keywords_filter_list";

pub const ALL_KEYS: &[&str] = &[
    KEY_ENABLED,
    KEY_DELIVERY_TYPE,
    KEY_HTTP_CONFIGS,
    KEY_TELEGRAM_BOT_TOKEN,
    KEY_TELEGRAM_CHAT_IDS,
    KEY_TELEGRAM_PARSE_MODE,
    KEY_PHONE_NUMBER,
    KEY_SENDERS_FILTER,
    KEY_KEYWORDS_FILTER,
];

/// SQLite-backed key-value store for runtime settings.
///
/// Values are stored as text under the key names the mobile bridge used, so
/// an exported preferences file maps one-to-one onto rows. Reads never fail:
/// a missing or malformed value yields the field default.
#[derive(Clone)]
pub struct SettingsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SettingsStore {
    /// Open or create the settings database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Settings store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )
        .context("Failed to create settings table")?;
        Ok(())
    }

    // ── Raw access ─────────────────────────────────────────────────────────

    async fn read(&self, key: &str) -> Option<String> {
        let conn = self.conn.lock().await;
        match read_row(&conn, key) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read setting '{}': {:#}", key, e);
                None
            }
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        write_row(&conn, key, value)
    }

    // ── Snapshot ───────────────────────────────────────────────────────────

    /// Read every setting under one lock so the result is consistent.
    pub async fn get_all(&self) -> Settings {
        let rows = {
            let conn = self.conn.lock().await;
            match read_all_rows(&conn) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("Failed to read settings, using defaults: {:#}", e);
                    HashMap::new()
                }
            }
        };
        let get = |key: &str| rows.get(key).map(String::as_str);

        Settings {
            enabled: decode_bool(KEY_ENABLED, get(KEY_ENABLED)),
            delivery_mode: decode_delivery_mode(get(KEY_DELIVERY_TYPE)),
            http_sinks: decode_list(KEY_HTTP_CONFIGS, get(KEY_HTTP_CONFIGS)),
            telegram_bot_token: get(KEY_TELEGRAM_BOT_TOKEN).map(str::to_string),
            telegram_chat_ids: decode_list(KEY_TELEGRAM_CHAT_IDS, get(KEY_TELEGRAM_CHAT_IDS)),
            telegram_parse_mode: decode_parse_mode(get(KEY_TELEGRAM_PARSE_MODE)),
            user_phone_number: get(KEY_PHONE_NUMBER).unwrap_or_default().to_string(),
            sender_filter: decode_list(KEY_SENDERS_FILTER, get(KEY_SENDERS_FILTER)),
            keyword_filter: decode_list(KEY_KEYWORDS_FILTER, get(KEY_KEYWORDS_FILTER)),
        }
    }

    // ── Getters ────────────────────────────────────────────────────────────

    pub async fn is_enabled(&self) -> bool {
        decode_bool(KEY_ENABLED, self.read(KEY_ENABLED).await.as_deref())
    }

    pub async fn delivery_mode(&self) -> DeliveryMode {
        decode_delivery_mode(self.read(KEY_DELIVERY_TYPE).await.as_deref())
    }

    pub async fn http_sinks(&self) -> Vec<HttpSink> {
        decode_list(KEY_HTTP_CONFIGS, self.read(KEY_HTTP_CONFIGS).await.as_deref())
    }

    pub async fn telegram_bot_token(&self) -> Option<String> {
        self.read(KEY_TELEGRAM_BOT_TOKEN).await
    }

    pub async fn telegram_chat_ids(&self) -> Vec<ChatId> {
        decode_list(
            KEY_TELEGRAM_CHAT_IDS,
            self.read(KEY_TELEGRAM_CHAT_IDS).await.as_deref(),
        )
    }

    pub async fn telegram_parse_mode(&self) -> String {
        decode_parse_mode(self.read(KEY_TELEGRAM_PARSE_MODE).await.as_deref())
    }

    pub async fn user_phone_number(&self) -> String {
        self.read(KEY_PHONE_NUMBER).await.unwrap_or_default()
    }

    pub async fn sender_filter(&self) -> Vec<String> {
        decode_list(KEY_SENDERS_FILTER, self.read(KEY_SENDERS_FILTER).await.as_deref())
    }

    pub async fn keyword_filter(&self) -> Vec<String> {
        decode_list(KEY_KEYWORDS_FILTER, self.read(KEY_KEYWORDS_FILTER).await.as_deref())
    }

    // ── Setters ────────────────────────────────────────────────────────────

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.write(KEY_ENABLED, if enabled { "true" } else { "false" })
            .await
    }

    pub async fn set_delivery_mode(&self, mode: &DeliveryMode) -> Result<()> {
        self.write(KEY_DELIVERY_TYPE, mode.as_str()).await
    }

    pub async fn set_http_sinks(&self, sinks: &[HttpSink]) -> Result<()> {
        let json = serde_json::to_string(sinks).context("Failed to encode http_configs")?;
        self.write(KEY_HTTP_CONFIGS, &json).await
    }

    pub async fn set_telegram_bot_token(&self, token: &str) -> Result<()> {
        self.write(KEY_TELEGRAM_BOT_TOKEN, token).await
    }

    pub async fn set_telegram_chat_ids(&self, chat_ids: &[ChatId]) -> Result<()> {
        let json =
            serde_json::to_string(chat_ids).context("Failed to encode telegram_chat_ids")?;
        self.write(KEY_TELEGRAM_CHAT_IDS, &json).await
    }

    /// Replace token and chat ids together.
    pub async fn set_telegram_config(&self, token: &str, chat_ids: &[ChatId]) -> Result<()> {
        let json =
            serde_json::to_string(chat_ids).context("Failed to encode telegram_chat_ids")?;
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .context("Failed to begin settings transaction")?;
        write_row(&tx, KEY_TELEGRAM_BOT_TOKEN, token)?;
        write_row(&tx, KEY_TELEGRAM_CHAT_IDS, &json)?;
        tx.commit().context("Failed to commit telegram config")?;
        Ok(())
    }

    pub async fn set_telegram_parse_mode(&self, parse_mode: &str) -> Result<()> {
        self.write(KEY_TELEGRAM_PARSE_MODE, parse_mode).await
    }

    pub async fn set_user_phone_number(&self, phone_number: &str) -> Result<()> {
        self.write(KEY_PHONE_NUMBER, phone_number).await
    }

    pub async fn set_sender_filter(&self, list: &[String]) -> Result<()> {
        let json = serde_json::to_string(&dedup(list))?;
        self.write(KEY_SENDERS_FILTER, &json).await
    }

    pub async fn set_keyword_filter(&self, list: &[String]) -> Result<()> {
        let json = serde_json::to_string(&dedup(list))?;
        self.write(KEY_KEYWORDS_FILTER, &json).await
    }

    /// Remove every stored setting.
    pub async fn reset(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM settings", [])
            .context("Failed to clear settings")?;
        Ok(())
    }

    // ── Keyed access (CLI) ─────────────────────────────────────────────────

    /// Current value of one persisted key, rendered as JSON.
    pub async fn get_by_key(&self, key: &str) -> Result<Value> {
        let value = match key {
            KEY_ENABLED => Value::Bool(self.is_enabled().await),
            KEY_DELIVERY_TYPE => Value::String(self.delivery_mode().await.to_string()),
            KEY_HTTP_CONFIGS => serde_json::to_value(self.http_sinks().await)?,
            KEY_TELEGRAM_BOT_TOKEN => match self.telegram_bot_token().await {
                Some(token) => Value::String(token),
                None => Value::Null,
            },
            KEY_TELEGRAM_CHAT_IDS => serde_json::to_value(self.telegram_chat_ids().await)?,
            KEY_TELEGRAM_PARSE_MODE => Value::String(self.telegram_parse_mode().await),
            KEY_PHONE_NUMBER => Value::String(self.user_phone_number().await),
            KEY_SENDERS_FILTER => serde_json::to_value(self.sender_filter().await)?,
            KEY_KEYWORDS_FILTER => serde_json::to_value(self.keyword_filter().await)?,
            other => anyhow::bail!(
                "Unknown setting '{}'. Known keys: {}",
                other,
                ALL_KEYS.join(", ")
            ),
        };
        Ok(value)
    }

    /// Parse `value` for the given key and store it. Lists are JSON arrays.
    pub async fn set_by_key(&self, key: &str, value: &str) -> Result<()> {
        match key {
            KEY_ENABLED => {
                let enabled = parse_bool(value)
                    .with_context(|| format!("Invalid boolean for {}: '{}'", key, value))?;
                self.set_enabled(enabled).await
            }
            KEY_DELIVERY_TYPE => {
                let mode = DeliveryMode::parse(value);
                if let DeliveryMode::Unrecognized(raw) = &mode {
                    anyhow::bail!(
                        "Invalid delivery type '{}': expected http, telegram or all",
                        raw
                    );
                }
                self.set_delivery_mode(&mode).await
            }
            KEY_HTTP_CONFIGS => {
                let sinks: Vec<HttpSink> = serde_json::from_str(value)
                    .with_context(|| format!("Invalid JSON for {}", key))?;
                self.set_http_sinks(&sinks).await
            }
            KEY_TELEGRAM_BOT_TOKEN => self.set_telegram_bot_token(value).await,
            KEY_TELEGRAM_CHAT_IDS => {
                let ids: Vec<ChatId> = serde_json::from_str(value)
                    .with_context(|| format!("Invalid JSON for {}", key))?;
                self.set_telegram_chat_ids(&ids).await
            }
            KEY_TELEGRAM_PARSE_MODE => self.set_telegram_parse_mode(value).await,
            KEY_PHONE_NUMBER => self.set_user_phone_number(value).await,
            KEY_SENDERS_FILTER => {
                let list: Vec<String> = serde_json::from_str(value)
                    .with_context(|| format!("Invalid JSON for {}", key))?;
                self.set_sender_filter(&list).await
            }
            KEY_KEYWORDS_FILTER => {
                let list: Vec<String> = serde_json::from_str(value)
                    .with_context(|| format!("Invalid JSON for {}", key))?;
                self.set_keyword_filter(&list).await
            }
            other => anyhow::bail!(
                "Unknown setting '{}'. Known keys: {}",
                other,
                ALL_KEYS.join(", ")
            ),
        }
    }
}

fn read_row(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        rusqlite::params![key],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("Failed to query setting '{}'", key))
}

fn read_all_rows(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn
        .prepare("SELECT key, value FROM settings")
        .context("Failed to prepare settings query")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .context("Failed to query settings")?
        .collect::<rusqlite::Result<HashMap<String, String>>>()
        .context("Failed to collect settings")?;
    Ok(rows)
}

fn write_row(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = datetime('now')",
        rusqlite::params![key, value],
    )
    .with_context(|| format!("Failed to store setting '{}'", key))?;
    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn decode_bool(key: &str, raw: Option<&str>) -> bool {
    let Some(raw) = raw else {
        return false;
    };
    parse_bool(raw).unwrap_or_else(|| {
        warn!("Malformed boolean in '{}': {:?}, using false", key, raw);
        false
    })
}

fn decode_delivery_mode(raw: Option<&str>) -> DeliveryMode {
    raw.map(DeliveryMode::parse).unwrap_or_default()
}

fn decode_parse_mode(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(mode) if !mode.is_empty() => mode.to_string(),
        _ => DEFAULT_PARSE_MODE.to_string(),
    }
}

/// Decode a stored JSON array element by element, so one bad entry only
/// costs that entry.
fn decode_list<T: DeserializeOwned>(key: &str, raw: Option<&str>) -> Vec<T> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let items: Vec<Value> = match serde_json::from_str(raw) {
        Ok(items) => items,
        Err(e) => {
            warn!("Malformed JSON in '{}': {}, using default", key, e);
            return Vec::new();
        }
    };
    items
        .into_iter()
        .enumerate()
        .filter_map(|(idx, item)| match serde_json::from_value(item) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Skipping invalid entry {} in '{}': {}", idx, key, e);
                None
            }
        })
        .collect()
}

/// Keep first occurrence order; the bridge stored these as sets.
fn dedup(list: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(list.len());
    for item in list {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}
