pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Which sink categories receive forwarded messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Http,
    Telegram,
    #[default]
    All,
    /// A stored value we do not know. Dispatch treats it like `All`.
    Unrecognized(String),
}

impl DeliveryMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "http" => DeliveryMode::Http,
            "telegram" => DeliveryMode::Telegram,
            "all" => DeliveryMode::All,
            _ => DeliveryMode::Unrecognized(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeliveryMode::Http => "http",
            DeliveryMode::Telegram => "telegram",
            DeliveryMode::All => "all",
            DeliveryMode::Unrecognized(raw) => raw,
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DeliveryMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeliveryMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(DeliveryMode::parse(&raw))
    }
}

/// A generic webhook endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpSink {
    #[serde(default)]
    pub url: String,
    #[serde(default, deserialize_with = "lenient_headers")]
    pub headers: BTreeMap<String, String>,
}

/// Header values written by other clients may be numbers or booleans.
/// Scalars become strings; nulls, arrays and objects are dropped.
fn lenient_headers<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut headers = BTreeMap::new();
    for (name, value) in raw {
        let value = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                warn!("Dropping header '{}' with non-scalar value {}", name, other);
                continue;
            }
        };
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Telegram accepts both numeric ids and `@channel` usernames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatId {
    Number(i64),
    Text(String),
}

impl ChatId {
    pub fn is_empty(&self) -> bool {
        match self {
            ChatId::Number(_) => false,
            ChatId::Text(s) => s.trim().is_empty(),
        }
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatId::Number(n) => write!(f, "{}", n),
            ChatId::Text(s) => f.write_str(s),
        }
    }
}

/// Point-in-time view of every runtime setting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub enabled: bool,
    pub delivery_mode: DeliveryMode,
    pub http_sinks: Vec<HttpSink>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_ids: Vec<ChatId>,
    pub telegram_parse_mode: String,
    pub user_phone_number: String,
    pub sender_filter: Vec<String>,
    pub keyword_filter: Vec<String>,
}

pub const DEFAULT_PARSE_MODE: &str = "HTML";

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            delivery_mode: DeliveryMode::All,
            http_sinks: Vec::new(),
            telegram_bot_token: None,
            telegram_chat_ids: Vec::new(),
            telegram_parse_mode: DEFAULT_PARSE_MODE.to_string(),
            user_phone_number: String::new(),
            sender_filter: Vec::new(),
            keyword_filter: Vec::new(),
        }
    }
}

impl Settings {
    /// The bot token, if one is set and non-blank.
    pub fn telegram_token(&self) -> Option<&str> {
        self.telegram_bot_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}
