use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::source::InboundMessageEvent;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// What every sink and observer receives for one accepted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub sender: String,
    pub msg: String,
    pub timestamp: String,
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
}

impl DeliveryPayload {
    /// Build the payload with the timestamp rendered in local time.
    pub fn from_event(event: &InboundMessageEvent, phone_number: &str) -> Self {
        Self::from_event_in(event, phone_number, &Local)
    }

    pub fn from_event_in<Tz: TimeZone>(
        event: &InboundMessageEvent,
        phone_number: &str,
        tz: &Tz,
    ) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        Self {
            sender: event.sender.clone(),
            msg: event.body.clone(),
            timestamp: format_timestamp(event.timestamp, tz),
            phone_number: phone_number.to_string(),
        }
    }
}

pub fn format_timestamp<Tz: TimeZone>(ts: DateTime<Utc>, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    ts.with_timezone(tz).format(TIMESTAMP_FORMAT).to_string()
}

/// JSON body posted to every HTTP sink.
pub fn format_for_http(payload: &DeliveryPayload) -> serde_json::Value {
    serde_json::json!({
        "sender": payload.sender,
        "msg": payload.msg,
        "timestamp": payload.timestamp,
        "phoneNumber": payload.phone_number,
    })
}

/// Escape the characters Telegram's HTML parse mode treats as markup.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the fixed Telegram message template.
pub fn format_for_telegram(payload: &DeliveryPayload) -> String {
    format!(
        "<b>Date</b>: <code>{}</code>\n\
         <b>From:</b> <u><code>{}</code></u>\n\
         <b>TO:</b> <u><code>{}</code></u>\n\
         <b>Message:</b>\n\
         <pre>{}</pre>",
        escape_html(&payload.timestamp),
        escape_html(&payload.sender),
        escape_html(&payload.phone_number),
        escape_html(&payload.msg),
    )
}
