use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::warn;

/// One received SMS, with multipart bodies already joined.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessageEvent {
    pub sender: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    /// SIM slot or line the message arrived on, when the device reports it.
    pub line_identifier: Option<String>,
}

impl InboundMessageEvent {
    /// Build an event from the raw parts of a message batch.
    pub fn from_parts(
        sender: Option<String>,
        parts: &[String],
        timestamp: Option<DateTime<Utc>>,
        line_identifier: Option<String>,
    ) -> Self {
        Self {
            sender: sender
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            body: parts.join("\n"),
            timestamp: timestamp.unwrap_or_else(Utc::now),
            line_identifier,
        }
    }
}

/// Anything that produces inbound messages.
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` once the source is exhausted.
    async fn next_event(&mut self) -> Option<InboundMessageEvent>;
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    parts: Vec<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    line: Option<String>,
}

impl RawEvent {
    fn into_event(self) -> InboundMessageEvent {
        let mut parts = self.parts;
        if let Some(body) = self.body {
            parts.insert(0, body);
        }
        let timestamp = self
            .timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        InboundMessageEvent::from_parts(self.sender, &parts, timestamp, self.line)
    }
}

/// Reads one JSON object per line, e.g.
/// `{"sender": "Vodafone", "body": "Your OTP is 1234", "timestamp": 1709285400000}`.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl<R: AsyncBufRead + Unpin> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventSource for JsonLinesSource<R> {
    async fn next_event(&mut self) -> Option<InboundMessageEvent> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Failed to read event stream: {}", e);
                    return None;
                }
            };
            self.line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<RawEvent>(trimmed) {
                Ok(raw) => return Some(raw.into_event()),
                Err(e) => warn!("Skipping malformed event on line {}: {}", self.line_no, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_from_parts_joins_with_newline() {
        let parts = vec!["Your OTP".to_string(), "is 1234".to_string()];
        let event = InboundMessageEvent::from_parts(Some("Bank".into()), &parts, None, None);
        assert_eq!(event.body, "Your OTP\nis 1234");
        assert_eq!(event.sender, "Bank");
    }

    #[test]
    fn test_missing_sender_is_unknown() {
        let event = InboundMessageEvent::from_parts(None, &[], None, None);
        assert_eq!(event.sender, "unknown");
        assert_eq!(event.body, "");
    }

    #[tokio::test]
    async fn test_json_lines_source() {
        let input = concat!(
            r#"{"sender": "Vodafone", "body": "Your OTP is 1234", "#,
            r#""timestamp": 1709285400000, "line": "1"}"#,
            "\n",
            "\n",
            "not json\n",
            r#"{"sender": "Bank", "parts": ["part one", "part two"]}"#,
            "\n",
        );
        let mut source = JsonLinesSource::new(BufReader::new(input.as_bytes()));

        let first = source.next_event().await.unwrap();
        assert_eq!(first.sender, "Vodafone");
        assert_eq!(first.body, "Your OTP is 1234");
        assert_eq!(first.timestamp.timestamp_millis(), 1709285400000);
        assert_eq!(first.line_identifier.as_deref(), Some("1"));

        let second = source.next_event().await.unwrap();
        assert_eq!(second.sender, "Bank");
        assert_eq!(second.body, "part one\npart two");

        assert!(source.next_event().await.is_none());
    }
}
