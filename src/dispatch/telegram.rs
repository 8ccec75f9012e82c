use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::BranchReport;
use crate::format::{format_for_telegram, DeliveryPayload};
use crate::settings::ChatId;

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a ChatId,
    text: &'a str,
    parse_mode: &'a str,
}

pub fn send_message_url(api_base: &str, token: &str) -> String {
    format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token)
}

/// Send the rendered template to each chat in order.
pub async fn send_all(
    client: &Client,
    api_base: &str,
    token: &str,
    chat_ids: &[ChatId],
    parse_mode: &str,
    payload: &DeliveryPayload,
) -> BranchReport {
    let text = format_for_telegram(payload);
    let url = send_message_url(api_base, token);
    let mut report = BranchReport::default();

    debug!("Sending message: {}", text);

    for chat_id in chat_ids {
        if chat_id.is_empty() {
            debug!("Skipping empty Telegram chat id");
            report.skipped += 1;
            continue;
        }

        let request = SendMessageRequest {
            chat_id,
            text: &text,
            parse_mode,
        };

        match send_one(client, &url, &request).await {
            Ok((status, body)) if status.is_success() => {
                info!("Sent to Telegram chat {}: {} -> {}", chat_id, status.as_u16(), body);
                report.delivered += 1;
            }
            Ok((status, body)) => {
                warn!("Telegram rejected chat {}: {} -> {}", chat_id, status.as_u16(), body);
                report.failed += 1;
            }
            Err(e) => {
                error!("Telegram Error (chat {}): {:#}", chat_id, e);
                report.failed += 1;
            }
        }
    }

    report
}

async fn send_one(
    client: &Client,
    url: &str,
    request: &SendMessageRequest<'_>,
) -> Result<(StatusCode, String)> {
    let response = client
        .post(url)
        .json(request)
        .send()
        .await
        .context("Failed to reach Telegram Bot API")?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Ok((status, body))
}
