use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use tracing::{debug, error, info};

use super::BranchReport;
use crate::format::{format_for_http, DeliveryPayload};
use crate::settings::HttpSink;

/// POST the payload to each sink in order. A failing sink is logged and the
/// loop moves on.
pub async fn send_all(
    client: &Client,
    sinks: &[HttpSink],
    payload: &DeliveryPayload,
) -> BranchReport {
    let body = format_for_http(payload);
    let mut report = BranchReport::default();

    for sink in sinks {
        let url = sink.url.trim();
        if url.is_empty() {
            debug!("Skipping HTTP sink with empty url");
            report.skipped += 1;
            continue;
        }

        match send_one(client, url, sink, &body).await {
            Ok(status) => {
                info!("Sent to {}: {}", url, status.as_u16());
                report.delivered += 1;
            }
            Err(e) => {
                error!("Http Error ({}): {:#}", url, e);
                report.failed += 1;
            }
        }
    }

    report
}

async fn send_one(
    client: &Client,
    url: &str,
    sink: &HttpSink,
    body: &serde_json::Value,
) -> Result<StatusCode> {
    let mut request = client.post(url);
    for (name, value) in &sink.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    // .json() only sets Content-Type when the sink headers did not.
    let response = request
        .json(body)
        .send()
        .await
        .context("Request failed")?;

    let status = response.status();
    if !status.is_success() {
        let error_body = response.text().await.unwrap_or_default();
        anyhow::bail!("HTTP {}: {}", status.as_u16(), truncate(&error_body, 200));
    }
    Ok(status)
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::collections::BTreeMap;

    fn payload() -> DeliveryPayload {
        DeliveryPayload {
            sender: "Vodafone".to_string(),
            msg: "Your OTP is 1234".to_string(),
            timestamp: "2024-03-01 09:30:00".to_string(),
            phone_number: String::new(),
        }
    }

    fn sink(url: String) -> HttpSink {
        HttpSink {
            url,
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_posts_json_body_with_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_header("x-api-key", "secret")
            .match_body(Matcher::Json(serde_json::json!({
                "sender": "Vodafone",
                "msg": "Your OTP is 1234",
                "timestamp": "2024-03-01 09:30:00",
                "phoneNumber": "",
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let mut with_headers = sink(format!("{}/hook", server.url()));
        with_headers
            .headers
            .insert("X-Api-Key".to_string(), "secret".to_string());

        let report = send_all(&Client::new(), &[with_headers], &payload()).await;
        assert_eq!(report.delivered, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_the_rest() {
        let mut server = mockito::Server::new_async().await;
        let broken = server
            .mock("POST", "/broken")
            .with_status(500)
            .with_body("boom")
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/ok")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let sinks = vec![
            sink(format!("{}/broken", server.url())),
            // Nothing listens on port 1.
            sink("http://127.0.0.1:1/unreachable".to_string()),
            sink(String::new()),
            sink(format!("{}/ok", server.url())),
        ];

        let report = send_all(&Client::new(), &sinks, &payload()).await;
        assert_eq!(
            report,
            BranchReport {
                delivered: 1,
                failed: 2,
                skipped: 1,
            }
        );
        broken.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_hung_sink_counts_as_failed_after_timeout() {
        let addr = crate::dispatch::tests::silent_listener().await;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(1))
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let report = send_all(&client, &[sink(format!("http://{}/hang", addr))], &payload()).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 0);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_sinks_no_requests() {
        let report = send_all(&Client::new(), &[], &payload()).await;
        assert_eq!(report, BranchReport::default());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
