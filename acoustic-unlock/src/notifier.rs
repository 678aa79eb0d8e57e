//! Operator notifications
//!
//! Best-effort channel for lifecycle messages (start, restart, shutdown).
//! Delivery failures are the caller's to log; they never stop the service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const SLACK_API: &str = "https://slack.com/api";

/// Slack rejects longer message texts
pub const MAX_TEXT_LEN: usize = 3000;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification request failed: {0}")]
    RequestFailed(String),

    #[error("Notification rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post(&self, text: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn post(&self, text: &str) -> Result<(), NotifyError> {
        info!("Notification: {}", text);
        Ok(())
    }
}

/// Empty text becomes a single space and long text is cut to [`MAX_TEXT_LEN`] characters
pub fn normalize_text(text: &str) -> String {
    if text.is_empty() {
        return " ".to_string();
    }

    text.chars().take(MAX_TEXT_LEN).collect()
}

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Posts to a Slack channel through `chat.postMessage`
pub struct SlackNotifier {
    client: reqwest::Client,
    token: String,
    channel: String,
    api_base: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl SlackNotifier {
    pub fn new(
        token: impl Into<String>,
        channel: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::RequestFailed(e.to_string()))?;

        Ok(Self {
            client,
            token: token.into(),
            channel: channel.into(),
            api_base: SLACK_API.to_string(),
            max_retries: 3,
            retry_delay: Duration::from_secs(10),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    async fn post_once(&self, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(&self.token)
            .json(&PostMessage {
                channel: &self.channel,
                text,
            })
            .send()
            .await
            .map_err(|e| NotifyError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::RequestFailed(response.status().to_string()));
        }

        let body: SlackResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::RequestFailed(e.to_string()))?;

        if !body.ok {
            return Err(NotifyError::Rejected(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn post(&self, text: &str) -> Result<(), NotifyError> {
        let text = normalize_text(text);
        let mut attempt = 0;

        loop {
            match self.post_once(&text).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Slack post failed ({}), retry {}/{} in {:?}",
                        e, attempt, self.max_retries, self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer every connection with the next canned body, counting requests
    async fn slack_stub(bodies: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            for body in bodies {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut data = Vec::new();
                let mut buf = [0u8; 2048];
                while !String::from_utf8_lossy(&data).ends_with('}') {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                }
                counter.fetch_add(1, Ordering::SeqCst);

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.ok();
                socket.shutdown().await.ok();
            }
        });

        (base, hits)
    }

    fn notifier(base: String) -> SlackNotifier {
        SlackNotifier::new("xoxb-test", "door", Duration::from_secs(5))
            .unwrap()
            .with_api_base(base)
            .with_retry(3, Duration::from_millis(1))
    }

    #[test]
    fn test_normalize_empty_text() {
        assert_eq!(normalize_text(""), " ");
    }

    #[test]
    fn test_normalize_truncates_long_text() {
        let long = "あ".repeat(MAX_TEXT_LEN + 10);
        let normalized = normalize_text(&long);
        assert_eq!(normalized.chars().count(), MAX_TEXT_LEN);
    }

    #[test]
    fn test_normalize_keeps_short_text() {
        assert_eq!(normalize_text("Restart AutoUnlock"), "Restart AutoUnlock");
    }

    #[tokio::test]
    async fn test_post_succeeds_first_try() {
        let (base, hits) = slack_stub(vec![r#"{"ok":true}"#]).await;

        notifier(base).post("hello").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_retries_rejections() {
        let (base, hits) = slack_stub(vec![
            r#"{"ok":false,"error":"ratelimited"}"#,
            r#"{"ok":false,"error":"ratelimited"}"#,
            r#"{"ok":true}"#,
        ])
        .await;

        notifier(base).post("hello").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_post_gives_up_after_bounded_retries() {
        let (base, hits) = slack_stub(vec![r#"{"ok":false,"error":"channel_not_found"}"#; 4]).await;

        let result = notifier(base).post("hello").await;
        match result {
            Err(NotifyError::Rejected(reason)) => assert_eq!(reason, "channel_not_found"),
            other => panic!("Expected Rejected, got {:?}", other),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier.post("anything").await.is_ok());
    }
}
