//! Unlock actuator
//!
//! Sends the physical unlock command once a clip verification succeeds.
//! The response is logged and otherwise not interpreted.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Capability used to open the lock
pub const UNLOCK_COMMAND: &str = "turnOn";

const SWITCH_BOT_API: &str = "https://api.switch-bot.com";

/// SwitchBot reports success with this status code in the JSON body
const SWITCH_BOT_SUCCESS: i64 = 100;

#[derive(Error, Debug)]
pub enum ActuatorError {
    #[error("Actuator request failed: {0}")]
    RequestFailed(String),

    #[error("Actuator rejected command: {0}")]
    Rejected(String),

    #[error("Invalid actuator credentials: {0}")]
    InvalidCredentials(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UnlockActuator: Send + Sync {
    /// Send `command` to `device_id`; returns the raw response body
    async fn control(&self, device_id: &str, command: &str) -> Result<String, ActuatorError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest<'a> {
    command: &'a str,
    parameter: &'a str,
    command_type: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResponse {
    status_code: i64,
    #[serde(default)]
    message: String,
}

/// SwitchBot Open API (v1.1) client
pub struct SwitchBotActuator {
    client: reqwest::Client,
    token: String,
    secret: String,
    base_url: String,
}

impl SwitchBotActuator {
    pub fn new(
        token: impl Into<String>,
        secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ActuatorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ActuatorError::RequestFailed(e.to_string()))?;

        Ok(Self {
            client,
            token: token.into(),
            secret: secret.into(),
            base_url: SWITCH_BOT_API.to_string(),
        })
    }

    /// Point the client at another API host
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// base64(HMAC-SHA256(secret, token + t + nonce))
    pub fn sign(&self, timestamp_ms: i64, nonce: &str) -> Result<String, ActuatorError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ActuatorError::InvalidCredentials(e.to_string()))?;
        mac.update(self.token.as_bytes());
        mac.update(timestamp_ms.to_string().as_bytes());
        mac.update(nonce.as_bytes());

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl UnlockActuator for SwitchBotActuator {
    async fn control(&self, device_id: &str, command: &str) -> Result<String, ActuatorError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let nonce = uuid::Uuid::new_v4().to_string();
        let sign = self.sign(timestamp, &nonce)?;

        let url = format!("{}/v1.1/devices/{}/commands", self.base_url, device_id);
        debug!("Sending '{}' to {}", command, url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", &self.token)
            .header("sign", sign)
            .header("t", timestamp.to_string())
            .header("nonce", nonce)
            .json(&CommandRequest {
                command,
                parameter: "default",
                command_type: "command",
            })
            .send()
            .await
            .map_err(|e| ActuatorError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ActuatorError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(ActuatorError::RequestFailed(format!("{}: {}", status, body)));
        }

        let parsed: CommandResponse = serde_json::from_str(&body)
            .map_err(|e| ActuatorError::RequestFailed(format!("{} (body: {})", e, body)))?;

        if parsed.status_code != SWITCH_BOT_SUCCESS {
            return Err(ActuatorError::Rejected(format!(
                "statusCode {}: {}",
                parsed.status_code, parsed.message
            )));
        }

        info!("Unlock command accepted by device {}", device_id);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn respond_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            let mut buf = [0u8; 2048];
            // Request body is a small JSON object; stop once it is complete
            while !String::from_utf8_lossy(&data).contains("\"commandType\":\"command\"}") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&data).into_owned()
        });

        (base, handle)
    }

    fn actuator() -> SwitchBotActuator {
        SwitchBotActuator::new("token", "secret", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_signature_matches_reference_vector() {
        let sign = actuator().sign(1_700_000_000_000, "nonce-1").unwrap();
        assert_eq!(sign, "5Z4rSU2ZX0xJU6pn+C+vXd3lDzQkXX8iwCP4OLgST4I=");
    }

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_string(&CommandRequest {
            command: UNLOCK_COMMAND,
            parameter: "default",
            command_type: "command",
        })
        .unwrap();

        assert_eq!(
            body,
            r#"{"command":"turnOn","parameter":"default","commandType":"command"}"#
        );
    }

    #[tokio::test]
    async fn test_control_sends_signed_command() {
        let (base, server) = respond_once(r#"{"statusCode":100,"body":{},"message":"success"}"#).await;
        let actuator = actuator().with_base_url(base);

        let response = actuator.control("C0FFEE", UNLOCK_COMMAND).await.unwrap();
        assert!(response.contains("success"));

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /v1.1/devices/c0ffee/commands"));
        assert!(request.contains("authorization: token"));
        assert!(request.contains("\r\nsign: "));
        assert!(request.contains("\r\nnonce: "));
        assert!(request.contains("\r\nt: "));
    }

    #[tokio::test]
    async fn test_non_success_status_code_is_rejected() {
        let (base, server) = respond_once(r#"{"statusCode":161,"body":{},"message":"device offline"}"#).await;
        let actuator = actuator().with_base_url(base);

        let result = actuator.control("C0FFEE", UNLOCK_COMMAND).await;
        match result {
            Err(ActuatorError::Rejected(message)) => assert!(message.contains("device offline")),
            other => panic!("Expected Rejected, got {:?}", other),
        }
        server.await.unwrap();
    }
}
