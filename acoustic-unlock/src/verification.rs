//! Phrase verification client
//!
//! Two call shapes against the same endpoint: a lightweight probe with an
//! empty body, and a full check that uploads the recorded clip as the
//! multipart field `file`. The response body must be JSON carrying a boolean
//! `phrase_authorized`; anything else is a protocol error, never a denial.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Name of the multipart field carrying the clip
pub const CLIP_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Verification transport error: {0}")]
    Transport(String),

    #[error("Verification protocol error: {0}")]
    Protocol(String),

    #[error("Failed to read clip {}: {source}", path.display())]
    ClipUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Authorization decision returned by the verification endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VerificationResult {
    #[serde(rename = "phrase_authorized")]
    pub authorized: bool,
}

impl VerificationResult {
    pub fn authorized() -> Self {
        Self { authorized: true }
    }

    pub fn denied() -> Self {
        Self { authorized: false }
    }
}

/// Remote phrase verification
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VerificationClient: Send + Sync {
    /// Lightweight check without audio
    async fn verify(&self) -> Result<VerificationResult, VerificationError>;

    /// Full check uploading the clip at `path`
    async fn verify_with_clip(&self, path: &Path) -> Result<VerificationResult, VerificationError>;
}

/// Parse a verification response body
pub fn parse_response(body: &str) -> Result<VerificationResult, VerificationError> {
    serde_json::from_str(body)
        .map_err(|e| VerificationError::Protocol(format!("{} (body: {})", e, body.trim())))
}

/// HTTP implementation of [`VerificationClient`]
pub struct HttpVerificationClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVerificationClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, VerificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerificationError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn decode(response: reqwest::Response) -> Result<VerificationResult, VerificationError> {
        let status = response.status();
        if !status.is_success() {
            return Err(VerificationError::Transport(format!(
                "verification endpoint returned {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| VerificationError::Transport(e.to_string()))?;

        debug!("Verification response: {}", body.trim());
        parse_response(&body)
    }
}

#[async_trait]
impl VerificationClient for HttpVerificationClient {
    async fn verify(&self) -> Result<VerificationResult, VerificationError> {
        info!("Requesting lightweight phrase verification");

        let response = self
            .client
            .post(&self.endpoint)
            .send()
            .await
            .map_err(|e| VerificationError::Transport(e.to_string()))?;

        Self::decode(response).await
    }

    async fn verify_with_clip(&self, path: &Path) -> Result<VerificationResult, VerificationError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| VerificationError::ClipUnreadable {
                path: path.to_path_buf(),
                source,
            })?;

        info!("Uploading {} byte clip for phrase verification", bytes.len());

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "record.wav".to_string());

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/wav")
            .map_err(|e| VerificationError::Transport(e.to_string()))?;
        let form = Form::new().part(CLIP_FIELD, part);

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VerificationError::Transport(e.to_string()))?;

        Self::decode(response).await
    }
}
