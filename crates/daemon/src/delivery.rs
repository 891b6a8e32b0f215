//! Delivery of finished artifacts to the chat channel
//!
//! A missing destination is terminal right away; transport failures are retried a bounded
//! number of times with a fixed delay.

use crate::config::Config;
use crate::jobs::Destination;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from a single send
#[derive(Debug, Error)]
pub enum SinkError {
    /// The channel does not exist or the bot cannot see it
    #[error("unknown channel {0}")]
    UnknownChannel(u64),

    #[error("chat API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No bot token configured
    #[error("chat sink not configured")]
    NotConfigured,
}

impl SinkError {
    /// Errors that another attempt cannot fix.
    fn is_permanent(&self) -> bool {
        matches!(self, SinkError::UnknownChannel(_) | SinkError::NotConfigured)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// No destination was bound, or it cannot be resolved
    #[error("chat channel unavailable")]
    ChannelUnavailable,

    #[error("delivery failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: SinkError,
    },
}

/// Something that can post a video file to a chat channel
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send_video(&self, channel_id: u64, content: &str, artifact: &Path) -> Result<(), SinkError>;
}

/// Discord REST API sink (`POST /channels/{id}/messages`)
#[derive(Debug, Clone)]
pub struct DiscordSink {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl DiscordSink {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            token,
        }
    }

    pub fn from_config(client: reqwest::Client, cfg: &Config) -> Self {
        Self::new(client, cfg.delivery.api_base.clone(), cfg.delivery.bot_token.clone())
    }
}

#[async_trait]
impl ChatSink for DiscordSink {
    async fn send_video(&self, channel_id: u64, content: &str, artifact: &Path) -> Result<(), SinkError> {
        let token = self.token.as_deref().ok_or(SinkError::NotConfigured)?;
        let bytes = tokio::fs::read(artifact).await?;
        let file_name = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("video.mp4")
            .to_string();

        let payload = serde_json::json!({ "content": content }).to_string();
        let file = Part::bytes(bytes).file_name(file_name).mime_str("video/mp4")?;
        let form = Form::new()
            .part("payload_json", Part::text(payload).mime_str("application/json")?)
            .part("files[0]", file);

        let url = format!(
            "{}/channels/{}/messages",
            self.api_base.trim_end_matches('/'),
            channel_id
        );
        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", token))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SinkError::UnknownChannel(channel_id));
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Posts artifacts with bounded retry
#[derive(Clone)]
pub struct DeliveryService {
    sink: Arc<dyn ChatSink>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl DeliveryService {
    pub fn new(sink: Arc<dyn ChatSink>, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            sink,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(sink: Arc<dyn ChatSink>, cfg: &Config) -> Self {
        Self::new(
            sink,
            cfg.delivery.max_attempts,
            Duration::from_millis(cfg.delivery.retry_delay_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Send `artifact` to `destination`; returns the number of attempts used.
    pub async fn deliver(
        &self,
        destination: Option<&Destination>,
        artifact: &Path,
    ) -> Result<u32, DeliveryError> {
        let destination = destination.ok_or(DeliveryError::ChannelUnavailable)?;
        let content = format!("Video from {}", destination.display_user());

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .sink
                .send_video(destination.channel_id, &content, artifact)
                .await
            {
                Ok(()) => {
                    tracing::info!(channel_id = destination.channel_id, attempt, "artifact delivered");
                    return Ok(attempt);
                }
                Err(e) if e.is_permanent() => {
                    tracing::warn!(channel_id = destination.channel_id, error = %e, "destination unusable");
                    return Err(DeliveryError::ChannelUnavailable);
                }
                Err(e) => {
                    if attempt >= self.max_attempts {
                        return Err(DeliveryError::Exhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    tracing::warn!(
                        channel_id = destination.channel_id,
                        attempt,
                        error = %e,
                        delay_ms = self.retry_delay.as_millis() as u64,
                        "delivery failed; retrying"
                    );
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
    }
}
