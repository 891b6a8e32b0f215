//! Failure reporting to the operator webhook
//!
//! Reporting is best-effort: the reporter never returns an error to its caller.

use crate::config::Config;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Webhook message bodies are capped at this many characters
const MAX_CONTENT_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("webhook returned {0}")]
    Status(u16),
}

/// Destination for operator alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn post(&self, content: &str, attachment: Option<(String, Vec<u8>)>) -> Result<(), ReportError>;
}

/// Posts `content` (and an optional `file`) as multipart to a webhook URL
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn post(&self, content: &str, attachment: Option<(String, Vec<u8>)>) -> Result<(), ReportError> {
        let mut form = Form::new().text("content", content.to_string());
        if let Some((name, bytes)) = attachment {
            form = form.part("file", Part::bytes(bytes).file_name(name));
        }

        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ReportError::Status(status.as_u16()))
        }
    }
}

#[derive(Clone, Default)]
pub struct FailureReporter {
    sink: Option<Arc<dyn AlertSink>>,
}

impl FailureReporter {
    pub fn new(sink: Option<Arc<dyn AlertSink>>) -> Self {
        Self { sink }
    }

    /// Webhook reporter if `alert.webhook_url` is set, log-only otherwise.
    pub fn from_config(client: reqwest::Client, cfg: &Config) -> Self {
        let sink = cfg
            .alert
            .webhook_url
            .as_ref()
            .map(|url| Arc::new(WebhookAlertSink::new(client, url.clone())) as Arc<dyn AlertSink>);
        Self::new(sink)
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Report a terminal job failure, attaching the encoder log when one exists.
    pub async fn report(&self, job_id: &str, error: &(dyn Display + Sync), log_path: Option<&Path>) {
        tracing::error!(job_id, error = %error, "job failed");

        let Some(sink) = &self.sink else {
            return;
        };

        let content = failure_message(job_id, error);
        let attachment = match log_path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => Some((log_file_name(path), bytes)),
                Err(e) => {
                    tracing::debug!(job_id, path = %path.display(), error = %e, "no log to attach");
                    None
                }
            },
            None => None,
        };

        if let Err(e) = sink.post(&content, attachment).await {
            tracing::warn!(job_id, error = %e, "failed to post failure report");
        }
    }
}

/// `[upload failed] job <id>: <error>`, truncated to the webhook content limit.
pub fn failure_message(job_id: &str, error: &(dyn Display + Sync)) -> String {
    let message = format!("[upload failed] job {}: {}", job_id, error);
    if message.chars().count() <= MAX_CONTENT_CHARS {
        return message;
    }
    message.chars().take(MAX_CONTENT_CHARS).collect()
}

fn log_file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("error.log")
        .to_string()
}
