//! Remote-or-local dispatch
//!
//! Each admitted job is offered to the remote worker once. Anything short of an HTTP 202
//! sends it to the local queue instead; an accepted job is never queued locally. A job with
//! no destination fails here and never reaches either.

use crate::config::Config;
use crate::delivery::DeliveryError;
use crate::jobs::{Destination, Job, JobState};
use crate::metrics::SharedMetrics;
use crate::queue::JobQueue;
use crate::report::FailureReporter;
use crate::workspace::WorkspaceManager;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tokio_util::io::ReaderStream;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Connection refused, timeout or unreadable source
    #[error("remote worker unavailable: {0}")]
    Unavailable(String),

    #[error("remote worker rejected job with status {0}")]
    Rejected(u16),
}

/// An external machine that can take over a job
#[async_trait]
pub trait RemoteWorker: Send + Sync {
    async fn submit(&self, job_id: &str, source: &Path, ext: &str) -> Result<(), DispatchError>;
}

/// Posts the source as multipart (`file`, `job_id`, `ext`) to `{base}/jobs`
#[derive(Debug, Clone)]
pub struct HttpRemoteWorker {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRemoteWorker {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// `None` when no remote worker URL is configured.
    pub fn from_config(client: reqwest::Client, cfg: &Config) -> Option<Self> {
        cfg.remote.worker_url.as_ref().map(|url| {
            Self::new(
                client,
                url.clone(),
                Duration::from_millis(cfg.remote.timeout_ms),
            )
        })
    }
}

#[async_trait]
impl RemoteWorker for HttpRemoteWorker {
    async fn submit(&self, job_id: &str, source: &Path, ext: &str) -> Result<(), DispatchError> {
        let unreadable = |e: std::io::Error| DispatchError::Unavailable(format!("cannot read source: {}", e));
        let file = tokio::fs::File::open(source).await.map_err(unreadable)?;
        let len = file.metadata().await.map_err(unreadable)?.len();
        // Streamed from disk; uploads can be far larger than available memory
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let file_name = format!("input.{}", ext);
        let form = Form::new()
            .part("file", Part::stream_with_length(body, len).file_name(file_name))
            .text("job_id", job_id.to_string())
            .text("ext", ext.to_string());

        let url = format!("{}/jobs", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::ACCEPTED => Ok(()),
            status => Err(DispatchError::Rejected(status.as_u16())),
        }
    }
}

/// A job the remote worker accepted and has not called back for yet
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJob {
    pub destination: Option<Destination>,
    pub dispatched_at: Instant,
}

/// Remote jobs awaiting their callback, keyed by job id
#[derive(Debug, Clone, Default)]
pub struct PendingRemote {
    inner: Arc<Mutex<HashMap<String, PendingJob>>>,
}

impl PendingRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job_id: String, destination: Option<Destination>) {
        self.inner.lock().await.insert(
            job_id,
            PendingJob {
                destination,
                dispatched_at: Instant::now(),
            },
        );
    }

    /// Remove and return the entry; a second callback for the same id finds nothing.
    pub async fn take(&self, job_id: &str) -> Option<PendingJob> {
        self.inner.lock().await.remove(job_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Remove and return every entry dispatched more than `max_age` ago.
    pub async fn expire(&self, max_age: Duration) -> Vec<(String, PendingJob)> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, job)| job.dispatched_at.elapsed() > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| inner.remove(&id).map(|job| (id, job)))
            .collect()
    }
}

#[derive(Debug, Error)]
#[error("remote worker did not call back within {}s", .0.as_secs())]
pub struct CallbackTimeout(pub Duration);

/// Fail pending remote jobs whose callback never arrived.
///
/// Returns the number of jobs expired.
pub async fn expire_stale_remote_jobs(
    pending: &PendingRemote,
    max_age: Duration,
    reporter: &FailureReporter,
    metrics: &SharedMetrics,
) -> usize {
    let expired = pending.expire(max_age).await;
    for (job_id, _) in &expired {
        reporter.report(job_id, &CallbackTimeout(max_age), None).await;
    }
    if !expired.is_empty() {
        metrics.write().await.failed_jobs += expired.len() as u64;
    }
    expired.len()
}

/// Where a job ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Remote,
    /// 1-based position in the local queue
    Local { position: usize },
    /// Failed before dispatch (no destination bound)
    Failed,
}

pub struct DispatchArbiter {
    remote: Option<Arc<dyn RemoteWorker>>,
    queue: JobQueue,
    pending: PendingRemote,
    workspaces: WorkspaceManager,
    reporter: FailureReporter,
    metrics: SharedMetrics,
}

impl DispatchArbiter {
    pub fn new(
        remote: Option<Arc<dyn RemoteWorker>>,
        queue: JobQueue,
        pending: PendingRemote,
        workspaces: WorkspaceManager,
        reporter: FailureReporter,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            remote,
            queue,
            pending,
            workspaces,
            reporter,
            metrics,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn pending(&self) -> &PendingRemote {
        &self.pending
    }

    /// Decide once where `job` runs.
    pub async fn dispatch(&self, mut job: Job) -> Dispatched {
        job.transition(JobState::Dispatching);

        if job.destination.is_none() {
            let error = DeliveryError::ChannelUnavailable;
            self.reporter.report(&job.id, &error, None).await;
            job.transition(JobState::Failed(error.to_string()));
            self.workspaces.release(&mut job.workspace);
            self.metrics.write().await.failed_jobs += 1;
            return Dispatched::Failed;
        }

        if let Some(remote) = &self.remote {
            match remote
                .submit(&job.id, &job.source_path(), &job.source_extension)
                .await
            {
                Ok(()) => {
                    job.transition(JobState::RemoteInFlight);
                    self.pending
                        .insert(job.id.clone(), job.destination.clone())
                        .await;
                    // The remote worker has its own copy of the source
                    self.workspaces.release(&mut job.workspace);
                    self.metrics.write().await.remote_jobs += 1;
                    tracing::info!(job_id = %job.id, "job accepted by remote worker");
                    return Dispatched::Remote;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "remote dispatch failed; queueing locally");
                }
            }
        }

        job.transition(JobState::LocalQueued);
        let job_id = job.id.clone();
        let position = self.queue.enqueue(job);
        tracing::info!(job_id = %job_id, position, "job queued locally");
        Dispatched::Local { position }
    }
}
