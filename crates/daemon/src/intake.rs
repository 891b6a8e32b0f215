//! Job admission
//!
//! An upload becomes a job in two steps: [`Intake::begin`] allocates the workspace and
//! captures the current destination binding, the caller streams the source into
//! [`Job::source_path`], and [`Intake::finish`] hands the job to the dispatcher.

use crate::dispatch::{DispatchArbiter, Dispatched};
use crate::jobs::{new_job_id, source_extension, Destination, Job};
use crate::workspace::{WorkspaceError, WorkspaceManager};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("{0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Failed to store upload: {0}")]
    Io(#[from] std::io::Error),
}

/// The chat channel and user that most recently asked for the upload link
#[derive(Debug, Default)]
pub struct DestinationBinding {
    current: RwLock<Option<Destination>>,
}

impl DestinationBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bind(&self, destination: Destination) {
        tracing::info!(
            channel_id = destination.channel_id,
            user = destination.display_user(),
            "destination rebound"
        );
        *self.current.write().await = Some(destination);
    }

    /// Snapshot of the binding; later rebinds do not affect the returned value.
    pub async fn current(&self) -> Option<Destination> {
        self.current.read().await.clone()
    }
}

/// Outcome of a successful admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub job_id: String,
    pub dispatched: Dispatched,
    /// Jobs waiting on the local queue after this one was placed
    pub queue_depth: usize,
}

pub struct Intake {
    workspaces: WorkspaceManager,
    arbiter: Arc<DispatchArbiter>,
    binding: Arc<DestinationBinding>,
}

impl Intake {
    pub fn new(
        workspaces: WorkspaceManager,
        arbiter: Arc<DispatchArbiter>,
        binding: Arc<DestinationBinding>,
    ) -> Self {
        Self {
            workspaces,
            arbiter,
            binding,
        }
    }

    pub fn arbiter(&self) -> &DispatchArbiter {
        &self.arbiter
    }

    /// Allocate a job for an upload named `file_name`.
    pub async fn begin(&self, file_name: Option<&str>) -> Result<Job, IntakeError> {
        let id = new_job_id();
        let workspace = self.workspaces.acquire(&id)?;
        let destination = self.binding.current().await;
        let job = Job::new(id, source_extension(file_name), workspace, destination);
        tracing::info!(
            job_id = %job.id,
            ext = %job.source_extension,
            bound = job.destination.is_some(),
            "job admitted"
        );
        Ok(job)
    }

    /// Dispatch a job whose source has been written.
    pub async fn finish(&self, job: Job) -> Admission {
        let job_id = job.id.clone();
        let dispatched = self.arbiter.dispatch(job).await;
        Admission {
            job_id,
            dispatched,
            queue_depth: self.arbiter.queue().depth(),
        }
    }

    /// Admit an upload already held in memory.
    pub async fn admit_bytes(&self, file_name: Option<&str>, bytes: &[u8]) -> Result<Admission, IntakeError> {
        let job = self.begin(file_name).await?;
        let mut file = tokio::fs::File::create(job.source_path()).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(self.finish(job).await)
    }
}
