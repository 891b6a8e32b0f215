//! Job model: identity, delivery destination and pipeline state.

use crate::workspace::Workspace;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where a finished artifact is posted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub channel_id: u64,
    /// Display name of the user who asked for the upload link
    pub user_label: Option<String>,
}

impl Destination {
    pub fn new(channel_id: u64, user_label: impl Into<String>) -> Self {
        Self {
            channel_id,
            user_label: Some(user_label.into()),
        }
    }

    /// The user label, or a placeholder when the binding carried none.
    pub fn display_user(&self) -> &str {
        self.user_label.as_deref().unwrap_or("unknown user")
    }
}

/// Stage of a job in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Admitted,
    Dispatching,
    /// Handed to the remote worker; the callback finishes it
    RemoteInFlight,
    LocalQueued,
    LocalEncoding,
    Delivering,
    Delivered,
    Failed(String),
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Admitted => "admitted",
            JobState::Dispatching => "dispatching",
            JobState::RemoteInFlight => "remote_in_flight",
            JobState::LocalQueued => "local_queued",
            JobState::LocalEncoding => "local_encoding",
            JobState::Delivering => "delivering",
            JobState::Delivered => "delivered",
            JobState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Delivered | JobState::Failed(_))
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// Any non-terminal state may fail; terminal states are final.
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Delivered, _) | (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Admitted, Dispatching) => true,
            (Dispatching, RemoteInFlight) | (Dispatching, LocalQueued) => true,
            (RemoteInFlight, Delivering) => true,
            (LocalQueued, LocalEncoding) => true,
            (LocalEncoding, Delivering) => true,
            (Delivering, Delivered) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// The unit of work: one uploaded video.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    /// Lower-cased extension of the uploaded file name
    pub source_extension: String,
    pub workspace: Workspace,
    /// Captured once at admission
    pub destination: Option<Destination>,
    state: JobState,
}

impl Job {
    pub fn new(
        id: String,
        source_extension: String,
        workspace: Workspace,
        destination: Option<Destination>,
    ) -> Self {
        Self {
            id,
            source_extension,
            workspace,
            destination,
            state: JobState::Admitted,
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Move to `next`, ignoring (and logging) illegal transitions.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(&next) {
            tracing::warn!(job_id = %self.id, from = %self.state, to = %next, "illegal job transition");
            return false;
        }
        tracing::debug!(job_id = %self.id, from = %self.state, to = %next, "job transition");
        self.state = next;
        true
    }

    pub fn source_path(&self) -> PathBuf {
        self.workspace.source_path(&self.source_extension)
    }
}

/// Fresh opaque job identifier (32 hex chars, safe as a directory name).
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Lower-cased extension of an uploaded file name.
///
/// Returns `"bin"` when the name has no usable extension; only ASCII alphanumerics are kept
/// so the result is always safe inside a file name.
pub fn source_extension(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;

    #[test]
    fn test_job_id_is_unique_hex() {
        let a = new_job_id();
        let b = new_job_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_source_extension() {
        assert_eq!(source_extension(Some("IMG_0001.MOV")), "mov");
        assert_eq!(source_extension(Some("clip.final.mp4")), "mp4");
        assert_eq!(source_extension(Some("noext")), "bin");
        assert_eq!(source_extension(Some("weird.m p4")), "bin");
        assert_eq!(source_extension(None), "bin");
    }

    #[test]
    fn test_local_happy_path_transitions() {
        let root = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(root.path()).acquire("j").unwrap();
        let mut job = Job::new("j".into(), "mp4".into(), ws, None);

        assert!(job.transition(JobState::Dispatching));
        assert!(job.transition(JobState::LocalQueued));
        assert!(job.transition(JobState::LocalEncoding));
        assert!(job.transition(JobState::Delivering));
        assert!(job.transition(JobState::Delivered));
        assert!(job.state().is_terminal());
        assert!(!job.transition(JobState::Failed("late".into())));
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        assert!(!JobState::Admitted.can_transition_to(&JobState::LocalEncoding));
        assert!(!JobState::RemoteInFlight.can_transition_to(&JobState::LocalQueued));
        assert!(!JobState::Failed("x".into()).can_transition_to(&JobState::Delivering));
        assert!(JobState::LocalEncoding.can_transition_to(&JobState::Failed("boom".into())));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(JobState::LocalQueued.to_string(), "local_queued");
        assert_eq!(JobState::Failed("no channel".into()).to_string(), "failed: no channel");
    }

    #[test]
    fn test_destination_display_user() {
        assert_eq!(Destination::new(1, "alice").display_user(), "alice");
        let anon = Destination {
            channel_id: 1,
            user_label: None,
        };
        assert_eq!(anon.display_user(), "unknown user");
    }
}
