//! Per-job workspace directories.
//!
//! Every job owns exactly one directory under the workspace root for its whole lifetime.
//! [`WorkspaceManager::release`] is the single teardown path; it is idempotent and never
//! fails, and [`Workspace`] releases itself on drop if a job task died before doing so.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const OUTPUT_FILE: &str = "output.mp4";
const TMP_FILE: &str = "tmp.mp4";
const LOG_FILE: &str = "error.log";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The directory could not be created (disk full, permissions)
    #[error("Failed to create workspace {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An exclusively owned job directory.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the uploaded source is stored, e.g. `input.mov`.
    pub fn source_path(&self, ext: &str) -> PathBuf {
        self.path.join(format!("input.{}", ext))
    }

    pub fn output_path(&self) -> PathBuf {
        self.path.join(OUTPUT_FILE)
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.path.join(TMP_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// The diagnostic log, if an encoder wrote one.
    pub fn existing_log(&self) -> Option<PathBuf> {
        let path = self.log_path();
        path.is_file().then_some(path)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            remove_tree(&self.path);
            self.released = true;
        }
    }
}

/// Allocates and destroys job workspaces under a root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create `<root>/<job_id>`.
    pub fn acquire(&self, job_id: &str) -> Result<Workspace, WorkspaceError> {
        let path = self.root.join(job_id);
        fs::create_dir_all(&path).map_err(|source| WorkspaceError::Create {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(job_id, path = %path.display(), "workspace acquired");
        Ok(Workspace {
            path,
            released: false,
        })
    }

    /// Create the root if needed and remove job directories left by a previous run.
    ///
    /// Returns the number of directories removed.
    pub fn prepare_root(&self) -> Result<usize, WorkspaceError> {
        fs::create_dir_all(&self.root).map_err(|source| WorkspaceError::Create {
            path: self.root.clone(),
            source,
        })?;
        let entries = fs::read_dir(&self.root).map_err(|source| WorkspaceError::Create {
            path: self.root.clone(),
            source,
        })?;

        let mut removed = 0;
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name();
            if is_dir && name.to_str().map(is_job_dir_name).unwrap_or(false) {
                remove_tree(&entry.path());
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, root = %self.root.display(), "removed stale workspaces");
        }
        Ok(removed)
    }

    /// Recursively remove the workspace. Safe to call more than once.
    pub fn release(&self, workspace: &mut Workspace) {
        if workspace.released {
            return;
        }
        remove_tree(&workspace.path);
        workspace.released = true;
        tracing::debug!(path = %workspace.path.display(), "workspace released");
    }
}

/// Job ids are 32 lowercase hex characters; nothing else under the root is touched.
fn is_job_dir_name(name: &str) -> bool {
    name.len() == 32 && name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

fn remove_tree(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove workspace");
        }
    }
}
