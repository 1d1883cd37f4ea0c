//! Per-job execution workspaces.
//!
//! Each job owns a pair of directories under the configured root:
//! `<root>/<task_id>/input` for staged contract files and
//! `<root>/<task_id>/output` for container-produced artifacts. The root
//! sits on a filesystem both the orchestrator and the container backend
//! can see: local disk bind-mounted for Docker, a cluster-shared volume
//! for Kubernetes.
//!
//! Workspaces are keyed by task id, so two concurrent jobs never share
//! one. `release` is idempotent and tolerates partially created
//! workspaces.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors that can occur while managing workspaces.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to create workspace directory {path}: {source}")]
    CreateFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to remove workspace directory {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The directory pair for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkspace {
    pub task_id: Uuid,
    pub input_root: PathBuf,
    pub output_root: PathBuf,
}

impl JobWorkspace {
    /// The workspace's top-level directory (parent of both roots).
    pub fn root(&self) -> &Path {
        // input_root is always <root>/<task_id>/input.
        self.input_root.parent().unwrap_or(&self.input_root)
    }
}

/// Allocates and releases per-job workspaces under a fixed root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    preserve: bool,
}

impl WorkspaceManager {
    /// Creates a manager over the given root directory.
    ///
    /// With `preserve` set, `release` leaves directories on disk, for
    /// post-mortem inspection of contract files and container outputs.
    pub fn new(root: impl Into<PathBuf>, preserve: bool) -> Self {
        Self {
            root: root.into(),
            preserve,
        }
    }

    /// Returns the workspace root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the input/output directory pair for a task.
    pub async fn allocate(&self, task_id: Uuid) -> Result<JobWorkspace, WorkspaceError> {
        let base = self.root.join(task_id.to_string());
        let input_root = base.join("input");
        let output_root = base.join("output");

        for dir in [&input_root, &output_root] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| WorkspaceError::CreateFailed {
                    path: dir.clone(),
                    source: e,
                })?;
        }

        debug!(task_id = %task_id, path = %base.display(), "Allocated workspace");

        Ok(JobWorkspace {
            task_id,
            input_root,
            output_root,
        })
    }

    /// Removes a task's workspace. Idempotent: releasing a workspace
    /// that never existed, or was already released, is a no-op.
    pub async fn release(&self, task_id: Uuid) -> Result<(), WorkspaceError> {
        let base = self.root.join(task_id.to_string());

        if self.preserve {
            debug!(task_id = %task_id, path = %base.display(), "Preserving workspace");
            return Ok(());
        }

        match tokio::fs::remove_dir_all(&base).await {
            Ok(()) => {
                debug!(task_id = %task_id, "Released workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to release workspace");
                Err(WorkspaceError::RemoveFailed {
                    path: base,
                    source: e,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_creates_directory_pair() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path(), false);
        let task_id = Uuid::new_v4();

        let ws = manager.allocate(task_id).await.unwrap();

        assert!(ws.input_root.is_dir());
        assert!(ws.output_root.is_dir());
        assert_eq!(ws.root(), dir.path().join(task_id.to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_jobs_get_distinct_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path(), false);

        let a = manager.allocate(Uuid::new_v4()).await.unwrap();
        let b = manager.allocate(Uuid::new_v4()).await.unwrap();

        assert_ne!(a.input_root, b.input_root);
        assert_ne!(a.output_root, b.output_root);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path(), false);
        let task_id = Uuid::new_v4();

        manager.allocate(task_id).await.unwrap();
        manager.release(task_id).await.unwrap();
        // Second release of the same workspace is a no-op, not an error.
        manager.release(task_id).await.unwrap();
        // As is releasing a workspace that never existed.
        manager.release(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_removes_contents() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path(), false);
        let task_id = Uuid::new_v4();

        let ws = manager.allocate(task_id).await.unwrap();
        tokio::fs::write(ws.input_root.join("params.json"), b"{}")
            .await
            .unwrap();

        manager.release(task_id).await.unwrap();
        assert!(!ws.input_root.exists());
    }

    #[tokio::test]
    async fn test_preserve_keeps_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path(), true);
        let task_id = Uuid::new_v4();

        let ws = manager.allocate(task_id).await.unwrap();
        manager.release(task_id).await.unwrap();

        assert!(ws.input_root.is_dir());
    }
}
