//! Deployment configuration for the orchestrator.
//!
//! Backend selection between the local Docker daemon and the Kubernetes
//! batch API is a deployment-time switch, not a per-job decision. All
//! knobs have sensible defaults and builder setters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which container backend executes jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerBackend {
    /// Local Docker daemon, workspace bind-mounted into the container.
    Docker,
    /// Kubernetes batch/v1 Jobs over a cluster-shared volume.
    Kubernetes,
}

impl std::fmt::Display for RunnerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerBackend::Docker => write!(f, "docker"),
            RunnerBackend::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Configuration for the job orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Container backend used for all jobs.
    pub backend: RunnerBackend,
    /// Maximum number of container launches in flight at once.
    pub max_concurrent_jobs: usize,
    /// Root directory under which per-job workspaces are allocated.
    /// Must be visible to the container backend (bind-mountable for
    /// Docker, on the shared volume for Kubernetes).
    pub workspace_root: PathBuf,
    /// Keep workspaces on disk after the job finishes instead of
    /// deleting them. For debugging.
    pub preserve_workspaces: bool,
    /// Paths at which the workspace roots appear inside the container.
    pub container_input_dir: String,
    /// See `container_input_dir`.
    pub container_output_dir: String,
    /// Image that executes built-in algorithms.
    pub builtin_image: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend: RunnerBackend::Docker,
            max_concurrent_jobs: 4,
            workspace_root: PathBuf::from("/var/lib/modelyard/workspaces"),
            preserve_workspaces: false,
            container_input_dir: "/job/input".to_string(),
            container_output_dir: "/job/output".to_string(),
            builtin_image: "modelyard/algorithm-runner:1".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration for the given backend.
    pub fn new(backend: RunnerBackend) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    /// Sets the concurrency limit for in-flight container launches.
    pub fn with_max_concurrent_jobs(mut self, limit: usize) -> Self {
        self.max_concurrent_jobs = limit;
        self
    }

    /// Sets the workspace root directory.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Keeps workspaces after job completion.
    pub fn with_preserve_workspaces(mut self, preserve: bool) -> Self {
        self.preserve_workspaces = preserve;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();

        assert_eq!(config.backend, RunnerBackend::Docker);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert!(!config.preserve_workspaces);
        assert_eq!(config.container_input_dir, "/job/input");
        assert_eq!(config.container_output_dir, "/job/output");
    }

    #[test]
    fn test_config_builder() {
        let config = OrchestratorConfig::new(RunnerBackend::Kubernetes)
            .with_max_concurrent_jobs(16)
            .with_workspace_root("/mnt/shared/jobs")
            .with_preserve_workspaces(true);

        assert_eq!(config.backend, RunnerBackend::Kubernetes);
        assert_eq!(config.max_concurrent_jobs, 16);
        assert_eq!(config.workspace_root, PathBuf::from("/mnt/shared/jobs"));
        assert!(config.preserve_workspaces);
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(RunnerBackend::Docker.to_string(), "docker");
        assert_eq!(RunnerBackend::Kubernetes.to_string(), "kubernetes");
    }
}
