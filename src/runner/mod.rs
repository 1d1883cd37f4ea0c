//! Container runner abstraction.
//!
//! The orchestrator drives every algorithm run through the
//! `ContainerRunner` trait: launch an image with the standard mounts
//! and environment, wait for it to exit, collect logs, tear it down.
//! Two backends live here: a local Docker daemon (via bollard) and a
//! Kubernetes batch Job backend. Which one a deployment uses is a
//! config decision; the orchestrator never branches on it.

pub mod docker;
pub mod kubernetes;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use docker::DockerRunner;
pub use kubernetes::{KubernetesConfig, KubernetesRunner};

/// Resource ceilings applied to every algorithm container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores (fractional allowed).
    pub cpu_cores: f64,
    /// Maximum number of processes.
    pub max_processes: u32,
    /// Wall-clock timeout in seconds. `None` means unbounded: training
    /// runs have highly variable durations, so there is no default.
    pub timeout_seconds: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_cores: 1.0,
            max_processes: 256,
            timeout_seconds: None,
        }
    }
}

impl ResourceLimits {
    pub fn new(memory_mb: u64, cpu_cores: f64, max_processes: u32) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            max_processes,
            timeout_seconds: None,
        }
    }

    /// Caps the run's wall-clock duration.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Memory limit in bytes, for the Docker API.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// CPU period in microseconds (100ms standard period).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// CPU quota in microseconds per period.
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_cores * 100_000.0) as i64
    }

    /// CPU limit in Kubernetes millicore notation.
    pub fn cpu_millis(&self) -> u64 {
        (self.cpu_cores * 1000.0) as u64
    }
}

/// Everything a backend needs to run one algorithm container.
#[derive(Debug, Clone)]
pub struct ContainerJob {
    /// Backend-visible name, unique per task.
    pub name: String,
    /// Image reference the container runs.
    pub image: String,
    /// The single command argument selecting the run mode
    /// ("train" or "predict").
    pub command: Vec<String>,
    /// Environment variables, name/value pairs.
    pub env: Vec<(String, String)>,
    /// Host (or shared-volume) path holding the staged inputs.
    pub input_host_path: PathBuf,
    /// Host (or shared-volume) path the container writes outputs to.
    pub output_host_path: PathBuf,
    /// Mount point for inputs inside the container.
    pub input_mount: String,
    /// Mount point for outputs inside the container.
    pub output_mount: String,
    pub limits: ResourceLimits,
}

/// Opaque reference to a launched container or job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub id: String,
}

impl RunHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// What a finished container run looked like from the outside.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i64,
    /// Whether the kernel (or kubelet) killed the container for
    /// exceeding its memory limit.
    pub oom_killed: bool,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.oom_killed
    }
}

/// Errors from a container backend.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Container backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Image '{image}' unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("Failed to launch container: {0}")]
    LaunchFailed(String),

    #[error("Failed while waiting for container: {0}")]
    WaitFailed(String),

    #[error("Failed to terminate container: {0}")]
    TerminateFailed(String),

    #[error("Failed to read container logs: {0}")]
    LogsFailed(String),
}

/// Backend-neutral container lifecycle.
///
/// `launch` and `wait` are separate so the orchestrator can race `wait`
/// against a stop signal and call `terminate` on the loser.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Makes sure the image is runnable on this backend: pulls it from
    /// a registry, or loads it from a gzipped image tarball when one is
    /// supplied.
    async fn ensure_image(&self, image: &str, tarball: Option<&[u8]>) -> Result<(), RunnerError>;

    /// Creates and starts the container. Does not wait.
    async fn launch(&self, job: &ContainerJob) -> Result<RunHandle, RunnerError>;

    /// Waits for the container to exit and reports how it went.
    async fn wait(&self, handle: &RunHandle) -> Result<RunOutcome, RunnerError>;

    /// Kills the container if it is still running. Idempotent.
    async fn terminate(&self, handle: &RunHandle) -> Result<(), RunnerError>;

    /// Collected stdout/stderr of the container.
    async fn logs(&self, handle: &RunHandle) -> Result<String, RunnerError>;

    /// Removes backend resources for a finished run. Idempotent.
    async fn remove(&self, handle: &RunHandle) -> Result<(), RunnerError>;
}

/// Last `n` lines of a log stream, for failure details.
pub fn log_tail(logs: &str, n: usize) -> String {
    let lines: Vec<&str> = logs.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_conversions() {
        let limits = ResourceLimits::new(2048, 1.5, 256);
        assert_eq!(limits.memory_bytes(), 2048 * 1024 * 1024);
        assert_eq!(limits.cpu_period(), 100_000);
        assert_eq!(limits.cpu_quota(), 150_000);
        assert_eq!(limits.cpu_millis(), 1500);

        assert_eq!(limits.timeout_seconds, None);
        assert_eq!(limits.with_timeout(600).timeout_seconds, Some(600));
    }

    #[test]
    fn test_outcome_success() {
        assert!(RunOutcome { exit_code: 0, oom_killed: false }.succeeded());
        assert!(!RunOutcome { exit_code: 1, oom_killed: false }.succeeded());
        // An OOM kill is a failure even if the exit code got lost.
        assert!(!RunOutcome { exit_code: 0, oom_killed: true }.succeeded());
    }

    #[test]
    fn test_log_tail() {
        let logs = "a\nb\nc\nd";
        assert_eq!(log_tail(logs, 2), "c\nd");
        assert_eq!(log_tail(logs, 10), "a\nb\nc\nd");
        assert_eq!(log_tail("", 5), "");
    }
}
