//! Docker backend for the container runner, using the bollard crate.
//!
//! Containers run detached with the workspace's input and output
//! directories bind-mounted, no network, and hard resource limits.
//! Custom algorithm images arrive as gzipped `docker save` tarballs and
//! are loaded through the image-load endpoint.

use std::io::Read;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::{CreateImageOptions, ImportImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ContainerJob, ContainerRunner, RunHandle, RunOutcome, RunnerError};

/// Docker-daemon-backed `ContainerRunner`.
pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    /// Connects to the local Docker daemon.
    pub fn new() -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RunnerError::BackendUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self { docker })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    async fn pull_image(&self, image: &str) -> Result<(), RunnerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| RunnerError::ImageUnavailable {
                image: image.to_string(),
                reason: format!("Pull failed: {e}"),
            })?;
        }

        info!(image = %image, "Pulled image");
        Ok(())
    }

    async fn load_tarball(&self, image: &str, tarball: &[u8]) -> Result<(), RunnerError> {
        let tags = tarball_repo_tags(tarball).map_err(|e| RunnerError::ImageUnavailable {
            image: image.to_string(),
            reason: format!("Unreadable image tarball: {e}"),
        })?;
        if !tags.iter().any(|t| t == image) {
            return Err(RunnerError::ImageUnavailable {
                image: image.to_string(),
                reason: format!("Tarball carries tags {tags:?}, not the requested image"),
            });
        }

        // The load endpoint accepts gzipped tarballs as-is.
        let body = bytes::Bytes::copy_from_slice(tarball);
        let options = ImportImageOptions { quiet: true };

        let mut stream = self.docker.import_image(options, body, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| RunnerError::ImageUnavailable {
                image: image.to_string(),
                reason: format!("Load failed: {e}"),
            })?;
        }

        info!(image = %image, "Loaded image from tarball");
        Ok(())
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn ensure_image(&self, image: &str, tarball: Option<&[u8]>) -> Result<(), RunnerError> {
        if self.image_exists(image).await {
            return Ok(());
        }
        match tarball {
            Some(data) => self.load_tarball(image, data).await,
            None => self.pull_image(image).await,
        }
    }

    async fn launch(&self, job: &ContainerJob) -> Result<RunHandle, RunnerError> {
        let binds = vec![
            format!("{}:{}", job.input_host_path.display(), job.input_mount),
            format!("{}:{}", job.output_host_path.display(), job.output_mount),
        ];

        let host_config = HostConfig {
            memory: Some(job.limits.memory_bytes()),
            cpu_period: Some(job.limits.cpu_period()),
            cpu_quota: Some(job.limits.cpu_quota()),
            pids_limit: Some(job.limits.max_processes as i64),
            network_mode: Some("none".to_string()),
            binds: Some(binds),
            ..Default::default()
        };

        let env: Vec<String> = job
            .env
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();

        let config = Config {
            image: Some(job.image.clone()),
            cmd: Some(job.command.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            host_config: Some(host_config),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: job.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RunnerError::LaunchFailed(format!("Failed to create container: {e}")))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RunnerError::LaunchFailed(format!("Failed to start container: {e}")))?;

        debug!(container = %response.id, image = %job.image, "Started container");
        Ok(RunHandle::new(response.id))
    }

    async fn wait(&self, handle: &RunHandle) -> Result<RunOutcome, RunnerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(&handle.id, Some(options));
        let mut exit_code = None;
        if let Some(result) = stream.next().await {
            match result {
                Ok(response) => exit_code = Some(response.status_code),
                // The daemon reports nonzero exits through the error
                // channel on some API versions; the inspect below is
                // authoritative either way.
                Err(e) => debug!(container = %handle.id, error = %e, "Wait ended with error"),
            }
        }

        let info = self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RunnerError::WaitFailed(format!("Failed to inspect container: {e}")))?;

        let state = info
            .state
            .ok_or_else(|| RunnerError::WaitFailed("Container has no state".to_string()))?;

        Ok(RunOutcome {
            exit_code: exit_code.or(state.exit_code).unwrap_or(-1),
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn terminate(&self, handle: &RunHandle) -> Result<(), RunnerError> {
        let options = StopContainerOptions { t: 10 };
        match self.docker.stop_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already gone or already stopped counts as terminated.
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) if e.to_string().contains("not running") => Ok(()),
            Err(e) => Err(RunnerError::TerminateFailed(e.to_string())),
        }
    }

    async fn logs(&self, handle: &RunHandle) -> Result<String, RunnerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut stream = self.docker.logs(&handle.id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(RunnerError::LogsFailed(e.to_string())),
            }
        }

        Ok(output)
    }

    async fn remove(&self, handle: &RunHandle) -> Result<(), RunnerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => {
                warn!(container = %handle.id, error = %e, "Failed to remove container");
                Err(RunnerError::TerminateFailed(e.to_string()))
            }
        }
    }
}

#[derive(Deserialize)]
struct ManifestEntry {
    #[serde(rename = "RepoTags")]
    repo_tags: Option<Vec<String>>,
}

/// Reads the repo tags out of a gzipped `docker save` tarball's
/// manifest without loading the image.
pub fn tarball_repo_tags(data: &[u8]) -> std::io::Result<Vec<String>> {
    let gz = flate2::read::GzDecoder::new(data);
    let mut archive = tar::Archive::new(gz);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == std::path::Path::new("manifest.json") {
            let mut raw = String::new();
            entry.read_to_string(&mut raw)?;
            let manifest: Vec<ManifestEntry> = serde_json::from_str(&raw)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            return Ok(manifest
                .into_iter()
                .flat_map(|m| m.repo_tags.unwrap_or_default())
                .collect());
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "tarball has no manifest.json",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn image_tarball(tags: &[&str]) -> Vec<u8> {
        let manifest = serde_json::json!([{
            "Config": "abc.json",
            "RepoTags": tags,
            "Layers": ["layer.tar"],
        }]);
        let manifest = serde_json::to_vec(&manifest).unwrap();

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        let mut header = tar::Header::new_gnu();
        header.set_path("manifest.json").unwrap();
        header.set_size(manifest.len() as u64);
        header.set_cksum();
        builder.append(&header, manifest.as_slice()).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_tarball_repo_tags() {
        let data = image_tarball(&["acme/custom-tree:3"]);
        let tags = tarball_repo_tags(&data).unwrap();
        assert_eq!(tags, vec!["acme/custom-tree:3".to_string()]);
    }

    #[test]
    fn test_tarball_without_manifest() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        let mut header = tar::Header::new_gnu();
        header.set_path("layer.tar").unwrap();
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, &[] as &[u8]).unwrap();
        let data = builder.into_inner().unwrap().finish().unwrap();

        assert!(tarball_repo_tags(&data).is_err());
    }

    #[test]
    fn test_garbage_tarball() {
        assert!(tarball_repo_tags(b"not a tarball").is_err());
    }
}
