//! Kubernetes backend for the container runner.
//!
//! Each algorithm run becomes a batch/v1 Job with `backoffLimit: 0` and
//! `restartPolicy: Never` (a failed algorithm run is a task failure,
//! never retried at the cluster level). The workspace root is a shared
//! PersistentVolumeClaim; per-job input and output directories are
//! mounted via `subPath` so the pod sees exactly the same layout the
//! Docker backend bind-mounts.
//!
//! Talks straight to the API server over HTTPS with a bearer token.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{ContainerJob, ContainerRunner, RunHandle, RunOutcome, RunnerError};

/// Finished Jobs are garbage-collected by the cluster after this long.
const TTL_AFTER_FINISHED_SECONDS: u64 = 300;

/// Connection settings for the Kubernetes backend.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// API server base URL, e.g. `https://10.0.0.1:6443`.
    pub api_server: String,
    /// Namespace jobs are created in.
    pub namespace: String,
    /// Bearer token for the service account.
    pub token: Option<String>,
    /// Name of the PersistentVolumeClaim backing the workspace root.
    pub workspace_claim: String,
    /// Path where that claim is mounted on the orchestrator side; used
    /// to turn workspace paths into claim-relative subPaths.
    pub workspace_root: PathBuf,
    /// Accept self-signed API server certificates.
    pub insecure: bool,
    /// How often to poll job status while waiting.
    pub poll_interval: Duration,
}

impl KubernetesConfig {
    pub fn new(
        api_server: impl Into<String>,
        namespace: impl Into<String>,
        workspace_claim: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api_server: api_server.into(),
            namespace: namespace.into(),
            token: None,
            workspace_claim: workspace_claim.into(),
            workspace_root: workspace_root.into(),
            insecure: false,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

/// Kubernetes-batch-Job-backed `ContainerRunner`.
pub struct KubernetesRunner {
    client: reqwest::Client,
    config: KubernetesConfig,
}

impl KubernetesRunner {
    pub fn new(config: KubernetesConfig) -> Result<Self, RunnerError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| RunnerError::BackendUnavailable(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.api_server, path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn job_path(&self, name: &str) -> String {
        format!(
            "/apis/batch/v1/namespaces/{}/jobs/{}",
            self.config.namespace, name
        )
    }

    fn sub_path(&self, host_path: &Path) -> Result<String, RunnerError> {
        host_path
            .strip_prefix(&self.config.workspace_root)
            .map(|rel| rel.to_string_lossy().into_owned())
            .map_err(|_| {
                RunnerError::LaunchFailed(format!(
                    "Path {} is outside the workspace claim",
                    host_path.display()
                ))
            })
    }

    fn job_manifest(&self, job: &ContainerJob) -> Result<Value, RunnerError> {
        let env: Vec<Value> = job
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let mut manifest = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": job.name,
                "labels": { "app.kubernetes.io/managed-by": "modelyard" },
            },
            "spec": {
                "backoffLimit": 0,
                "ttlSecondsAfterFinished": TTL_AFTER_FINISHED_SECONDS,
                "template": {
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "algorithm",
                            "image": job.image,
                            "args": job.command,
                            "env": env,
                            "resources": {
                                "limits": {
                                    "memory": format!("{}Mi", job.limits.memory_mb),
                                    "cpu": format!("{}m", job.limits.cpu_millis()),
                                },
                            },
                            "volumeMounts": [
                                {
                                    "name": "workspace",
                                    "mountPath": job.input_mount,
                                    "subPath": self.sub_path(&job.input_host_path)?,
                                    "readOnly": true,
                                },
                                {
                                    "name": "workspace",
                                    "mountPath": job.output_mount,
                                    "subPath": self.sub_path(&job.output_host_path)?,
                                },
                            ],
                        }],
                        "volumes": [{
                            "name": "workspace",
                            "persistentVolumeClaim": { "claimName": self.config.workspace_claim },
                        }],
                    },
                },
            },
        });

        if let Some(seconds) = job.limits.timeout_seconds {
            manifest["spec"]["activeDeadlineSeconds"] = json!(seconds);
        }

        Ok(manifest)
    }

    async fn get_json(&self, path: &str) -> Result<Value, RunnerError> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| RunnerError::WaitFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RunnerError::WaitFailed(format!(
                "API server returned {} for {path}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RunnerError::WaitFailed(e.to_string()))
    }

    /// Name of the pod the job spawned, once one exists.
    async fn find_pod(&self, job_name: &str) -> Result<Option<String>, RunnerError> {
        let path = format!(
            "/api/v1/namespaces/{}/pods?labelSelector=job-name%3D{}",
            self.config.namespace, job_name
        );
        let pods = self.get_json(&path).await?;

        Ok(pods["items"]
            .as_array()
            .and_then(|items| items.first())
            .and_then(|pod| pod["metadata"]["name"].as_str())
            .map(String::from))
    }

    /// Terminated-container details from the job's pod: exit code plus
    /// whether the kubelet reported an OOM kill.
    async fn pod_outcome(&self, job_name: &str) -> Result<RunOutcome, RunnerError> {
        let Some(pod) = self.find_pod(job_name).await? else {
            // Pod already garbage-collected; all we know is the job
            // status that got us here.
            return Ok(RunOutcome {
                exit_code: -1,
                oom_killed: false,
            });
        };

        let path = format!("/api/v1/namespaces/{}/pods/{}", self.config.namespace, pod);
        let status = self.get_json(&path).await?;

        let terminated = status["status"]["containerStatuses"]
            .as_array()
            .and_then(|statuses| statuses.first())
            .map(|s| s["state"]["terminated"].clone())
            .unwrap_or(Value::Null);

        let exit_code = terminated["exitCode"].as_i64().unwrap_or(-1);
        let oom_killed = terminated["reason"].as_str() == Some("OOMKilled");

        Ok(RunOutcome {
            exit_code,
            oom_killed,
        })
    }
}

#[async_trait]
impl ContainerRunner for KubernetesRunner {
    async fn ensure_image(&self, image: &str, tarball: Option<&[u8]>) -> Result<(), RunnerError> {
        if tarball.is_some() {
            // No daemon to load into; the kubelet can only pull.
            return Err(RunnerError::ImageUnavailable {
                image: image.to_string(),
                reason: "Tarball-supplied images need a registry push before running on \
                         this backend"
                    .to_string(),
            });
        }
        // Registry images are pulled by the kubelet at pod start.
        Ok(())
    }

    async fn launch(&self, job: &ContainerJob) -> Result<RunHandle, RunnerError> {
        let manifest = self.job_manifest(job)?;
        let path = format!("/apis/batch/v1/namespaces/{}/jobs", self.config.namespace);

        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&manifest)
            .send()
            .await
            .map_err(|e| RunnerError::LaunchFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RunnerError::LaunchFailed(format!(
                "API server rejected job: {status}: {body}"
            )));
        }

        info!(job = %job.name, image = %job.image, "Created batch job");
        Ok(RunHandle::new(job.name.clone()))
    }

    async fn wait(&self, handle: &RunHandle) -> Result<RunOutcome, RunnerError> {
        loop {
            let job = self.get_json(&self.job_path(&handle.id)).await?;
            let status = &job["status"];

            if status["succeeded"].as_i64().unwrap_or(0) > 0 {
                return Ok(RunOutcome {
                    exit_code: 0,
                    oom_killed: false,
                });
            }
            if status["failed"].as_i64().unwrap_or(0) > 0 {
                let mut outcome = self.pod_outcome(&handle.id).await?;
                if outcome.exit_code == 0 {
                    // Job failed but the pod's code is gone or zero;
                    // keep the failure visible.
                    outcome.exit_code = -1;
                }
                return Ok(outcome);
            }

            debug!(job = %handle.id, "Job still active");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn terminate(&self, handle: &RunHandle) -> Result<(), RunnerError> {
        let response = self
            .request(reqwest::Method::DELETE, &self.job_path(&handle.id))
            .json(&json!({ "propagationPolicy": "Foreground" }))
            .send()
            .await
            .map_err(|e| RunnerError::TerminateFailed(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(RunnerError::TerminateFailed(format!(
                "API server returned {status}"
            ))),
        }
    }

    async fn logs(&self, handle: &RunHandle) -> Result<String, RunnerError> {
        let Some(pod) = self
            .find_pod(&handle.id)
            .await
            .map_err(|e| RunnerError::LogsFailed(e.to_string()))?
        else {
            return Ok(String::new());
        };

        let path = format!(
            "/api/v1/namespaces/{}/pods/{}/log",
            self.config.namespace, pod
        );
        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| RunnerError::LogsFailed(e.to_string()))?;

        if !response.status().is_success() {
            warn!(pod = %pod, status = %response.status(), "Could not fetch pod logs");
            return Ok(String::new());
        }

        response
            .text()
            .await
            .map_err(|e| RunnerError::LogsFailed(e.to_string()))
    }

    async fn remove(&self, handle: &RunHandle) -> Result<(), RunnerError> {
        // Same call as terminate; the cluster's TTL controller also
        // covers jobs we never get to delete.
        self.terminate(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ResourceLimits;

    fn runner() -> KubernetesRunner {
        KubernetesRunner::new(KubernetesConfig::new(
            "https://kube.test:6443",
            "modelyard",
            "modelyard-workspaces",
            "/var/lib/modelyard/workspaces",
        ))
        .unwrap()
    }

    fn container_job() -> ContainerJob {
        ContainerJob {
            name: "modelyard-1234".to_string(),
            image: "modelyard/algorithm-runner:1".to_string(),
            command: vec!["train".to_string()],
            env: vec![("DATA_DIR".to_string(), "/job/input".to_string())],
            input_host_path: "/var/lib/modelyard/workspaces/1234/input".into(),
            output_host_path: "/var/lib/modelyard/workspaces/1234/output".into(),
            input_mount: "/job/input".to_string(),
            output_mount: "/job/output".to_string(),
            limits: ResourceLimits::new(1024, 0.5, 128).with_timeout(900),
        }
    }

    #[test]
    fn test_manifest_shape() {
        let manifest = runner().job_manifest(&container_job()).unwrap();

        assert_eq!(manifest["spec"]["backoffLimit"], 0);
        assert_eq!(manifest["spec"]["activeDeadlineSeconds"], 900);

        let pod = &manifest["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");

        let container = &pod["containers"][0];
        assert_eq!(container["image"], "modelyard/algorithm-runner:1");
        assert_eq!(container["args"][0], "train");
        assert_eq!(container["resources"]["limits"]["memory"], "1024Mi");
        assert_eq!(container["resources"]["limits"]["cpu"], "500m");

        let mounts = container["volumeMounts"].as_array().unwrap();
        assert_eq!(mounts[0]["subPath"], "1234/input");
        assert_eq!(mounts[0]["readOnly"], true);
        assert_eq!(mounts[1]["subPath"], "1234/output");
    }

    #[test]
    fn test_manifest_omits_deadline_without_timeout() {
        let mut job = container_job();
        job.limits.timeout_seconds = None;

        let manifest = runner().job_manifest(&job).unwrap();
        assert!(manifest["spec"]["activeDeadlineSeconds"].is_null());
    }

    #[test]
    fn test_manifest_rejects_foreign_paths() {
        let mut job = container_job();
        job.input_host_path = "/tmp/elsewhere/input".into();

        assert!(matches!(
            runner().job_manifest(&job),
            Err(RunnerError::LaunchFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_tarball_images_are_rejected() {
        let err = runner()
            .ensure_image("acme/custom:1", Some(b"tarball"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::ImageUnavailable { .. }));
    }
}
