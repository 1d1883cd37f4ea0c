//! The job orchestrator.
//!
//! `submit` validates a request, creates a PENDING task, and spawns a
//! worker that drives the whole run: workspace staging, container
//! execution, output verification, artifact upload, and the terminal
//! ledger write. `status` is a ledger read; `stop` flips a per-task
//! watch channel the worker races against the container wait.
//!
//! Status transitions are monotonic. The worker is the only writer for
//! its task, and every exit path lands in exactly one terminal state:
//! COMPLETED, FAILED (with a `FailureKind`), or STOPPED.

pub mod request;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ImageSource;
use crate::config::OrchestratorConfig;
use crate::contract::{
    self, verify_outputs, CsvTable, RunParams, SelectedDataset, HEADER_FILE, METRICS_FILE,
    MODEL_FILE, PARAMS_FILE, PREDICTIONS_FILE, PREDICTION_METADATA_FILE, PREDICT_DATASET_FILE,
    TRAIN_DATASET_FILE,
};
use crate::error::{FailureKind, ValidationError};
use crate::ledger::{LedgerError, ResultRecorder, TaskLedger, TaskRecord, TaskStatus};
use crate::runner::{docker::tarball_repo_tags, log_tail, ContainerJob, ContainerRunner, RunHandle};
use crate::store::{Bucket, ObjectStore};
use crate::workspace::{JobWorkspace, WorkspaceManager};

pub use request::{JobKind, JobRequest, ValidatedJob};

/// How many log lines a failure detail keeps.
const FAILURE_LOG_LINES: usize = 20;

/// Errors returned synchronously from the orchestrator's public calls.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What a successful run produced.
struct Completion {
    model_id: Option<Uuid>,
    execution_id: Option<Uuid>,
}

/// Why a run did not complete.
enum Interrupt {
    Stopped(String),
    Failed { kind: FailureKind, detail: String },
}

impl Interrupt {
    fn failed(kind: FailureKind, detail: impl Into<String>) -> Self {
        Interrupt::Failed {
            kind,
            detail: detail.into(),
        }
    }
}

struct Inner {
    config: OrchestratorConfig,
    ledger: Arc<dyn TaskLedger>,
    recorder: Arc<dyn ResultRecorder>,
    store: Arc<dyn ObjectStore>,
    runner: Arc<dyn ContainerRunner>,
    workspaces: WorkspaceManager,
    permits: Arc<Semaphore>,
    stops: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

/// Submits, tracks and stops containerized algorithm jobs.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        ledger: Arc<dyn TaskLedger>,
        recorder: Arc<dyn ResultRecorder>,
        store: Arc<dyn ObjectStore>,
        runner: Arc<dyn ContainerRunner>,
    ) -> Self {
        let workspaces =
            WorkspaceManager::new(&config.workspace_root, config.preserve_workspaces);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));

        Self {
            inner: Arc::new(Inner {
                config,
                ledger,
                recorder,
                store,
                runner,
                workspaces,
                permits,
                stops: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validates the request and, if it passes, creates a PENDING task
    /// and hands it to a background worker. Returns the task id without
    /// waiting for execution.
    pub async fn submit(&self, request: JobRequest) -> Result<Uuid, OrchestratorError> {
        let job = request.validate(&self.inner.config)?;
        let record = self.inner.ledger.create().await?;
        let task_id = record.id;

        let (stop_tx, stop_rx) = watch::channel(false);
        self.inner.stops.lock().await.insert(task_id, stop_tx);

        info!(task_id = %task_id, kind = %job.kind, algorithm = %job.algorithm.class_name, "Submitted job");

        let this = self.clone();
        tokio::spawn(async move {
            this.run_job(task_id, job, stop_rx).await;
        });

        Ok(task_id)
    }

    /// Current ledger record for a task.
    pub async fn status(&self, task_id: Uuid) -> Result<TaskRecord, OrchestratorError> {
        Ok(self.inner.ledger.get(task_id).await?)
    }

    /// Requests a stop. Idempotent: stopping a task that already
    /// reached a terminal state is a no-op; an unknown task is an error.
    pub async fn stop(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        let record = self.inner.ledger.get(task_id).await?;
        if record.status.is_terminal() {
            debug!(task_id = %task_id, status = %record.status, "Stop on finished task ignored");
            return Ok(());
        }

        if let Some(sender) = self.inner.stops.lock().await.get(&task_id) {
            let _ = sender.send(true);
            info!(task_id = %task_id, "Stop requested");
        }
        Ok(())
    }

    async fn clear_stop(&self, task_id: Uuid) {
        self.inner.stops.lock().await.remove(&task_id);
    }

    /// The worker: owns the task from PENDING to its terminal state.
    async fn run_job(self, task_id: Uuid, job: ValidatedJob, mut stop_rx: watch::Receiver<bool>) {
        // Queue for a concurrency permit, racing the stop signal so a
        // queued task can be stopped before it ever runs.
        let _permit = tokio::select! {
            permit = self.inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.finish_failure(task_id, FailureKind::SetupFailure, "Worker pool shut down")
                        .await;
                    self.clear_stop(task_id).await;
                    return;
                }
            },
            _ = wait_for_stop(&mut stop_rx) => {
                self.finish_stopped(task_id, "Stopped before execution started").await;
                self.clear_stop(task_id).await;
                return;
            }
        };

        if let Err(e) = self
            .inner
            .ledger
            .transition(task_id, TaskStatus::Running)
            .await
        {
            // A stop can land between the permit and this write.
            debug!(task_id = %task_id, error = %e, "Task no longer startable");
            self.clear_stop(task_id).await;
            return;
        }

        let workspace = match self.inner.workspaces.allocate(task_id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                self.finish_failure(task_id, FailureKind::SetupFailure, e.to_string())
                    .await;
                self.clear_stop(task_id).await;
                return;
            }
        };

        let result = self.execute(task_id, &job, &workspace, &mut stop_rx).await;

        let preserve = match result {
            Ok(completion) => {
                if let Err(e) = self
                    .inner
                    .ledger
                    .record_completion(task_id, completion.model_id, completion.execution_id)
                    .await
                {
                    warn!(task_id = %task_id, error = %e, "Failed to record completion");
                }
                info!(task_id = %task_id, "Job completed");
                false
            }
            Err(Interrupt::Stopped(detail)) => {
                self.finish_stopped(task_id, &detail).await;
                false
            }
            Err(Interrupt::Failed { kind, detail }) => {
                self.finish_failure(task_id, kind, &detail).await;
                // Keep the evidence when the run itself succeeded but
                // its results could not be persisted.
                kind == FailureKind::ResultPersistenceFailure
            }
        };

        if preserve {
            warn!(
                task_id = %task_id,
                path = %workspace.root().display(),
                "Preserving workspace with unpersisted outputs"
            );
        } else if let Err(e) = self.inner.workspaces.release(task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to release workspace");
        }

        self.clear_stop(task_id).await;
    }

    async fn finish_failure(&self, task_id: Uuid, kind: FailureKind, detail: impl AsRef<str>) {
        let detail = detail.as_ref();
        warn!(task_id = %task_id, kind = %kind, detail = %detail, "Job failed");
        if let Err(e) = self.inner.ledger.record_failure(task_id, kind, detail).await {
            warn!(task_id = %task_id, error = %e, "Failed to record failure");
        }
    }

    async fn finish_stopped(&self, task_id: Uuid, detail: &str) {
        info!(task_id = %task_id, detail = %detail, "Job stopped");
        if let Err(e) = self.inner.ledger.record_stopped(task_id, detail).await {
            warn!(task_id = %task_id, error = %e, "Failed to record stop");
        }
    }

    /// Everything between RUNNING and the terminal write.
    async fn execute(
        &self,
        task_id: Uuid,
        job: &ValidatedJob,
        workspace: &JobWorkspace,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<Completion, Interrupt> {
        self.stage_inputs(job, workspace).await?;

        let (image, tarball) = self.resolve_image(job).await?;
        self.inner
            .runner
            .ensure_image(&image, tarball.as_deref())
            .await
            .map_err(|e| Interrupt::failed(FailureKind::ContainerLaunchFailure, e.to_string()))?;

        // A stop that landed during staging prevents the launch.
        if *stop_rx.borrow() {
            return Err(Interrupt::Stopped(
                "Stopped before the container launched".to_string(),
            ));
        }

        let container_job = ContainerJob {
            name: format!("modelyard-{task_id}"),
            image,
            command: vec![job.kind.as_str().to_string()],
            env: vec![
                (
                    contract::DATA_DIR_ENV.to_string(),
                    self.inner.config.container_input_dir.clone(),
                ),
                (
                    contract::MODEL_DIR_ENV.to_string(),
                    self.inner.config.container_output_dir.clone(),
                ),
            ],
            input_host_path: workspace.input_root.clone(),
            output_host_path: workspace.output_root.clone(),
            input_mount: self.inner.config.container_input_dir.clone(),
            output_mount: self.inner.config.container_output_dir.clone(),
            limits: job.limits,
        };

        let handle = self
            .inner
            .runner
            .launch(&container_job)
            .await
            .map_err(|e| Interrupt::failed(FailureKind::ContainerLaunchFailure, e.to_string()))?;

        let outcome = self.wait_for_container(&handle, job, stop_rx).await;

        // The container is done (or killed) either way; drop its
        // backend resources before touching the results.
        if let Err(e) = self.inner.runner.remove(&handle).await {
            debug!(task_id = %task_id, error = %e, "Container removal failed");
        }

        outcome?;

        verify_outputs(&workspace.output_root, job.kind)
            .await
            .map_err(|e| Interrupt::failed(FailureKind::ContainerRuntimeFailure, e.to_string()))?;

        self.persist_outputs(task_id, job, workspace).await
    }

    /// Stages all contract inputs into the workspace: the selected
    /// dataset, `params.json`, and (for predict) the model files.
    async fn stage_inputs(
        &self,
        job: &ValidatedJob,
        workspace: &JobWorkspace,
    ) -> Result<(), Interrupt> {
        let setup = |e: &dyn std::fmt::Display| {
            Interrupt::failed(FailureKind::SetupFailure, e.to_string())
        };

        let raw = self
            .inner
            .store
            .get(Bucket::Datasets, job.dataset)
            .await
            .map_err(|e| setup(&e))?;
        let table =
            CsvTable::parse(&String::from_utf8_lossy(&raw)).map_err(|e| setup(&e))?;

        let selected = self.select_columns(job, &table).map_err(|e| setup(&e))?;

        let dataset_file = match job.kind {
            JobKind::Train => TRAIN_DATASET_FILE,
            JobKind::Predict => PREDICT_DATASET_FILE,
        };
        tokio::fs::write(
            workspace.input_root.join(dataset_file),
            selected.table.to_csv(),
        )
        .await
        .map_err(|e| setup(&e))?;

        let mut class_labels = None;
        if let Some(model_id) = job.model_id {
            let model = self
                .inner
                .recorder
                .get_model(model_id)
                .await
                .map_err(|e| setup(&e))?;

            let model_bytes = self
                .inner
                .store
                .get(model.model_blob.bucket, model.model_blob.key)
                .await
                .map_err(|e| setup(&e))?;
            tokio::fs::write(workspace.input_root.join(MODEL_FILE), model_bytes)
                .await
                .map_err(|e| setup(&e))?;

            if let Some(header) = &model.header_blob {
                let header_bytes = self
                    .inner
                    .store
                    .get(header.bucket, header.key)
                    .await
                    .map_err(|e| setup(&e))?;
                tokio::fs::write(workspace.input_root.join(HEADER_FILE), header_bytes)
                    .await
                    .map_err(|e| setup(&e))?;
            }

            class_labels = model.class_labels;
        }

        let mut params = RunParams::new(&job.algorithm.class_name, job.algorithm.algorithm_type);
        params.options = job.algorithm.options.clone();
        params.target_column = selected.target_column.clone();
        params.basic_attributes_columns = job.selection.feature_spec();
        params.class_labels = class_labels;

        let params_bytes = params.to_json().map_err(|e| setup(&e))?;
        tokio::fs::write(workspace.input_root.join(PARAMS_FILE), params_bytes)
            .await
            .map_err(|e| setup(&e))?;

        Ok(())
    }

    fn select_columns(
        &self,
        job: &ValidatedJob,
        table: &CsvTable,
    ) -> Result<SelectedDataset, contract::ContractError> {
        if !job.algorithm.algorithm_type.has_target() {
            return table.select_features_only(&job.selection);
        }
        match job.kind {
            JobKind::Train => table.select_for_training(&job.selection),
            JobKind::Predict => table.select_for_prediction(&job.selection),
        }
    }

    /// Turns the resolved image source into (image name, optional
    /// tarball bytes). For tarball images the name comes from the
    /// tarball's own manifest.
    async fn resolve_image(
        &self,
        job: &ValidatedJob,
    ) -> Result<(String, Option<Vec<u8>>), Interrupt> {
        match &job.algorithm.image {
            ImageSource::Registry(image) => Ok((image.clone(), None)),
            ImageSource::Tarball(blob) => {
                let bytes = self
                    .inner
                    .store
                    .get(Bucket::AlgorithmImages, *blob)
                    .await
                    .map_err(|e| {
                        Interrupt::failed(FailureKind::ContainerLaunchFailure, e.to_string())
                    })?;

                let tags = tarball_repo_tags(&bytes).map_err(|e| {
                    Interrupt::failed(
                        FailureKind::ContainerLaunchFailure,
                        format!("Unreadable image tarball: {e}"),
                    )
                })?;
                let image = tags.into_iter().next().ok_or_else(|| {
                    Interrupt::failed(
                        FailureKind::ContainerLaunchFailure,
                        "Image tarball carries no repo tag",
                    )
                })?;

                Ok((image, Some(bytes)))
            }
        }
    }

    /// Races the container wait against the stop signal and, when the
    /// job carries one, its wall-clock timeout.
    async fn wait_for_container(
        &self,
        handle: &RunHandle,
        job: &ValidatedJob,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), Interrupt> {
        let timeout = job.limits.timeout_seconds;

        let outcome = tokio::select! {
            outcome = self.inner.runner.wait(handle) => outcome
                .map_err(|e| Interrupt::failed(FailureKind::ContainerRuntimeFailure, e.to_string()))?,
            _ = wait_for_stop(stop_rx) => {
                if let Err(e) = self.inner.runner.terminate(handle).await {
                    warn!(container = %handle.id, error = %e, "Terminate after stop failed");
                }
                return Err(Interrupt::Stopped(
                    "Stopped while the container was running".to_string(),
                ));
            }
            _ = wall_clock(timeout) => {
                if let Err(e) = self.inner.runner.terminate(handle).await {
                    warn!(container = %handle.id, error = %e, "Terminate after timeout failed");
                }
                return Err(Interrupt::failed(
                    FailureKind::ContainerRuntimeFailure,
                    format!("Timed out after {}s", timeout.unwrap_or(0)),
                ));
            }
        };

        if outcome.succeeded() {
            return Ok(());
        }

        let detail = if outcome.oom_killed {
            format!(
                "Container killed: out of memory (limit {} MB)",
                job.limits.memory_mb
            )
        } else {
            let logs = self.inner.runner.logs(handle).await.unwrap_or_default();
            let tail = log_tail(&logs, FAILURE_LOG_LINES);
            if tail.is_empty() {
                format!("Container exited with code {}", outcome.exit_code)
            } else {
                format!("Container exited with code {}: {tail}", outcome.exit_code)
            }
        };

        Err(Interrupt::failed(
            FailureKind::ContainerRuntimeFailure,
            detail,
        ))
    }

    /// Uploads produced artifacts and registers the result record.
    async fn persist_outputs(
        &self,
        task_id: Uuid,
        job: &ValidatedJob,
        workspace: &JobWorkspace,
    ) -> Result<Completion, Interrupt> {
        let persist = |e: &dyn std::fmt::Display| {
            Interrupt::failed(FailureKind::ResultPersistenceFailure, e.to_string())
        };

        match job.kind {
            JobKind::Train => {
                let model_bytes = tokio::fs::read(workspace.output_root.join(MODEL_FILE))
                    .await
                    .map_err(|e| persist(&e))?;
                let metrics_bytes = tokio::fs::read(workspace.output_root.join(METRICS_FILE))
                    .await
                    .map_err(|e| persist(&e))?;

                let model_blob = self
                    .inner
                    .store
                    .put_new(Bucket::Models, &model_bytes)
                    .await
                    .map_err(|e| persist(&e))?;
                let metrics_blob = self
                    .inner
                    .store
                    .put_new(Bucket::Metrics, &metrics_bytes)
                    .await
                    .map_err(|e| persist(&e))?;

                // Optional training header, when the runner emitted one.
                let header_path = workspace.output_root.join(HEADER_FILE);
                let header_blob = match tokio::fs::read(&header_path).await {
                    Ok(bytes) => Some(
                        self.inner
                            .store
                            .put_new(Bucket::Models, &bytes)
                            .await
                            .map_err(|e| persist(&e))?,
                    ),
                    Err(_) => None,
                };

                let class_labels = class_labels_from_metrics(&metrics_bytes);

                let model_id = self
                    .inner
                    .recorder
                    .create_model(task_id, model_blob, metrics_blob, header_blob, class_labels)
                    .await
                    .map_err(|e| persist(&e))?;

                Ok(Completion {
                    model_id: Some(model_id),
                    execution_id: None,
                })
            }
            JobKind::Predict => {
                let predictions_bytes =
                    tokio::fs::read(workspace.output_root.join(PREDICTIONS_FILE))
                        .await
                        .map_err(|e| persist(&e))?;
                let metadata_bytes =
                    tokio::fs::read(workspace.output_root.join(PREDICTION_METADATA_FILE))
                        .await
                        .map_err(|e| persist(&e))?;

                let predictions_blob = self
                    .inner
                    .store
                    .put_new(Bucket::Predictions, &predictions_bytes)
                    .await
                    .map_err(|e| persist(&e))?;
                let metadata_blob = self
                    .inner
                    .store
                    .put_new(Bucket::Metadata, &metadata_bytes)
                    .await
                    .map_err(|e| persist(&e))?;

                let execution_id = self
                    .inner
                    .recorder
                    .create_execution(task_id, predictions_blob, metadata_blob)
                    .await
                    .map_err(|e| persist(&e))?;

                Ok(Completion {
                    model_id: None,
                    execution_id: Some(execution_id),
                })
            }
        }
    }
}

/// Sleeps for the given limit; pends forever when there is none.
async fn wall_clock(limit: Option<u64>) {
    match limit {
        Some(seconds) => tokio::time::sleep(std::time::Duration::from_secs(seconds)).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which only happens after the
    // worker finished; pending forever is the right behavior then.
    if rx.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Shallow read of the class-label vocabulary a training run reported
/// in its metrics document. Absent or oddly shaped labels are ignored.
fn class_labels_from_metrics(metrics: &[u8]) -> Option<Vec<String>> {
    let value: serde_json::Value = serde_json::from_slice(metrics).ok()?;
    let labels = value.get("classLabels")?.as_array()?;
    let labels: Vec<String> = labels
        .iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    if labels.is_empty() {
        None
    } else {
        Some(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_labels_from_metrics() {
        let metrics = br#"{"accuracy": 0.93, "classLabels": ["setosa", "versicolor"]}"#;
        assert_eq!(
            class_labels_from_metrics(metrics),
            Some(vec!["setosa".to_string(), "versicolor".to_string()])
        );

        assert_eq!(class_labels_from_metrics(br#"{"accuracy": 0.93}"#), None);
        assert_eq!(class_labels_from_metrics(br#"{"classLabels": [1, 2]}"#), None);
        assert_eq!(class_labels_from_metrics(b"not json"), None);
    }
}
