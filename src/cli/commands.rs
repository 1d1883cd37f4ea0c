//! CLI command definitions for modelyard.
//!
//! `run` submits a single job and follows it to a terminal state,
//! `validate` checks a request without executing anything, and
//! `algorithms` lists the built-in catalog.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use uuid::Uuid;

use crate::catalog::{self, AlgorithmReference};
use crate::config::{OrchestratorConfig, RunnerBackend};
use crate::contract::{AlgorithmType, CsvTable};
use crate::ledger::{
    MemoryResultRecorder, MemoryTaskLedger, PgResultRecorder, PgTaskLedger, ResultRecorder,
    TaskLedger, TaskStatus,
};
use crate::orchestrator::{JobKind, JobOrchestrator, JobRequest};
use crate::runner::{
    ContainerRunner, DockerRunner, KubernetesConfig, KubernetesRunner, ResourceLimits,
};
use crate::store::{Bucket, FsObjectStore, ObjectStore};

const DEFAULT_STORE_ROOT: &str = "./modelyard-store";
const DEFAULT_WORKSPACE_ROOT: &str = "./modelyard-workspaces";

/// Containerized ML training and prediction job orchestration.
#[derive(Parser)]
#[command(name = "modelyard")]
#[command(about = "Run ML training and prediction jobs in containers")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit a job and follow it until it finishes.
    Run(RunArgs),

    /// Validate a job request without executing anything.
    Validate(ValidateArgs),

    /// List the built-in algorithm catalog.
    #[command(alias = "algos")]
    Algorithms(AlgorithmsArgs),
}

/// How the job names its algorithm, shared by `run` and `validate`.
#[derive(Parser, Debug)]
pub struct AlgorithmArgs {
    /// Built-in algorithm name (see `modelyard algorithms`).
    #[arg(short, long, conflicts_with = "class_name")]
    pub algorithm: Option<String>,

    /// Class name of a custom algorithm.
    #[arg(long, requires = "algorithm_type")]
    pub class_name: Option<String>,

    /// Custom algorithm family: classification, regression, clustering.
    #[arg(long)]
    pub algorithm_type: Option<String>,

    /// Registry image for a custom algorithm.
    #[arg(long, conflicts_with = "image_tarball")]
    pub image: Option<String>,

    /// Gzipped `docker save` tarball for a custom algorithm.
    #[arg(long)]
    pub image_tarball: Option<PathBuf>,

    /// Default option string for a custom algorithm.
    #[arg(long)]
    pub default_options: Option<String>,

    /// Option override, KEY=VALUE (repeatable). An empty value makes
    /// the flag a bare switch.
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,
}

/// Arguments for `modelyard run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Job mode: train or predict.
    #[arg(value_name = "MODE")]
    pub mode: String,

    /// Path to the input dataset CSV.
    #[arg(short, long)]
    pub dataset: PathBuf,

    #[command(flatten)]
    pub algorithm: AlgorithmArgs,

    /// Trained model id, required for predict.
    #[arg(long)]
    pub model: Option<Uuid>,

    /// Target column name or 1-based index.
    #[arg(short, long)]
    pub target: Option<String>,

    /// Comma-separated 1-based feature column indices.
    #[arg(short, long)]
    pub features: Option<String>,

    /// Container backend: docker or kubernetes.
    #[arg(long, default_value = "docker")]
    pub backend: String,

    /// Kubernetes API server URL (kubernetes backend only).
    #[arg(long, env = "MODELYARD_KUBE_API_SERVER")]
    pub kube_api_server: Option<String>,

    /// Kubernetes namespace.
    #[arg(long, default_value = "modelyard")]
    pub kube_namespace: String,

    /// Kubernetes bearer token.
    #[arg(long, env = "MODELYARD_KUBE_TOKEN", hide_env_values = true)]
    pub kube_token: Option<String>,

    /// PersistentVolumeClaim backing the workspace root.
    #[arg(long, default_value = "modelyard-workspaces")]
    pub kube_claim: String,

    /// PostgreSQL URL for the task ledger; omit for in-memory.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Object store root directory.
    #[arg(long, default_value = DEFAULT_STORE_ROOT)]
    pub store_root: PathBuf,

    /// Workspace root directory.
    #[arg(long, default_value = DEFAULT_WORKSPACE_ROOT)]
    pub workspace_root: PathBuf,

    /// Keep workspaces on disk after the job finishes.
    #[arg(long)]
    pub preserve_workspaces: bool,

    /// Container memory limit in megabytes.
    #[arg(long, default_value = "2048")]
    pub memory_mb: u64,

    /// Container CPU cores (fractional allowed).
    #[arg(long, default_value = "1.0")]
    pub cpu: f64,

    /// Wall-clock timeout in seconds; unbounded when omitted.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Output the final task record as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `modelyard validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Job mode: train or predict.
    #[arg(value_name = "MODE")]
    pub mode: String,

    /// Path to the input dataset CSV; checked for shape when given.
    #[arg(short, long)]
    pub dataset: Option<PathBuf>,

    #[command(flatten)]
    pub algorithm: AlgorithmArgs,

    /// Target column name or 1-based index.
    #[arg(short, long)]
    pub target: Option<String>,

    /// Comma-separated 1-based feature column indices.
    #[arg(short, long)]
    pub features: Option<String>,
}

/// Arguments for `modelyard algorithms`.
#[derive(Parser, Debug)]
pub struct AlgorithmsArgs {
    /// Output as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parses CLI arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Executes the parsed CLI command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_job(args).await,
        Commands::Validate(args) => validate_request(args).await,
        Commands::Algorithms(args) => list_algorithms(args),
    }
}

fn parse_mode(raw: &str) -> anyhow::Result<JobKind> {
    match raw.to_ascii_lowercase().as_str() {
        "train" => Ok(JobKind::Train),
        "predict" => Ok(JobKind::Predict),
        other => anyhow::bail!("Unknown mode '{other}' (expected train or predict)"),
    }
}

fn parse_algorithm_type(raw: &str) -> anyhow::Result<AlgorithmType> {
    match raw.to_ascii_lowercase().as_str() {
        "classification" => Ok(AlgorithmType::Classification),
        "regression" => Ok(AlgorithmType::Regression),
        "clustering" => Ok(AlgorithmType::Clustering),
        other => anyhow::bail!(
            "Unknown algorithm type '{other}' (expected classification, regression or clustering)"
        ),
    }
}

/// Builds the algorithm reference from the CLI flags, uploading a
/// tarball into the store when one is given.
async fn build_reference(
    args: &AlgorithmArgs,
    store: Option<&FsObjectStore>,
) -> anyhow::Result<AlgorithmReference> {
    if let Some(name) = &args.algorithm {
        return Ok(AlgorithmReference::Builtin { name: name.clone() });
    }

    let Some(class_name) = &args.class_name else {
        anyhow::bail!("Provide --algorithm for a built-in or --class-name for a custom algorithm");
    };
    let algorithm_type = parse_algorithm_type(
        args.algorithm_type
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--class-name requires --algorithm-type"))?,
    )?;

    let tarball_blob = match (&args.image_tarball, store) {
        (Some(path), Some(store)) => {
            let bytes = tokio::fs::read(path).await?;
            let blob = store.put_new(Bucket::AlgorithmImages, &bytes).await?;
            info!(blob = %blob.key, size = blob.size_bytes, "Uploaded algorithm image tarball");
            Some(blob.key)
        }
        // validate never uploads; a placeholder id keeps the
        // exactly-one-source check honest.
        (Some(_), None) => Some(Uuid::new_v4()),
        (None, _) => None,
    };

    Ok(AlgorithmReference::Custom {
        class_name: class_name.clone(),
        algorithm_type,
        tarball_blob,
        registry_image: args.image.clone(),
        default_options: args.default_options.clone(),
    })
}

fn apply_overrides(mut request: JobRequest, overrides: &[String]) -> anyhow::Result<JobRequest> {
    for raw in overrides {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Option override '{raw}' is not KEY=VALUE"))?;
        request = request.with_option_override(key, value);
    }
    Ok(request)
}

async fn run_job(args: RunArgs) -> anyhow::Result<()> {
    let kind = parse_mode(&args.mode)?;

    let store = Arc::new(FsObjectStore::new(&args.store_root));
    let reference = build_reference(&args.algorithm, Some(&store)).await?;

    let dataset_bytes = tokio::fs::read(&args.dataset).await?;
    let dataset = store.put_new(Bucket::Datasets, &dataset_bytes).await?;
    info!(blob = %dataset.key, size = dataset.size_bytes, "Uploaded dataset");

    let (ledger, recorder): (Arc<dyn TaskLedger>, Arc<dyn ResultRecorder>) =
        match &args.database_url {
            Some(url) => {
                let pool = crate::ledger::postgres::connect(url).await?;
                crate::ledger::postgres::run_migrations(&pool).await?;
                (
                    Arc::new(PgTaskLedger::from_pool(pool.clone())),
                    Arc::new(PgResultRecorder::from_pool(pool)),
                )
            }
            None => (
                Arc::new(MemoryTaskLedger::new()),
                Arc::new(MemoryResultRecorder::new()),
            ),
        };

    let backend = match args.backend.as_str() {
        "docker" => RunnerBackend::Docker,
        "kubernetes" => RunnerBackend::Kubernetes,
        other => anyhow::bail!("Unknown backend '{other}' (expected docker or kubernetes)"),
    };

    let workspace_root = std::path::absolute(&args.workspace_root)?;
    let config = OrchestratorConfig::new(backend)
        .with_workspace_root(&workspace_root)
        .with_preserve_workspaces(args.preserve_workspaces);

    let runner: Arc<dyn ContainerRunner> = match backend {
        RunnerBackend::Docker => Arc::new(DockerRunner::new()?),
        RunnerBackend::Kubernetes => {
            let api_server = args
                .kube_api_server
                .ok_or_else(|| anyhow::anyhow!("--kube-api-server is required for kubernetes"))?;
            let mut kube = KubernetesConfig::new(
                api_server,
                args.kube_namespace,
                args.kube_claim,
                &workspace_root,
            );
            if let Some(token) = args.kube_token {
                kube = kube.with_token(token);
            }
            Arc::new(KubernetesRunner::new(kube)?)
        }
    };

    let orchestrator = JobOrchestrator::new(config, ledger, recorder, store, runner);

    let mut request = match kind {
        JobKind::Train => JobRequest::train(dataset.key, reference),
        JobKind::Predict => {
            let model = args
                .model
                .ok_or_else(|| anyhow::anyhow!("--model is required for predict"))?;
            JobRequest::predict(dataset.key, reference, model)
        }
    };
    if let Some(target) = &args.target {
        request = request.with_target_column(target);
    }
    if let Some(features) = &args.features {
        request = request.with_feature_columns(features);
    }
    let mut limits = ResourceLimits::new(args.memory_mb, args.cpu, 256);
    if let Some(timeout) = args.timeout {
        limits = limits.with_timeout(timeout);
    }
    request = request.with_limits(limits);
    request = apply_overrides(request, &args.algorithm.overrides)?;

    let task_id = orchestrator.submit(request).await?;
    println!("Task {task_id} submitted");

    // Follow the task to its terminal state.
    let mut last_status = TaskStatus::Pending;
    let record = loop {
        let record = orchestrator.status(task_id).await?;
        if record.status != last_status {
            println!("Task {task_id}: {}", record.status);
            last_status = record.status;
        }
        if record.status.is_terminal() {
            break record;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        if let Some(model_id) = record.model_id {
            println!("Model: {model_id}");
        }
        if let Some(execution_id) = record.execution_id {
            println!("Execution: {execution_id}");
        }
        if let Some(kind) = record.failure_kind {
            println!("Failure: {kind}");
        }
        if let Some(detail) = &record.failure_detail {
            println!("Detail: {detail}");
        }
    }

    if record.status != TaskStatus::Completed {
        anyhow::bail!("Task finished in state {}", record.status);
    }
    Ok(())
}

async fn validate_request(args: ValidateArgs) -> anyhow::Result<()> {
    let kind = parse_mode(&args.mode)?;
    let reference = build_reference(&args.algorithm, None).await?;

    let mut request = match kind {
        JobKind::Train => JobRequest::train(Uuid::new_v4(), reference),
        // Validation only needs a model reference to exist.
        JobKind::Predict => JobRequest::predict(Uuid::new_v4(), reference, Uuid::new_v4()),
    };
    if let Some(target) = &args.target {
        request = request.with_target_column(target);
    }
    if let Some(features) = &args.features {
        request = request.with_feature_columns(features);
    }
    request = apply_overrides(request, &args.algorithm.overrides)?;

    let job = request.validate(&OrchestratorConfig::default())?;
    println!("Algorithm: {} ({})", job.algorithm.class_name, job.algorithm.algorithm_type);
    if let Some(options) = &job.algorithm.options {
        println!("Options: {options}");
    }

    if let Some(path) = &args.dataset {
        let text = tokio::fs::read_to_string(path).await?;
        let table = CsvTable::parse(&text)?;
        println!(
            "Dataset: {} columns x {} rows",
            table.column_count(),
            table.row_count()
        );
    }

    println!("OK");
    Ok(())
}

fn list_algorithms(args: AlgorithmsArgs) -> anyhow::Result<()> {
    if args.json {
        let entries: Vec<serde_json::Value> = catalog::builtins()
            .iter()
            .map(|a| {
                serde_json::json!({
                    "name": a.name,
                    "type": a.algorithm_type,
                    "className": a.class_name,
                    "defaultOptions": a.default_options,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("{:<18} {:<14} {:<42} {}", "NAME", "TYPE", "CLASS", "DEFAULT OPTIONS");
    for a in catalog::builtins() {
        println!(
            "{:<18} {:<14} {:<42} {}",
            a.name,
            a.algorithm_type.to_string(),
            a.class_name,
            a.default_options
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("train").unwrap(), JobKind::Train);
        assert_eq!(parse_mode("PREDICT").unwrap(), JobKind::Predict);
        assert!(parse_mode("evaluate").is_err());
    }

    #[test]
    fn test_parse_algorithm_type() {
        assert_eq!(
            parse_algorithm_type("classification").unwrap(),
            AlgorithmType::Classification
        );
        assert!(parse_algorithm_type("ranking").is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let request = JobRequest::train(
            Uuid::new_v4(),
            AlgorithmReference::Builtin {
                name: "j48".to_string(),
            },
        );
        let request = apply_overrides(request, &["M=5".to_string(), "U=".to_string()]).unwrap();

        assert_eq!(request.option_overrides.get("M").map(String::as_str), Some("5"));
        assert_eq!(request.option_overrides.get("U").map(String::as_str), Some(""));

        let request = JobRequest::train(
            Uuid::new_v4(),
            AlgorithmReference::Builtin {
                name: "j48".to_string(),
            },
        );
        assert!(apply_overrides(request, &["no-equals".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_build_reference_requires_a_source_name() {
        let args = AlgorithmArgs {
            algorithm: None,
            class_name: None,
            algorithm_type: None,
            image: None,
            image_tarball: None,
            default_options: None,
            overrides: Vec::new(),
        };
        assert!(build_reference(&args, None).await.is_err());
    }

    #[tokio::test]
    async fn test_build_reference_builtin() {
        let args = AlgorithmArgs {
            algorithm: Some("kmeans".to_string()),
            class_name: None,
            algorithm_type: None,
            image: None,
            image_tarball: None,
            default_options: None,
            overrides: Vec::new(),
        };
        let reference = build_reference(&args, None).await.unwrap();
        assert_eq!(
            reference,
            AlgorithmReference::Builtin {
                name: "kmeans".to_string()
            }
        );
    }
}
