//! modelyard: containerized ML training and prediction job
//! orchestration.
//!
//! A caller submits a train or predict job against a stored dataset;
//! the orchestrator stages a per-task workspace, runs the algorithm in
//! an isolated container (local Docker or Kubernetes batch Jobs),
//! verifies the contract outputs, uploads the produced artifacts and
//! records the task's terminal state in the ledger.
//!
//! The main seams are traits: [`ledger::TaskLedger`] and
//! [`ledger::ResultRecorder`] for durable records,
//! [`store::ObjectStore`] for content blobs, and
//! [`runner::ContainerRunner`] for the container backend.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod contract;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod runner;
pub mod store;
pub mod workspace;

pub use config::{OrchestratorConfig, RunnerBackend};
pub use error::{FailureKind, ValidationError};
pub use orchestrator::{JobKind, JobOrchestrator, JobRequest, OrchestratorError};
