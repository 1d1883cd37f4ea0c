//! Task status ledger and result records.
//!
//! The ledger is the durable record of each submitted job's lifecycle,
//! keyed by an opaque task id. Status transitions are monotonic: a task
//! reaches exactly one terminal state, ever, and nothing moves it out of
//! a terminal state afterwards. Updates are single-writer (only the
//! worker driving a task writes to its row), so no optimistic locking
//! is layered on top of the store's row-level serialization — but the
//! transition check is still enforced in code.
//!
//! Model and execution records are owned by external services; this
//! module carries the `ResultRecorder` seam the orchestrator calls to
//! register produced artifacts, and stores only the returned ids on the
//! task record.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::FailureKind;
use crate::store::BlobRef;

pub use memory::{MemoryResultRecorder, MemoryTaskLedger};
pub use postgres::{PgResultRecorder, PgTaskLedger};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }

    /// The monotonic transition rule: PENDING -> RUNNING -> terminal,
    /// with STOPPED and FAILED also reachable straight from PENDING.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(
                to,
                TaskStatus::Running | TaskStatus::Failed | TaskStatus::Stopped
            ),
            TaskStatus::Running => matches!(
                to,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
            ),
            _ => false,
        }
    }

    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Stopped => "STOPPED",
        }
    }

    /// Parses the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "RUNNING" => Some(TaskStatus::Running),
            "COMPLETED" => Some(TaskStatus::Completed),
            "FAILED" => Some(TaskStatus::Failed),
            "STOPPED" => Some(TaskStatus::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only when a TRAIN task completes.
    pub model_id: Option<Uuid>,
    /// Set only when a PREDICT task completes.
    pub execution_id: Option<Uuid>,
    /// Set only on FAILED (and, as `Cancelled`, on STOPPED).
    pub failure_kind: Option<FailureKind>,
    pub failure_detail: Option<String>,
}

impl TaskRecord {
    /// A fresh PENDING record.
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            model_id: None,
            execution_id: None,
            failure_kind: None,
            failure_detail: None,
        }
    }
}

/// A stored model record, enough for a predict job to stage its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub model_blob: BlobRef,
    pub metrics_blob: BlobRef,
    /// Serialized training header, when the training run produced one.
    pub header_blob: Option<BlobRef>,
    /// Class-label vocabulary for classification models.
    pub class_labels: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

/// A stored prediction-execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub predictions_blob: BlobRef,
    pub metadata_blob: BlobRef,
    pub created_at: DateTime<Utc>,
}

/// Errors from the ledger or record services.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Model {0} not found")]
    ModelNotFound(Uuid),

    #[error("Invalid status transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable task lifecycle store.
#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// Creates a new PENDING task and returns its record.
    async fn create(&self) -> Result<TaskRecord, LedgerError>;

    /// Reads a task record. Always reflects the last committed write.
    async fn get(&self, id: Uuid) -> Result<TaskRecord, LedgerError>;

    /// Moves a task to a new non-terminal-entering state (in practice:
    /// PENDING -> RUNNING). Rejects non-monotonic transitions.
    async fn transition(&self, id: Uuid, to: TaskStatus) -> Result<(), LedgerError>;

    /// Marks a task COMPLETED with its produced-artifact ids.
    async fn record_completion(
        &self,
        id: Uuid,
        model_id: Option<Uuid>,
        execution_id: Option<Uuid>,
    ) -> Result<(), LedgerError>;

    /// Marks a task FAILED with a failure kind and detail.
    async fn record_failure(
        &self,
        id: Uuid,
        kind: FailureKind,
        detail: &str,
    ) -> Result<(), LedgerError>;

    /// Marks a task STOPPED following an explicit stop request.
    async fn record_stopped(&self, id: Uuid, detail: &str) -> Result<(), LedgerError>;
}

/// Registry for produced artifacts (external collaborator seam).
#[async_trait]
pub trait ResultRecorder: Send + Sync {
    /// Registers a trained model and returns its id.
    async fn create_model(
        &self,
        task_id: Uuid,
        model_blob: BlobRef,
        metrics_blob: BlobRef,
        header_blob: Option<BlobRef>,
        class_labels: Option<Vec<String>>,
    ) -> Result<Uuid, LedgerError>;

    /// Registers a prediction execution and returns its id.
    async fn create_execution(
        &self,
        task_id: Uuid,
        predictions_blob: BlobRef,
        metadata_blob: BlobRef,
    ) -> Result<Uuid, LedgerError>;

    /// Fetches a model record, for predict-time input staging.
    async fn get_model(&self, id: Uuid) -> Result<ModelRecord, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Stopped] {
            assert!(terminal.is_terminal());
            for to in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Stopped,
            ] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_valid_paths() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Stopped));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Stopped));

        // No skipping PENDING -> COMPLETED.
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Stopped,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("RESTARTING"), None);
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = TaskRecord::new(Uuid::new_v4());
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.model_id.is_none());
        assert!(record.failure_kind.is_none());
    }
}
