//! In-memory ledger and recorder.
//!
//! Backs the single-process CLI mode and the test suite. Same
//! transition rules as the Postgres implementation; a `tokio` RwLock
//! stands in for row-level locking.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::FailureKind;
use crate::store::BlobRef;

use super::{
    ExecutionRecord, LedgerError, ModelRecord, ResultRecorder, TaskLedger, TaskRecord, TaskStatus,
};

/// In-memory `TaskLedger`.
#[derive(Default)]
pub struct MemoryTaskLedger {
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
}

impl MemoryTaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, id: Uuid, to: TaskStatus, apply: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(&id).ok_or(LedgerError::TaskNotFound(id))?;

        if !record.status.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition {
                task: id,
                from: record.status,
                to,
            });
        }

        record.status = to;
        record.updated_at = Utc::now();
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl TaskLedger for MemoryTaskLedger {
    async fn create(&self) -> Result<TaskRecord, LedgerError> {
        let record = TaskRecord::new(Uuid::new_v4());
        self.tasks.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<TaskRecord, LedgerError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(LedgerError::TaskNotFound(id))
    }

    async fn transition(&self, id: Uuid, to: TaskStatus) -> Result<(), LedgerError> {
        self.update(id, to, |_| {}).await
    }

    async fn record_completion(
        &self,
        id: Uuid,
        model_id: Option<Uuid>,
        execution_id: Option<Uuid>,
    ) -> Result<(), LedgerError> {
        self.update(id, TaskStatus::Completed, |record| {
            record.model_id = model_id;
            record.execution_id = execution_id;
        })
        .await
    }

    async fn record_failure(
        &self,
        id: Uuid,
        kind: FailureKind,
        detail: &str,
    ) -> Result<(), LedgerError> {
        self.update(id, TaskStatus::Failed, |record| {
            record.failure_kind = Some(kind);
            record.failure_detail = Some(detail.to_string());
        })
        .await
    }

    async fn record_stopped(&self, id: Uuid, detail: &str) -> Result<(), LedgerError> {
        self.update(id, TaskStatus::Stopped, |record| {
            record.failure_kind = Some(FailureKind::Cancelled);
            record.failure_detail = Some(detail.to_string());
        })
        .await
    }
}

/// In-memory `ResultRecorder`.
#[derive(Default)]
pub struct MemoryResultRecorder {
    models: RwLock<HashMap<Uuid, ModelRecord>>,
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
}

impl MemoryResultRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: registers a pre-existing model record.
    pub async fn insert_model(&self, record: ModelRecord) {
        self.models.write().await.insert(record.id, record);
    }

    /// Test hook: fetches an execution record.
    pub async fn get_execution(&self, id: Uuid) -> Option<ExecutionRecord> {
        self.executions.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl ResultRecorder for MemoryResultRecorder {
    async fn create_model(
        &self,
        task_id: Uuid,
        model_blob: BlobRef,
        metrics_blob: BlobRef,
        header_blob: Option<BlobRef>,
        class_labels: Option<Vec<String>>,
    ) -> Result<Uuid, LedgerError> {
        let record = ModelRecord {
            id: Uuid::new_v4(),
            task_id,
            model_blob,
            metrics_blob,
            header_blob,
            class_labels,
            created_at: Utc::now(),
        };
        let id = record.id;
        self.models.write().await.insert(id, record);
        Ok(id)
    }

    async fn create_execution(
        &self,
        task_id: Uuid,
        predictions_blob: BlobRef,
        metadata_blob: BlobRef,
    ) -> Result<Uuid, LedgerError> {
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            task_id,
            predictions_blob,
            metadata_blob,
            created_at: Utc::now(),
        };
        let id = record.id;
        self.executions.write().await.insert(id, record);
        Ok(id)
    }

    async fn get_model(&self, id: Uuid) -> Result<ModelRecord, LedgerError> {
        self.models
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(LedgerError::ModelNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Bucket;

    fn blob(bucket: Bucket) -> BlobRef {
        BlobRef {
            bucket,
            key: Uuid::new_v4(),
            size_bytes: 1,
            sha256: "00".repeat(32),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let ledger = MemoryTaskLedger::new();
        let record = ledger.create().await.unwrap();

        let fetched = ledger.get(record.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_get_unknown_task() {
        let ledger = MemoryTaskLedger::new();
        assert!(matches!(
            ledger.get(Uuid::new_v4()).await,
            Err(LedgerError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let ledger = MemoryTaskLedger::new();
        let record = ledger.create().await.unwrap();
        let model_id = Uuid::new_v4();

        ledger.transition(record.id, TaskStatus::Running).await.unwrap();
        ledger
            .record_completion(record.id, Some(model_id), None)
            .await
            .unwrap();

        let fetched = ledger.get(record.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.model_id, Some(model_id));
        assert!(fetched.updated_at >= fetched.created_at);
    }

    #[tokio::test]
    async fn test_terminal_state_rejects_updates() {
        let ledger = MemoryTaskLedger::new();
        let record = ledger.create().await.unwrap();

        ledger.transition(record.id, TaskStatus::Running).await.unwrap();
        ledger
            .record_failure(record.id, FailureKind::SetupFailure, "boom")
            .await
            .unwrap();

        // No resurrecting a failed task.
        let err = ledger
            .transition(record.id, TaskStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_stop_records_cancelled_kind() {
        let ledger = MemoryTaskLedger::new();
        let record = ledger.create().await.unwrap();

        ledger.record_stopped(record.id, "stopped by user").await.unwrap();

        let fetched = ledger.get(record.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Stopped);
        assert_eq!(fetched.failure_kind, Some(FailureKind::Cancelled));
    }

    #[tokio::test]
    async fn test_recorder_round_trip() {
        let recorder = MemoryResultRecorder::new();
        let task_id = Uuid::new_v4();

        let model_id = recorder
            .create_model(
                task_id,
                blob(Bucket::Models),
                blob(Bucket::Metrics),
                None,
                Some(vec!["yes".to_string(), "no".to_string()]),
            )
            .await
            .unwrap();

        let model = recorder.get_model(model_id).await.unwrap();
        assert_eq!(model.task_id, task_id);
        assert_eq!(model.class_labels.as_deref(), Some(&["yes".to_string(), "no".to_string()][..]));

        let exec_id = recorder
            .create_execution(task_id, blob(Bucket::Predictions), blob(Bucket::Metadata))
            .await
            .unwrap();
        assert!(recorder.get_execution(exec_id).await.is_some());
    }
}
