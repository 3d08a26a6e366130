//! Execution and rollback history.
//!
//! Two append-only logs: one of terminal [`ExecutionRecord`]s and one of
//! [`RollbackRecord`]s. An execution record is never rewritten; its
//! `rolled_back` status is derived by joining against the rollback log.

use crate::error::StoreError;
use crate::store::{AppendLog, Appended};
use crate::types::{ExecutionRecord, ExecutionStatus, RollbackRecord};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug)]
pub struct ExecutionStore {
    executions: AppendLog<ExecutionRecord>,
    rollbacks: AppendLog<RollbackRecord>,
}

impl ExecutionStore {
    pub fn new(executions: AppendLog<ExecutionRecord>, rollbacks: AppendLog<RollbackRecord>) -> Self {
        Self {
            executions,
            rollbacks,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(AppendLog::in_memory(), AppendLog::in_memory())
    }

    pub async fn open(executions: &Path, rollbacks: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(
            AppendLog::open(executions).await?,
            AppendLog::open(rollbacks).await?,
        ))
    }

    /// Persist a terminal execution record.
    pub async fn record_execution(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        debug_assert!(record.status.is_terminal());
        self.executions.append(record).await?;
        Ok(())
    }

    /// Persist a rollback record unless the execution already has one.
    ///
    /// Returns `false` when another writer recorded a rollback first.
    pub async fn record_rollback(&self, record: RollbackRecord) -> Result<bool, StoreError> {
        let execution_id = record.execution_id;
        let appended = self
            .rollbacks
            .append_unless(record, |r| r.execution_id == execution_id)
            .await?;
        Ok(matches!(appended, Appended::New(_)))
    }

    /// The execution as currently seen, with `rolled_back` applied.
    pub async fn execution(&self, execution_id: Uuid) -> Option<ExecutionRecord> {
        let mut record = self
            .executions
            .find(|r| r.execution_id == execution_id)
            .await?
            .record;
        if self.is_rolled_back(execution_id).await {
            record.status = ExecutionStatus::RolledBack;
        }
        Some(record)
    }

    /// The execution exactly as it was persisted.
    pub async fn original_execution(&self, execution_id: Uuid) -> Option<ExecutionRecord> {
        self.executions
            .find(|r| r.execution_id == execution_id)
            .await
            .map(|e| e.record)
    }

    pub async fn is_rolled_back(&self, execution_id: Uuid) -> bool {
        self.rollbacks.any(|r| r.execution_id == execution_id).await
    }

    pub async fn rollback_for(&self, execution_id: Uuid) -> Option<RollbackRecord> {
        self.rollbacks
            .find(|r| r.execution_id == execution_id)
            .await
            .map(|e| e.record)
    }

    /// All executions in the order they finished, with derived status.
    pub async fn executions(&self) -> Vec<ExecutionRecord> {
        let rolled_back: Vec<Uuid> = self
            .rollbacks
            .entries()
            .await
            .into_iter()
            .map(|e| e.record.execution_id)
            .collect();
        self.executions
            .entries()
            .await
            .into_iter()
            .map(|e| {
                let mut record = e.record;
                if rolled_back.contains(&record.execution_id) {
                    record.status = ExecutionStatus::RolledBack;
                }
                record
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Parameters, StepOutcome, StepStatus, StepType};
    use chrono::Utc;
    use tempfile::TempDir;

    fn execution() -> ExecutionRecord {
        ExecutionRecord {
            execution_id: Uuid::new_v4(),
            playbook_id: "pb-1".into(),
            playbook_version: "1.0.0".into(),
            playbook_signature: "sig".into(),
            scope: "incident".into(),
            subject_id: "host-42".into(),
            authority_action_id: "act-1".into(),
            explanation_bundle_id: "bundle-1".into(),
            executed_by: "alice".into(),
            step_outcomes: vec![StepOutcome {
                step_id: "isolate".into(),
                step_type: StepType::IsolateHost,
                step_order: 0,
                status: StepStatus::Completed,
                resolved_parameters: Parameters::new(),
                output: Parameters::new(),
                detail: None,
            }],
            status: ExecutionStatus::Completed,
            executed_at: Utc::now(),
        }
    }

    fn rollback_of(record: &ExecutionRecord) -> RollbackRecord {
        RollbackRecord {
            rollback_id: Uuid::new_v4(),
            execution_id: record.execution_id,
            playbook_id: record.playbook_id.clone(),
            playbook_version: record.playbook_version.clone(),
            subject_id: record.subject_id.clone(),
            authority_action_id: "act-2".into(),
            reversed_steps: Vec::new(),
            rolled_back_by: "bob".into(),
            reason: "false positive".into(),
            rolled_back_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_status_derived_from_rollback_log() {
        let store = ExecutionStore::in_memory();
        let record = execution();
        store.record_execution(record.clone()).await.unwrap();
        assert_eq!(
            store.execution(record.execution_id).await.unwrap().status,
            ExecutionStatus::Completed
        );

        let rollback = rollback_of(&record);
        assert!(store.record_rollback(rollback.clone()).await.unwrap());
        assert_eq!(
            store.execution(record.execution_id).await.unwrap().status,
            ExecutionStatus::RolledBack
        );
        assert_eq!(
            store.original_execution(record.execution_id).await.unwrap().status,
            ExecutionStatus::Completed
        );
        assert_eq!(store.rollback_for(record.execution_id).await, Some(rollback));
        assert_eq!(store.executions().await[0].status, ExecutionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_second_rollback_record_is_refused() {
        let store = ExecutionStore::in_memory();
        let record = execution();
        store.record_execution(record.clone()).await.unwrap();

        let first = rollback_of(&record);
        assert!(store.record_rollback(first.clone()).await.unwrap());
        assert!(!store.record_rollback(rollback_of(&record)).await.unwrap());
        assert_eq!(store.rollback_for(record.execution_id).await, Some(first));
    }

    #[tokio::test]
    async fn test_file_backed_reload() {
        let dir = TempDir::new().unwrap();
        let exec_path = dir.path().join("executions.jsonl");
        let rb_path = dir.path().join("rollbacks.jsonl");
        let record = execution();
        {
            let store = ExecutionStore::open(&exec_path, &rb_path).await.unwrap();
            store.record_execution(record.clone()).await.unwrap();
            store.record_rollback(rollback_of(&record)).await.unwrap();
        }
        let store = ExecutionStore::open(&exec_path, &rb_path).await.unwrap();
        assert!(store.is_rolled_back(record.execution_id).await);
        assert!(store.rollback_for(record.execution_id).await.is_some());
        assert!(store.execution(Uuid::new_v4()).await.is_none());
    }
}
