//! Rollback engine.
//!
//! Reverses the steps of a terminal execution that actually completed, last
//! first. Reversal is best-effort: a failed reversal is recorded and the
//! remaining reversals still run. The rollback record is always written in
//! full.
//!
//! Rollbacks of one execution are serialized; rollbacks of different
//! executions run side by side.

use crate::actuator::{ActuatorOutcome, ActuatorSet};
use crate::error::{ConflictError, ImmutabilityError, NotFoundError, PlaygateError, Result};
use crate::audit::AuditOutbox;
use crate::ledger::{LedgerActionType, LedgerEntry, LedgerSubject};
use crate::records::ExecutionStore;
use crate::references::{self, AuthorityStore};
use crate::types::{
    ExecutionRecord, Parameters, ReversalStatus, ReversedStep, RollbackAction, RollbackRecord,
    StepType,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const COMPONENT: &str = "rollback_engine";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub execution_id: Uuid,
    pub authority_action_id: String,
    pub rolled_back_by: String,
    pub reason: String,
}

/// One reversal to perform, derived from a completed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedReversal {
    pub step_id: String,
    pub step_type: StepType,
    pub step_order: u32,
    pub rollback_action: RollbackAction,
    pub rollback_parameters: Parameters,
}

/// Completed steps of `record`, in reverse order, mapped to their counterparts.
///
/// Failed and skipped steps never ran to completion and are not reversed.
/// A rollback parameter comes from the step's actuator output when present,
/// otherwise from its resolved parameters.
pub fn plan_reversal(record: &ExecutionRecord) -> Vec<PlannedReversal> {
    let mut completed: Vec<_> = record.completed_steps().collect();
    completed.sort_by_key(|s| std::cmp::Reverse(s.step_order));

    completed
        .into_iter()
        .map(|step| {
            let rollback_action = step.step_type.rollback_action();
            let rollback_parameters = rollback_action
                .parameter_keys()
                .iter()
                .filter_map(|key| {
                    step.output
                        .get(*key)
                        .or_else(|| step.resolved_parameters.get(*key))
                        .filter(|value| !value.is_empty())
                        .map(|value| ((*key).to_string(), value.clone()))
                })
                .collect();
            PlannedReversal {
                step_id: step.step_id.clone(),
                step_type: step.step_type,
                step_order: step.step_order,
                rollback_action,
                rollback_parameters,
            }
        })
        .collect()
}

impl PlannedReversal {
    /// Required rollback parameters the plan could not fill.
    pub fn missing_parameters(&self) -> Vec<&'static str> {
        self.rollback_action
            .parameter_keys()
            .iter()
            .copied()
            .filter(|key| !self.rollback_parameters.contains_key(*key))
            .collect()
    }
}

/// One async mutex per execution with a rollback in progress.
#[derive(Debug, Default)]
struct ExecutionLocks {
    locks: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ExecutionLocks {
    async fn lock(&self, execution_id: Uuid) -> ExecutionGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(execution_id).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        ExecutionGuard {
            owner: self,
            execution_id,
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Holds one execution's lock; drops the map entry once nobody waits on it.
struct ExecutionGuard<'a> {
    owner: &'a ExecutionLocks,
    execution_id: Uuid,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.owner.locks.lock().unwrap_or_else(|e| e.into_inner());
        // The map and this guard are the only holders: no one is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.execution_id);
        }
    }
}

pub struct RollbackEngine {
    authority: Arc<dyn AuthorityStore>,
    actuators: ActuatorSet,
    audit: Arc<AuditOutbox>,
    records: Arc<ExecutionStore>,
    step_timeout: Duration,
    locks: ExecutionLocks,
}

impl RollbackEngine {
    pub fn new(
        authority: Arc<dyn AuthorityStore>,
        actuators: ActuatorSet,
        audit: Arc<AuditOutbox>,
        records: Arc<ExecutionStore>,
    ) -> Self {
        Self {
            authority,
            actuators,
            audit,
            records,
            step_timeout: crate::engine::DEFAULT_STEP_TIMEOUT,
            locks: ExecutionLocks::default(),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Roll back a terminal execution.
    ///
    /// Of two concurrent requests for the same execution exactly one
    /// succeeds and the other sees `AlreadyRolledBack`.
    pub async fn rollback(&self, request: &RollbackRequest) -> Result<RollbackRecord> {
        let _guard = self.locks.lock(request.execution_id).await;

        let execution = match self.admit(request).await {
            Ok(execution) => execution,
            Err(err) => {
                self.reject(request, &err).await;
                return Err(err);
            }
        };

        info!(
            execution_id = %execution.execution_id,
            playbook_id = %execution.playbook_id,
            "Rolling back execution"
        );

        let mut reversed_steps = Vec::new();
        for planned in plan_reversal(&execution) {
            reversed_steps.push(self.reverse(planned).await);
        }

        let record = RollbackRecord {
            rollback_id: Uuid::new_v4(),
            execution_id: execution.execution_id,
            playbook_id: execution.playbook_id.clone(),
            playbook_version: execution.playbook_version.clone(),
            subject_id: execution.subject_id.clone(),
            authority_action_id: request.authority_action_id.clone(),
            reversed_steps,
            rolled_back_by: request.rolled_back_by.clone(),
            reason: request.reason.clone(),
            rolled_back_at: Utc::now(),
        };

        if !self.records.record_rollback(record.clone()).await? {
            warn!(
                execution_id = %record.execution_id,
                "Another writer recorded a rollback first, discarding this one"
            );
            let err: PlaygateError = ImmutabilityError::AlreadyRolledBack {
                execution_id: record.execution_id.to_string(),
            }
            .into();
            self.reject(request, &err).await;
            return Err(err);
        }

        let failed = record
            .reversed_steps
            .iter()
            .filter(|s| s.status == ReversalStatus::ReversalFailed)
            .count();
        self.audit
            .submit(LedgerEntry::new(
                COMPONENT,
                LedgerActionType::PlaybookRolledBack,
                LedgerSubject::new("execution", record.execution_id.to_string()),
                &record.rolled_back_by,
                json!({
                    "rollback_id": record.rollback_id,
                    "playbook_id": record.playbook_id,
                    "playbook_version": record.playbook_version,
                    "subject_id": record.subject_id,
                    "authority_action_id": record.authority_action_id,
                    "rollback_reason": record.reason,
                    "reversed_steps": record.reversed_steps.len(),
                    "failed_reversals": failed,
                }),
            ))
            .await?;

        info!(
            rollback_id = %record.rollback_id,
            execution_id = %record.execution_id,
            failed_reversals = failed,
            "Rollback recorded"
        );
        Ok(record)
    }

    async fn admit(&self, request: &RollbackRequest) -> Result<ExecutionRecord> {
        let execution = self
            .records
            .original_execution(request.execution_id)
            .await
            .ok_or_else(|| NotFoundError::Execution {
                execution_id: request.execution_id.to_string(),
            })?;

        if !execution.status.is_terminal() {
            return Err(ConflictError::NotTerminal {
                execution_id: request.execution_id.to_string(),
                status: execution.status.to_string(),
            }
            .into());
        }

        if self.records.is_rolled_back(request.execution_id).await {
            return Err(ImmutabilityError::AlreadyRolledBack {
                execution_id: request.execution_id.to_string(),
            }
            .into());
        }

        references::authorize(
            self.authority.as_ref(),
            &request.authority_action_id,
            &execution.scope,
            &execution.subject_id,
            Utc::now(),
        )
        .await?;

        Ok(execution)
    }

    async fn reverse(&self, planned: PlannedReversal) -> ReversedStep {
        let (status, detail) = if !planned.rollback_action.is_reversible() {
            info!(
                step_id = %planned.step_id,
                step_type = %planned.step_type,
                "Step has no rollback counterpart, recording no-op"
            );
            (
                ReversalStatus::NoOp,
                format!("{} has no rollback counterpart", planned.step_type),
            )
        } else if let Some(key) = planned.missing_parameters().first().copied() {
            warn!(
                step_id = %planned.step_id,
                action = %planned.rollback_action,
                parameter = key,
                "Reversal parameter unavailable, not calling actuator"
            );
            (
                ReversalStatus::ReversalFailed,
                format!("missing rollback parameter '{key}'"),
            )
        } else {
            let outcome = self.call_actuator(&planned).await;
            if outcome.is_success() {
                (ReversalStatus::Reverted, outcome.detail)
            } else {
                warn!(
                    step_id = %planned.step_id,
                    action = %planned.rollback_action,
                    detail = %outcome.detail,
                    "Reversal failed, continuing with remaining steps"
                );
                (ReversalStatus::ReversalFailed, outcome.detail)
            }
        };

        ReversedStep {
            step_id: planned.step_id,
            step_type: planned.step_type,
            step_order: planned.step_order,
            rollback_action: planned.rollback_action,
            rollback_parameters: planned.rollback_parameters,
            status,
            detail: Some(detail),
        }
    }

    async fn call_actuator(&self, planned: &PlannedReversal) -> ActuatorOutcome {
        let Some(actuator) = self.actuators.get(planned.step_type) else {
            return ActuatorOutcome::failure(format!(
                "no actuator registered for step type '{}'",
                planned.step_type
            ));
        };
        match tokio::time::timeout(
            self.step_timeout,
            actuator.reverse(
                planned.rollback_action,
                &planned.rollback_parameters,
                self.step_timeout,
            ),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ActuatorOutcome::failure(format!(
                "reversal timed out after {} ms",
                self.step_timeout.as_millis()
            )),
        }
    }

    async fn reject(&self, request: &RollbackRequest, err: &PlaygateError) {
        warn!(
            execution_id = %request.execution_id,
            kind = %err.kind(),
            error = %err,
            "Rollback rejected"
        );
        let entry = LedgerEntry::new(
            COMPONENT,
            LedgerActionType::RollbackRejected,
            LedgerSubject::new("execution", request.execution_id.to_string()),
            &request.rolled_back_by,
            json!({
                "execution_id": request.execution_id,
                "authority_action_id": request.authority_action_id,
                "error_kind": err.kind(),
                "reason": err.to_string(),
            }),
        );
        if let Err(ledger_err) = self.audit.submit(entry).await {
            error!(error = %ledger_err, "Failed to record rollback rejection in audit ledger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionStatus, StepOutcome, StepStatus};

    fn outcome(order: u32, step_type: StepType, status: StepStatus, params: &[(&str, &str)]) -> StepOutcome {
        StepOutcome {
            step_id: format!("s{order}"),
            step_type,
            step_order: order,
            status,
            resolved_parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            output: Parameters::new(),
            detail: None,
        }
    }

    fn record(step_outcomes: Vec<StepOutcome>) -> ExecutionRecord {
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
            step_outcomes,
            status: ExecutionStatus::Failed,
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn test_plan_reverses_completed_steps_only() {
        let rec = record(vec![
            outcome(0, StepType::IsolateHost, StepStatus::Completed, &[("host_id", "host-42")]),
            outcome(1, StepType::BlockIp, StepStatus::Completed, &[("ip_address", "10.0.0.9"), ("block_duration", "1h")]),
            outcome(2, StepType::DisableAccount, StepStatus::Failed, &[("account_id", "bob")]),
            outcome(3, StepType::NotifyHuman, StepStatus::Skipped, &[]),
        ]);
        let plan = plan_reversal(&rec);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].rollback_action, RollbackAction::UnblockIp);
        assert_eq!(plan[0].rollback_parameters.len(), 1);
        assert_eq!(plan[0].rollback_parameters["ip_address"], "10.0.0.9");
        assert_eq!(plan[1].rollback_action, RollbackAction::RestoreHost);
        assert_eq!(plan[1].rollback_parameters["host_id"], "host-42");
    }

    #[test]
    fn test_plan_snapshot_uses_location() {
        let rec = record(vec![outcome(
            0,
            StepType::SnapshotMemory,
            StepStatus::Completed,
            &[("host_id", "host-42"), ("snapshot_location", "s3://forensics/1")],
        )]);
        let plan = plan_reversal(&rec);
        assert_eq!(plan[0].rollback_action, RollbackAction::DeleteSnapshot);
        assert_eq!(plan[0].rollback_parameters["snapshot_location"], "s3://forensics/1");
        assert!(!plan[0].rollback_parameters.contains_key("host_id"));
    }

    #[test]
    fn test_plan_prefers_actuator_output() {
        let mut snapshot = outcome(
            0,
            StepType::SnapshotDisk,
            StepStatus::Completed,
            &[("host_id", "host-42"), ("disk_path", "/dev/sda")],
        );
        snapshot
            .output
            .insert("snapshot_location".into(), "s3://forensics/2".into());
        let plan = plan_reversal(&record(vec![snapshot]));
        assert_eq!(plan[0].rollback_parameters["snapshot_location"], "s3://forensics/2");
        assert!(plan[0].missing_parameters().is_empty());
    }

    #[test]
    fn test_plan_reports_missing_location() {
        let rec = record(vec![outcome(
            0,
            StepType::SnapshotDisk,
            StepStatus::Completed,
            &[("host_id", "host-42"), ("disk_path", "/dev/sda"), ("snapshot_location", "")],
        )]);
        let plan = plan_reversal(&rec);
        assert!(plan[0].rollback_parameters.is_empty());
        assert_eq!(plan[0].missing_parameters(), vec!["snapshot_location"]);
    }

    #[tokio::test]
    async fn test_execution_locks_are_per_id_and_released() {
        let locks = ExecutionLocks::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let held = locks.lock(a).await;
        // A different execution is not blocked by `a`.
        let other = tokio::time::timeout(Duration::from_millis(100), locks.lock(b))
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);

        // The same execution is.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), locks.lock(a))
                .await
                .is_err()
        );

        drop(other);
        drop(held);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_plan_empty_when_nothing_completed() {
        let rec = record(vec![outcome(0, StepType::BlockIp, StepStatus::Failed, &[])]);
        assert!(plan_reversal(&rec).is_empty());
    }
}
