//! Execution engine.
//!
//! Runs a registered playbook against one subject. Admission is fail-closed:
//! the playbook must exist and re-verify, the authority action must cover the
//! playbook's scope and the subject right now, and the explanation bundle must
//! exist. Only then do steps run, one at a time, in `step_order`.
//!
//! A failing, timed-out, or unsupported step stops the run; the remaining
//! steps are recorded as `skipped`. Nothing is retried.

use crate::actuator::{ActuatorOutcome, ActuatorSet};
use crate::error::{ConflictError, PlaygateError, Result};
use crate::audit::AuditOutbox;
use crate::ledger::{LedgerActionType, LedgerEntry, LedgerSubject};
use crate::records::ExecutionStore;
use crate::references::{self, AuthorityStore, ExplanationStore};
use crate::registry::PlaybookRegistry;
use crate::substitution::{self, SubstitutionContext};
use crate::types::{
    ExecutionRecord, ExecutionStatus, Parameters, Playbook, Step, StepOutcome, StepStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const COMPONENT: &str = "execution_engine";

/// Default per-step actuator timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to start one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub playbook_id: String,
    pub playbook_version: String,
    pub subject_id: String,
    pub authority_action_id: String,
    pub explanation_bundle_id: String,
    pub executed_by: String,
}

/// Apply per-type defaults for absent keys, then resolve substitutions.
pub fn resolve_parameters(step: &Step, ctx: &SubstitutionContext) -> Parameters {
    let mut parameters = step.parameters.clone();
    for (key, value) in step.step_type.default_parameters() {
        parameters
            .entry((*key).to_string())
            .or_insert_with(|| (*value).to_string());
    }
    parameters
        .into_iter()
        .map(|(key, value)| {
            let resolved = substitution::resolve(&value, ctx);
            (key, resolved)
        })
        .collect()
}

/// Subjects with an execution currently running.
#[derive(Debug, Default)]
struct InFlight {
    subjects: Mutex<HashSet<String>>,
}

impl InFlight {
    fn claim(&self, subject_id: &str) -> Option<SubjectClaim<'_>> {
        let mut subjects = self.subjects.lock().unwrap_or_else(|e| e.into_inner());
        if subjects.insert(subject_id.to_string()) {
            Some(SubjectClaim {
                owner: self,
                subject_id: subject_id.to_string(),
            })
        } else {
            None
        }
    }
}

/// Releases the subject when dropped, including on early return.
struct SubjectClaim<'a> {
    owner: &'a InFlight,
    subject_id: String,
}

impl Drop for SubjectClaim<'_> {
    fn drop(&mut self) {
        let mut subjects = self.owner.subjects.lock().unwrap_or_else(|e| e.into_inner());
        subjects.remove(&self.subject_id);
    }
}

pub struct ExecutionEngine {
    registry: Arc<PlaybookRegistry>,
    authority: Arc<dyn AuthorityStore>,
    explanations: Arc<dyn ExplanationStore>,
    actuators: ActuatorSet,
    audit: Arc<AuditOutbox>,
    records: Arc<ExecutionStore>,
    step_timeout: Duration,
    in_flight: InFlight,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<PlaybookRegistry>,
        authority: Arc<dyn AuthorityStore>,
        explanations: Arc<dyn ExplanationStore>,
        actuators: ActuatorSet,
        audit: Arc<AuditOutbox>,
        records: Arc<ExecutionStore>,
    ) -> Self {
        Self {
            registry,
            authority,
            explanations,
            actuators,
            audit,
            records,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            in_flight: InFlight::default(),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    pub fn records(&self) -> &Arc<ExecutionStore> {
        &self.records
    }

    /// Execute a registered playbook.
    ///
    /// Returns the persisted record for both `completed` and `failed` runs.
    /// An `Err` means nothing ran and no record exists, except for a ledger
    /// error after the run: the record is then persisted and its audit entry
    /// is parked for redelivery.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionRecord> {
        let playbook = match self.admit(request).await {
            Ok(playbook) => playbook,
            Err(err) => {
                self.reject(request, &err).await;
                return Err(err);
            }
        };

        let Some(_claim) = self.in_flight.claim(&request.subject_id) else {
            let err: PlaygateError = ConflictError::SubjectBusy {
                subject_id: request.subject_id.clone(),
            }
            .into();
            self.reject(request, &err).await;
            return Err(err);
        };

        info!(
            playbook_id = %playbook.playbook_id,
            version = %playbook.playbook_version,
            subject_id = %request.subject_id,
            steps = playbook.steps.len(),
            "Executing playbook"
        );

        let step_outcomes = self.run_steps(&playbook, request).await;
        let status = if step_outcomes.iter().all(|s| s.status == StepStatus::Completed) {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };

        let record = ExecutionRecord {
            execution_id: Uuid::new_v4(),
            playbook_id: playbook.playbook_id.clone(),
            playbook_version: playbook.playbook_version.clone(),
            playbook_signature: playbook.playbook_signature.clone().unwrap_or_default(),
            scope: playbook.scope.clone(),
            subject_id: request.subject_id.clone(),
            authority_action_id: request.authority_action_id.clone(),
            explanation_bundle_id: request.explanation_bundle_id.clone(),
            executed_by: request.executed_by.clone(),
            step_outcomes,
            status,
            executed_at: Utc::now(),
        };

        self.records.record_execution(record.clone()).await?;
        self.audit
            .submit(LedgerEntry::new(
                COMPONENT,
                LedgerActionType::PlaybookExecuted,
                LedgerSubject::new("execution", record.execution_id.to_string()),
                &record.executed_by,
                json!({
                    "playbook_id": record.playbook_id,
                    "playbook_version": record.playbook_version,
                    "subject_id": record.subject_id,
                    "authority_action_id": record.authority_action_id,
                    "explanation_bundle_id": record.explanation_bundle_id,
                    "execution_status": record.status,
                }),
            ))
            .await?;

        info!(
            execution_id = %record.execution_id,
            status = %record.status,
            "Playbook execution finished"
        );
        Ok(record)
    }

    /// Preconditions, in order. The first failure wins.
    async fn admit(&self, request: &ExecutionRequest) -> Result<Playbook> {
        let playbook = self
            .registry
            .get(&request.playbook_id, &request.playbook_version)
            .await?;

        self.registry.verifier().verify(&playbook).await?;

        references::authorize(
            self.authority.as_ref(),
            &request.authority_action_id,
            &playbook.scope,
            &request.subject_id,
            Utc::now(),
        )
        .await?;

        references::require_bundle(self.explanations.as_ref(), &request.explanation_bundle_id)
            .await?;

        Ok(playbook)
    }

    async fn run_steps(&self, playbook: &Playbook, request: &ExecutionRequest) -> Vec<StepOutcome> {
        let ctx = SubstitutionContext {
            subject_id: request.subject_id.clone(),
            playbook_id: playbook.playbook_id.clone(),
            playbook_version: playbook.playbook_version.clone(),
            executed_by: request.executed_by.clone(),
        };

        let mut steps: Vec<&Step> = playbook.steps.iter().collect();
        steps.sort_by_key(|s| s.step_order);

        let mut outcomes = Vec::with_capacity(steps.len());
        let mut halted = false;
        for step in steps {
            let resolved_parameters = resolve_parameters(step, &ctx);

            if halted {
                outcomes.push(StepOutcome {
                    step_id: step.step_id.clone(),
                    step_type: step.step_type,
                    step_order: step.step_order,
                    status: StepStatus::Skipped,
                    resolved_parameters,
                    output: Parameters::new(),
                    detail: None,
                });
                continue;
            }

            let outcome = self.perform(step, &resolved_parameters).await;
            let status = if outcome.is_success() {
                StepStatus::Completed
            } else {
                halted = true;
                warn!(step_id = %step.step_id, detail = %outcome.detail, "Step failed, halting execution");
                StepStatus::Failed
            };
            debug!(step_id = %step.step_id, step_type = %step.step_type, status = %status, "Step finished");

            outcomes.push(StepOutcome {
                step_id: step.step_id.clone(),
                step_type: step.step_type,
                step_order: step.step_order,
                status,
                resolved_parameters,
                output: outcome.output,
                detail: Some(outcome.detail),
            });
        }
        outcomes
    }

    async fn perform(&self, step: &Step, parameters: &Parameters) -> ActuatorOutcome {
        let Some(actuator) = self.actuators.get(step.step_type) else {
            return ActuatorOutcome::failure(format!(
                "no actuator registered for step type '{}'",
                step.step_type
            ));
        };

        match tokio::time::timeout(
            self.step_timeout,
            actuator.perform(step.step_type, parameters, self.step_timeout),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ActuatorOutcome::failure(format!(
                "step timed out after {} ms",
                self.step_timeout.as_millis()
            )),
        }
    }

    async fn reject(&self, request: &ExecutionRequest, err: &PlaygateError) {
        warn!(
            playbook_id = %request.playbook_id,
            subject_id = %request.subject_id,
            kind = %err.kind(),
            error = %err,
            "Execution rejected"
        );
        let entry = LedgerEntry::new(
            COMPONENT,
            LedgerActionType::ExecutionRejected,
            LedgerSubject::new("playbook", &request.playbook_id),
            &request.executed_by,
            json!({
                "playbook_id": request.playbook_id,
                "playbook_version": request.playbook_version,
                "subject_id": request.subject_id,
                "authority_action_id": request.authority_action_id,
                "explanation_bundle_id": request.explanation_bundle_id,
                "error_kind": err.kind(),
                "reason": err.to_string(),
            }),
        );
        if let Err(ledger_err) = self.audit.submit(entry).await {
            error!(error = %ledger_err, "Failed to record execution rejection in audit ledger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepType;

    fn ctx() -> SubstitutionContext {
        SubstitutionContext {
            subject_id: "host-42".into(),
            playbook_id: "pb-1".into(),
            playbook_version: "1.0.0".into(),
            executed_by: "alice".into(),
        }
    }

    fn step(step_type: StepType, params: &[(&str, &str)]) -> Step {
        Step {
            step_id: "s".into(),
            step_type,
            step_order: 0,
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_host_id_defaults_to_subject() {
        let resolved = resolve_parameters(&step(StepType::IsolateHost, &[]), &ctx());
        assert_eq!(resolved["host_id"], "host-42");
    }

    #[test]
    fn test_explicit_parameter_beats_default() {
        let resolved = resolve_parameters(
            &step(StepType::SnapshotDisk, &[("host_id", "db-1"), ("disk_path", "/dev/sda")]),
            &ctx(),
        );
        assert_eq!(resolved["host_id"], "db-1");
        assert_eq!(resolved["disk_path"], "/dev/sda");
    }

    #[test]
    fn test_substitution_in_parameters() {
        let resolved = resolve_parameters(
            &step(
                StepType::NotifyHuman,
                &[
                    ("notification_target", "soc"),
                    ("notification_message", "${executed_by} ran ${playbook_id}@${playbook_version}"),
                ],
            ),
            &ctx(),
        );
        assert_eq!(resolved["notification_message"], "alice ran pb-1@1.0.0");
        assert!(!resolved.contains_key("host_id"));
    }

    #[test]
    fn test_subject_claim_released_on_drop() {
        let in_flight = InFlight::default();
        let claim = in_flight.claim("host-42").unwrap();
        assert!(in_flight.claim("host-42").is_none());
        assert!(in_flight.claim("host-7").is_some());
        drop(claim);
        assert!(in_flight.claim("host-42").is_some());
    }
}
