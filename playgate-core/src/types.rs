//! Core type definitions for Playgate.
//!
//! Defines the data structures shared by every component: playbooks and their
//! steps, the frozen step-type set, execution records, and rollback records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Resolved or declared step parameters. Sorted so serialization is stable.
pub type Parameters = BTreeMap<String, String>;

/// The closed set of actions a playbook step may request.
///
/// Adding a variant is a deliberate code change: the validator, the rollback
/// mapping, and every actuator must learn about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    IsolateHost,
    BlockIp,
    DisableAccount,
    SnapshotMemory,
    SnapshotDisk,
    NotifyHuman,
}

impl StepType {
    pub const ALL: [StepType; 6] = [
        StepType::IsolateHost,
        StepType::BlockIp,
        StepType::DisableAccount,
        StepType::SnapshotMemory,
        StepType::SnapshotDisk,
        StepType::NotifyHuman,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::IsolateHost => "isolate_host",
            StepType::BlockIp => "block_ip",
            StepType::DisableAccount => "disable_account",
            StepType::SnapshotMemory => "snapshot_memory",
            StepType::SnapshotDisk => "snapshot_disk",
            StepType::NotifyHuman => "notify_human",
        }
    }

    /// Parameters a step of this type must declare.
    pub fn required_parameters(&self) -> &'static [&'static str] {
        match self {
            StepType::IsolateHost | StepType::SnapshotMemory => &[],
            StepType::BlockIp => &["ip_address"],
            StepType::DisableAccount => &["account_id"],
            StepType::SnapshotDisk => &["disk_path"],
            StepType::NotifyHuman => &["notification_target"],
        }
    }

    /// Parameters filled in at execution time when the playbook omits them.
    pub fn default_parameters(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            StepType::IsolateHost | StepType::SnapshotMemory | StepType::SnapshotDisk => {
                &[("host_id", "${subject_id}")]
            }
            StepType::BlockIp | StepType::DisableAccount | StepType::NotifyHuman => &[],
        }
    }

    /// The counterpart action used when rolling this step back.
    pub fn rollback_action(&self) -> RollbackAction {
        match self {
            StepType::IsolateHost => RollbackAction::RestoreHost,
            StepType::BlockIp => RollbackAction::UnblockIp,
            StepType::DisableAccount => RollbackAction::EnableAccount,
            StepType::SnapshotMemory | StepType::SnapshotDisk => RollbackAction::DeleteSnapshot,
            StepType::NotifyHuman => RollbackAction::NoRollback,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// A single declarative step of a playbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub step_type: StepType,
    pub step_order: u32,
    #[serde(default)]
    pub parameters: Parameters,
}

/// A declarative, signed incident-response playbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playbook {
    pub playbook_id: String,
    pub playbook_name: String,
    pub playbook_version: String,
    pub scope: String,
    pub steps: Vec<Step>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook_key_id: Option<String>,
}

impl Playbook {
    /// The registry key for this playbook.
    pub fn key(&self) -> (String, String) {
        (self.playbook_id.clone(), self.playbook_version.clone())
    }

    pub fn is_signed(&self) -> bool {
        self.playbook_signature.is_some() && self.playbook_key_id.is_some()
    }
}

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    /// Whether the execution reached a terminal outcome that may be rolled back.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::InProgress => write!(f, "in_progress"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Outcome of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Recorded result of one step. Carries no timestamps or durations so that
/// replays of the same inputs serialize identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub step_type: StepType,
    pub step_order: u32,
    pub status: StepStatus,
    pub resolved_parameters: Parameters,
    /// Values the actuator reported back, such as where a snapshot was stored.
    #[serde(default, skip_serializing_if = "Parameters::is_empty")]
    pub output: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Immutable record of one playbook execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub playbook_id: String,
    pub playbook_version: String,
    pub playbook_signature: String,
    pub scope: String,
    pub subject_id: String,
    pub authority_action_id: String,
    pub explanation_bundle_id: String,
    pub executed_by: String,
    pub step_outcomes: Vec<StepOutcome>,
    pub status: ExecutionStatus,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Steps that reached `completed`, in execution order.
    pub fn completed_steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.step_outcomes
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
    }
}

/// Counterpart action produced when rolling a step back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackAction {
    RestoreHost,
    UnblockIp,
    EnableAccount,
    DeleteSnapshot,
    NoRollback,
}

impl RollbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackAction::RestoreHost => "restore_host",
            RollbackAction::UnblockIp => "unblock_ip",
            RollbackAction::EnableAccount => "enable_account",
            RollbackAction::DeleteSnapshot => "delete_snapshot",
            RollbackAction::NoRollback => "no_rollback",
        }
    }

    pub fn is_reversible(&self) -> bool {
        !matches!(self, RollbackAction::NoRollback)
    }

    /// Parameters the reversal needs, taken from the original step's actuator
    /// output or, failing that, its resolved parameters. All are required.
    pub fn parameter_keys(&self) -> &'static [&'static str] {
        match self {
            RollbackAction::RestoreHost => &["host_id"],
            RollbackAction::UnblockIp => &["ip_address"],
            RollbackAction::EnableAccount => &["account_id"],
            RollbackAction::DeleteSnapshot => &["snapshot_location"],
            RollbackAction::NoRollback => &[],
        }
    }
}

impl fmt::Display for RollbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of reversing one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReversalStatus {
    Reverted,
    ReversalFailed,
    NoOp,
}

/// One entry of a rollback, mirroring a completed step of the execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversedStep {
    pub step_id: String,
    pub step_type: StepType,
    pub step_order: u32,
    pub rollback_action: RollbackAction,
    pub rollback_parameters: Parameters,
    pub status: ReversalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Immutable record of a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub rollback_id: Uuid,
    pub execution_id: Uuid,
    pub playbook_id: String,
    pub playbook_version: String,
    pub subject_id: String,
    pub authority_action_id: String,
    pub reversed_steps: Vec<ReversedStep>,
    pub rolled_back_by: String,
    pub reason: String,
    pub rolled_back_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_type_roundtrip_names() {
        for t in StepType::ALL {
            assert_eq!(t.as_str().parse::<StepType>().unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
        assert!("run_shell".parse::<StepType>().is_err());
    }

    #[test]
    fn test_rollback_mapping() {
        assert_eq!(StepType::IsolateHost.rollback_action(), RollbackAction::RestoreHost);
        assert_eq!(StepType::BlockIp.rollback_action(), RollbackAction::UnblockIp);
        assert_eq!(StepType::SnapshotDisk.rollback_action(), RollbackAction::DeleteSnapshot);
        assert!(!StepType::NotifyHuman.rollback_action().is_reversible());
    }

    #[test]
    fn test_execution_status_serialization() {
        let json = serde_json::to_string(&ExecutionStatus::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");
        assert_eq!(ExecutionStatus::InProgress.to_string(), "in_progress");
    }
}
