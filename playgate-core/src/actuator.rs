//! Actuator seam.
//!
//! Steps never touch the outside world themselves. The engine hands each
//! step's resolved parameters to the [`Actuator`] registered for its step
//! type and records whatever comes back, verbatim.

use crate::types::{Parameters, RollbackAction, StepType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorStatus {
    Success,
    Failure,
}

/// What an actuator reports for one call.
///
/// `output` carries values a later reversal depends on, for example the
/// `snapshot_location` of a snapshot it took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorOutcome {
    pub status: ActuatorStatus,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Parameters::is_empty")]
    pub output: Parameters,
}

impl ActuatorOutcome {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            status: ActuatorStatus::Success,
            detail: detail.into(),
            output: Parameters::new(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            status: ActuatorStatus::Failure,
            detail: detail.into(),
            output: Parameters::new(),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.output.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActuatorStatus::Success
    }
}

/// Performs step effects and their rollback counterparts.
///
/// `timeout` is advisory for the implementation; the engine enforces it
/// independently.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn perform(
        &self,
        step_type: StepType,
        parameters: &Parameters,
        timeout: Duration,
    ) -> ActuatorOutcome;

    async fn reverse(
        &self,
        action: RollbackAction,
        _parameters: &Parameters,
        _timeout: Duration,
    ) -> ActuatorOutcome {
        ActuatorOutcome::failure(format!(
            "reversal '{action}' not supported by this actuator"
        ))
    }
}

/// One actuator per step type.
#[derive(Clone, Default)]
pub struct ActuatorSet {
    actuators: HashMap<StepType, Arc<dyn Actuator>>,
}

impl ActuatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same actuator for every step type.
    pub fn uniform(actuator: Arc<dyn Actuator>) -> Self {
        let mut set = Self::new();
        for step_type in StepType::ALL {
            set.register(step_type, actuator.clone());
        }
        set
    }

    pub fn register(&mut self, step_type: StepType, actuator: Arc<dyn Actuator>) {
        self.actuators.insert(step_type, actuator);
    }

    pub fn with(mut self, step_type: StepType, actuator: Arc<dyn Actuator>) -> Self {
        self.register(step_type, actuator);
        self
    }

    pub fn get(&self, step_type: StepType) -> Option<&Arc<dyn Actuator>> {
        self.actuators.get(&step_type)
    }
}

impl fmt::Debug for ActuatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut covered: Vec<_> = self.actuators.keys().map(StepType::as_str).collect();
        covered.sort_unstable();
        f.debug_struct("ActuatorSet")
            .field("step_types", &covered)
            .finish()
    }
}

/// Actuator with no side effects. Describes what it would do as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedActuator;

fn param<'a>(parameters: &'a Parameters, key: &str, default: &'a str) -> &'a str {
    parameters.get(key).map(String::as_str).unwrap_or(default)
}

/// Where a simulated snapshot lands: the declared `snapshot_location`, or a
/// path derived from the host and what was captured.
fn snapshot_location(step_type: StepType, p: &Parameters) -> String {
    if let Some(location) = p.get("snapshot_location").filter(|l| !l.is_empty()) {
        return location.clone();
    }
    let host = param(p, "host_id", "unknown-host");
    match step_type {
        StepType::SnapshotDisk => {
            let disk = param(p, "disk_path", "disk").trim_start_matches('/').replace('/', "_");
            format!("simulated://snapshots/{host}/disk/{disk}")
        }
        _ => format!("simulated://snapshots/{host}/memory"),
    }
}

#[async_trait]
impl Actuator for SimulatedActuator {
    async fn perform(
        &self,
        step_type: StepType,
        p: &Parameters,
        _timeout: Duration,
    ) -> ActuatorOutcome {
        let detail = match step_type {
            StepType::IsolateHost => json!({
                "action": step_type.as_str(),
                "host_id": param(p, "host_id", ""),
                "isolation_method": param(p, "isolation_method", "network_quarantine"),
                "declarative": true,
            }),
            StepType::BlockIp => json!({
                "action": step_type.as_str(),
                "ip_address": param(p, "ip_address", ""),
                "block_duration": param(p, "block_duration", "indefinite"),
                "declarative": true,
            }),
            StepType::DisableAccount => json!({
                "action": step_type.as_str(),
                "account_id": param(p, "account_id", ""),
                "disable_method": param(p, "disable_method", "account_lock"),
                "declarative": true,
            }),
            StepType::SnapshotMemory => json!({
                "action": step_type.as_str(),
                "host_id": param(p, "host_id", ""),
                "process_id": param(p, "process_id", ""),
                "snapshot_location": snapshot_location(step_type, p),
                "declarative": true,
            }),
            StepType::SnapshotDisk => json!({
                "action": step_type.as_str(),
                "host_id": param(p, "host_id", ""),
                "disk_path": param(p, "disk_path", ""),
                "snapshot_location": snapshot_location(step_type, p),
                "declarative": true,
            }),
            StepType::NotifyHuman => json!({
                "action": step_type.as_str(),
                "notification_target": param(p, "notification_target", ""),
                "notification_message": param(p, "notification_message", ""),
                "notification_channel": param(p, "notification_channel", "email"),
                "declarative": true,
            }),
        };
        let outcome = ActuatorOutcome::success(detail.to_string());
        match step_type {
            StepType::SnapshotMemory | StepType::SnapshotDisk => {
                outcome.with_output("snapshot_location", snapshot_location(step_type, p))
            }
            _ => outcome,
        }
    }

    async fn reverse(
        &self,
        action: RollbackAction,
        parameters: &Parameters,
        _timeout: Duration,
    ) -> ActuatorOutcome {
        let detail = json!({
            "action": action.as_str(),
            "parameters": parameters,
            "declarative": true,
        });
        ActuatorOutcome::success(detail.to_string())
    }
}
