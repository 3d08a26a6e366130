//! Service facade.
//!
//! [`ResponseApi`] wires the registry, execution engine and rollback engine
//! to one set of collaborators and exposes the operations an operator surface
//! needs. The CLI is a thin layer over it.

use crate::actuator::{ActuatorSet, SimulatedActuator};
use crate::audit::AuditOutbox;
use crate::config::{PlaygateConfig, StorageConfig};
use crate::engine::{ExecutionEngine, ExecutionRequest};
use crate::error::{NotFoundError, Result};
use crate::ledger::{AuditLedger, JsonlLedger, LedgerEntry};
use crate::records::ExecutionStore;
use crate::references::{
    AuthorityStore, DirectoryAuthorityStore, DirectoryExplanationStore, ExplanationStore,
};
use crate::registry::{PlaybookRegistry, RegisteredPlaybook};
use crate::rollback::{RollbackEngine, RollbackRequest};
use crate::signing::{DirectoryKeyRegistry, KeyRegistry, PlaybookVerifier};
use crate::types::{ExecutionRecord, Playbook, RollbackRecord};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub keys: Arc<dyn KeyRegistry>,
    pub authority: Arc<dyn AuthorityStore>,
    pub explanations: Arc<dyn ExplanationStore>,
    pub actuators: ActuatorSet,
    pub ledger: Arc<dyn AuditLedger>,
}

pub struct ResponseApi {
    registry: Arc<PlaybookRegistry>,
    engine: ExecutionEngine,
    rollback: RollbackEngine,
    records: Arc<ExecutionStore>,
    audit: Arc<AuditOutbox>,
}

impl ResponseApi {
    fn assemble(
        registry: PlaybookRegistry,
        records: ExecutionStore,
        audit: Arc<AuditOutbox>,
        collaborators: Collaborators,
        step_timeout: Duration,
    ) -> Self {
        let registry = Arc::new(registry);
        let records = Arc::new(records);
        let engine = ExecutionEngine::new(
            registry.clone(),
            collaborators.authority.clone(),
            collaborators.explanations.clone(),
            collaborators.actuators.clone(),
            audit.clone(),
            records.clone(),
        )
        .with_step_timeout(step_timeout);
        let rollback = RollbackEngine::new(
            collaborators.authority,
            collaborators.actuators,
            audit.clone(),
            records.clone(),
        )
        .with_step_timeout(step_timeout);

        Self {
            registry,
            engine,
            rollback,
            records,
            audit,
        }
    }

    /// Everything in memory. Nothing survives the process.
    pub fn in_memory(collaborators: Collaborators, step_timeout: Duration) -> Self {
        let audit = Arc::new(AuditOutbox::in_memory(collaborators.ledger.clone()));
        let registry = PlaybookRegistry::in_memory(
            PlaybookVerifier::new(collaborators.keys.clone()),
            audit.clone(),
        );
        Self::assemble(
            registry,
            ExecutionStore::in_memory(),
            audit,
            collaborators,
            step_timeout,
        )
    }

    /// File-backed registry, history and audit outbox under `storage`.
    ///
    /// Audit entries parked by an earlier process are redelivered here when
    /// the ledger accepts them.
    pub async fn open(
        storage: &StorageConfig,
        collaborators: Collaborators,
        step_timeout: Duration,
    ) -> Result<Self> {
        let audit = Arc::new(
            AuditOutbox::open(storage.audit_outbox_path(), collaborators.ledger.clone()).await?,
        );
        let registry = PlaybookRegistry::open(
            storage.registry_path(),
            PlaybookVerifier::new(collaborators.keys.clone()),
            audit.clone(),
        )
        .await?;
        let records =
            ExecutionStore::open(&storage.executions_path(), &storage.rollbacks_path()).await?;
        info!(data_dir = %storage.data_dir.display(), "Opened playbook stores");

        if let Err(err) = audit.flush().await {
            warn!(error = %err, "Audit ledger still refusing parked entries");
        }
        Ok(Self::assemble(registry, records, audit, collaborators, step_timeout))
    }

    /// Directory-backed collaborators, a JSONL ledger and the simulated
    /// actuator, all located by `config`.
    pub async fn from_config(config: &PlaygateConfig) -> Result<Self> {
        let ledger = JsonlLedger::open(config.storage.ledger_path()).await?;
        let collaborators = Collaborators {
            keys: Arc::new(DirectoryKeyRegistry::new(&config.keys.public_dir)),
            authority: Arc::new(DirectoryAuthorityStore::new(&config.references.authority_dir)),
            explanations: Arc::new(DirectoryExplanationStore::new(
                &config.references.explanation_dir,
            )),
            actuators: ActuatorSet::uniform(Arc::new(SimulatedActuator)),
            ledger: Arc::new(ledger),
        };
        Self::open(&config.storage, collaborators, config.execution.step_timeout()).await
    }

    pub async fn register(&self, playbook: Playbook) -> Result<RegisteredPlaybook> {
        self.registry.register(playbook).await
    }

    pub async fn register_document(&self, document: &Value) -> Result<RegisteredPlaybook> {
        self.registry.register_document(document).await
    }

    pub async fn playbook(&self, playbook_id: &str, version: &str) -> Result<RegisteredPlaybook> {
        self.registry.get_entry(playbook_id, version).await
    }

    pub async fn playbooks(&self) -> Vec<RegisteredPlaybook> {
        self.registry.list().await
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionRecord> {
        self.engine.execute(request).await
    }

    pub async fn rollback(&self, request: &RollbackRequest) -> Result<RollbackRecord> {
        self.rollback.rollback(request).await
    }

    /// An execution with its current status.
    pub async fn execution(&self, execution_id: Uuid) -> Result<ExecutionRecord> {
        self.records
            .execution(execution_id)
            .await
            .ok_or_else(|| not_found(execution_id))
    }

    pub async fn executions(&self) -> Vec<ExecutionRecord> {
        self.records.executions().await
    }

    /// Audit entries the ledger has not accepted yet.
    pub async fn pending_audit(&self) -> Vec<LedgerEntry> {
        self.audit.pending().await
    }

    /// The rollback of an execution, if it was rolled back.
    pub async fn rollback_of(&self, execution_id: Uuid) -> Result<Option<RollbackRecord>> {
        if self.records.original_execution(execution_id).await.is_none() {
            return Err(not_found(execution_id));
        }
        Ok(self.records.rollback_for(execution_id).await)
    }
}

fn not_found(execution_id: Uuid) -> crate::error::PlaygateError {
    NotFoundError::Execution {
        execution_id: execution_id.to_string(),
    }
    .into()
}
