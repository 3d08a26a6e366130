//! # Playgate Core
//!
//! Core library for Playgate, a deterministic incident-response playbook
//! engine. Provides the playbook validator, Ed25519 signer and verifier,
//! the immutable playbook registry, the execution and rollback engines,
//! the audit ledger adapters, configuration, and fundamental types.

pub mod actuator;
pub mod api;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod persistence;
pub mod records;
pub mod references;
pub mod registry;
pub mod rollback;
pub mod signing;
pub mod store;
pub mod substitution;
pub mod types;
pub mod validator;

// Re-export commonly used types at the crate root.
pub use actuator::{Actuator, ActuatorOutcome, ActuatorSet, ActuatorStatus, SimulatedActuator};
pub use api::{Collaborators, ResponseApi};
pub use audit::AuditOutbox;
pub use config::{PlaygateConfig, load_config};
pub use engine::{ExecutionEngine, ExecutionRequest};
pub use error::{ErrorKind, PlaygateError, Result};
pub use ledger::{AuditLedger, InMemoryLedger, JsonlLedger, LedgerActionType, LedgerEntry};
pub use references::{
    AuthorityAction, AuthorityStore, DirectoryAuthorityStore, DirectoryExplanationStore,
    ExplanationStore, InMemoryAuthorityStore, InMemoryExplanationStore,
};
pub use registry::{PlaybookRegistry, RegisteredPlaybook};
pub use rollback::{RollbackEngine, RollbackRequest};
pub use signing::{
    DirectoryKeyRegistry, InMemoryKeyRegistry, KeyRegistry, KeyResolution, PlaybookSigner,
    PlaybookVerifier,
};
pub use types::{
    ExecutionRecord, ExecutionStatus, Parameters, Playbook, ReversalStatus, ReversedStep,
    RollbackAction, RollbackRecord, Step, StepOutcome, StepStatus, StepType,
};
