//! Error types for the Playgate core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering validation, signatures, authority, references, immutability,
//! lookups, concurrency conflicts, the audit ledger, and storage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level error type for the Playgate core library.
#[derive(Debug, thiserror::Error)]
pub enum PlaygateError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("Authority error: {0}")]
    Authority(#[from] AuthorityError),

    #[error("Reference error: {0}")]
    Reference(#[from] ReferenceError),

    #[error("Immutability violation: {0}")]
    Immutability(#[from] ImmutabilityError),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Machine-readable classification of a [`PlaygateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    SignatureInvalid,
    Authority,
    Reference,
    ImmutabilityViolation,
    NotFound,
    Conflict,
    Ledger,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::SignatureInvalid => "signature_invalid",
            ErrorKind::Authority => "authority",
            ErrorKind::Reference => "reference",
            ErrorKind::ImmutabilityViolation => "immutability_violation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Ledger => "ledger",
            ErrorKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PlaygateError {
    /// Classify this error for callers that dispatch on kind rather than type.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlaygateError::Validation(_) => ErrorKind::Validation,
            PlaygateError::Signature(_) => ErrorKind::SignatureInvalid,
            PlaygateError::Authority(_) => ErrorKind::Authority,
            PlaygateError::Reference(_) => ErrorKind::Reference,
            PlaygateError::Immutability(_) => ErrorKind::ImmutabilityViolation,
            PlaygateError::NotFound(_) => ErrorKind::NotFound,
            PlaygateError::Conflict(_) => ErrorKind::Conflict,
            PlaygateError::Ledger(_) => ErrorKind::Ledger,
            PlaygateError::Store(_) => ErrorKind::Storage,
        }
    }
}

/// A playbook that is structurally forbidden. Never reaches the signer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown step type '{step_type}' in step '{step_id}'")]
    UnknownStepType { step_id: String, step_type: String },

    #[error("Step order must be exactly 0..{expected_len}, found {found:?}")]
    NonContiguousOrder { expected_len: usize, found: Vec<i64> },

    #[error("Forbidden construct in '{field}': {reason}")]
    ForbiddenConstruct { field: String, reason: String },

    #[error("Step '{step_id}' ({step_type}) is missing required parameter '{parameter}'")]
    MissingRequiredParameter {
        step_id: String,
        step_type: String,
        parameter: String,
    },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Malformed playbook: {reason}")]
    Malformed { reason: String },
}

/// Signature and key-resolution failures. All of them are fail-closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Playbook '{playbook_id}' carries no signature")]
    MissingSignature { playbook_id: String },

    #[error("Signature encoding is malformed: {reason}")]
    Malformed { reason: String },

    #[error("Signing key '{key_id}' not found in key registry")]
    KeyNotFound { key_id: String },

    #[error("Signing key '{key_id}' has been revoked")]
    KeyRevoked { key_id: String },

    #[error("Signature does not match playbook '{playbook_id}' v{version}")]
    SignatureInvalid { playbook_id: String, version: String },

    #[error("Key material error: {reason}")]
    KeyMaterial { reason: String },
}

/// Missing, expired, or scope-mismatched authority. Aborts before any step runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    #[error("Authority action '{action_id}' not found")]
    NotFound { action_id: String },

    #[error("Authority action '{action_id}' is not valid until {valid_from}")]
    NotYetValid { action_id: String, valid_from: String },

    #[error("Authority action '{action_id}' expired at {valid_until}")]
    Expired {
        action_id: String,
        valid_until: String,
    },

    #[error("Authority scope '{authority_scope}' does not match required scope '{required_scope}'")]
    ScopeMismatch {
        authority_scope: String,
        required_scope: String,
    },

    #[error("Authority action is bound to subject '{authority_subject}', not '{subject_id}'")]
    SubjectMismatch {
        authority_subject: String,
        subject_id: String,
    },
}

/// Unresolved external references.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("Explanation bundle '{bundle_id}' not found")]
    ExplanationBundleNotFound { bundle_id: String },
}

/// Attempts to change something that is immutable by contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImmutabilityError {
    #[error("Playbook '{playbook_id}' v{version} is already registered with different content")]
    ContentMismatch { playbook_id: String, version: String },

    #[error("Execution '{execution_id}' has already been rolled back")]
    AlreadyRolledBack { execution_id: String },
}

/// Lookups that resolved to nothing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotFoundError {
    #[error("Playbook '{playbook_id}' v{version}")]
    Playbook { playbook_id: String, version: String },

    #[error("Execution '{execution_id}'")]
    Execution { execution_id: String },
}

/// Operations rejected because of the current state of shared resources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    #[error("Subject '{subject_id}' already has an execution in flight")]
    SubjectBusy { subject_id: String },

    #[error("Execution '{execution_id}' is not terminal (status: {status})")]
    NotTerminal {
        execution_id: String,
        status: String,
    },
}

/// Failures of the audit ledger sink.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger append failed: {message}")]
    AppendFailed { message: String },

    #[error("Ledger IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the append-only record stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store entry at {path}:{line}: {message}")]
    Corrupt {
        path: String,
        line: usize,
        message: String,
    },

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A type alias for results using the top-level `PlaygateError`.
pub type Result<T> = std::result::Result<T, PlaygateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_validation() {
        let err = PlaygateError::Validation(ValidationError::UnknownStepType {
            step_id: "s1".into(),
            step_type: "run_shell".into(),
        });
        assert_eq!(
            err.to_string(),
            "Validation error: Unknown step type 'run_shell' in step 's1'"
        );
    }

    #[test]
    fn test_error_display_authority() {
        let err = PlaygateError::Authority(AuthorityError::ScopeMismatch {
            authority_scope: "host".into(),
            required_scope: "incident".into(),
        });
        assert_eq!(
            err.to_string(),
            "Authority error: Authority scope 'host' does not match required scope 'incident'"
        );
    }

    #[test]
    fn test_error_kind_mapping() {
        let err: PlaygateError = ImmutabilityError::AlreadyRolledBack {
            execution_id: "e1".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ImmutabilityViolation);

        let err: PlaygateError = SignatureError::KeyRevoked {
            key_id: "k1".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);

        let err: PlaygateError = ReferenceError::ExplanationBundleNotFound {
            bundle_id: "b1".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Reference);
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ImmutabilityViolation).unwrap();
        assert_eq!(json, "\"immutability_violation\"");
        assert_eq!(ErrorKind::SignatureInvalid.to_string(), "signature_invalid");
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: StoreError = serde_err.into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
