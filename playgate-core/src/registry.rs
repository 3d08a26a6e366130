//! Playbook registry.
//!
//! Stores validated, signature-checked playbooks keyed by `(id, version)` in an
//! append-only log. A registered version is immutable: registering the same
//! content again is a no-op, registering different content under the same key
//! is refused. The key check and the append happen under the log's file lock,
//! so two processes cannot register one key twice.

use crate::audit::AuditOutbox;
use crate::error::{ImmutabilityError, NotFoundError, Result};
use crate::ledger::{LedgerActionType, LedgerEntry, LedgerSubject};
use crate::signing::{self, PlaybookVerifier};
use crate::store::{AppendLog, Appended, LogEntry};
use crate::types::Playbook;
use crate::validator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const COMPONENT: &str = "playbook_registry";

/// Line format of the registry log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub content_hash: String,
    pub playbook: Playbook,
}

/// A playbook as held by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredPlaybook {
    pub sequence: u64,
    pub registered_at: DateTime<Utc>,
    pub content_hash: String,
    pub playbook: Playbook,
}

impl From<LogEntry<RegistryRecord>> for RegisteredPlaybook {
    fn from(entry: LogEntry<RegistryRecord>) -> Self {
        Self {
            sequence: entry.sequence,
            registered_at: entry.appended_at,
            content_hash: entry.record.content_hash,
            playbook: entry.record.playbook,
        }
    }
}

pub struct PlaybookRegistry {
    log: AppendLog<RegistryRecord>,
    verifier: PlaybookVerifier,
    audit: Arc<AuditOutbox>,
}

impl PlaybookRegistry {
    pub fn new(
        log: AppendLog<RegistryRecord>,
        verifier: PlaybookVerifier,
        audit: Arc<AuditOutbox>,
    ) -> Self {
        Self {
            log,
            verifier,
            audit,
        }
    }

    pub fn in_memory(verifier: PlaybookVerifier, audit: Arc<AuditOutbox>) -> Self {
        Self::new(AppendLog::in_memory(), verifier, audit)
    }

    pub async fn open(
        path: impl Into<PathBuf>,
        verifier: PlaybookVerifier,
        audit: Arc<AuditOutbox>,
    ) -> Result<Self> {
        Ok(Self::new(AppendLog::open(path).await?, verifier, audit))
    }

    pub fn verifier(&self) -> &PlaybookVerifier {
        &self.verifier
    }

    /// Validate an untyped document, then register it.
    pub async fn register_document(&self, document: &Value) -> Result<RegisteredPlaybook> {
        let playbook = validator::validate(document)?;
        self.register(playbook).await
    }

    /// Register a signed playbook.
    ///
    /// Validation runs before signature verification, so a structurally
    /// forbidden playbook is reported as such even when unsigned.
    pub async fn register(&self, playbook: Playbook) -> Result<RegisteredPlaybook> {
        validator::check(&playbook)?;
        self.verifier.verify(&playbook).await?;

        let content_hash = signing::content_hash(&playbook);
        let (id, version) = playbook.key();
        let record = RegistryRecord {
            content_hash: content_hash.clone(),
            playbook,
        };

        let appended = self
            .log
            .append_unless(record, |r| {
                r.playbook.playbook_id == id && r.playbook.playbook_version == version
            })
            .await?;
        let entry = match appended {
            Appended::New(entry) => entry,
            Appended::Existing(existing) if existing.record.content_hash == content_hash => {
                info!(playbook_id = %id, version = %version, "Playbook already registered with identical content");
                // An earlier attempt may have left its audit entry parked.
                self.audit.flush().await?;
                return Ok(existing.into());
            }
            Appended::Existing(_) => {
                return Err(ImmutabilityError::ContentMismatch {
                    playbook_id: id,
                    version,
                }
                .into());
            }
        };
        let registered = RegisteredPlaybook::from(entry);

        let playbook = &registered.playbook;
        self.audit
            .submit(LedgerEntry::new(
                COMPONENT,
                LedgerActionType::PlaybookRegistered,
                LedgerSubject::new("playbook", &playbook.playbook_id),
                &playbook.created_by,
                json!({
                    "playbook_id": playbook.playbook_id,
                    "playbook_version": playbook.playbook_version,
                    "scope": playbook.scope,
                    "content_hash": registered.content_hash,
                    "key_id": playbook.playbook_key_id,
                    "step_count": playbook.steps.len(),
                    "registry_sequence": registered.sequence,
                }),
            ))
            .await?;

        info!(
            playbook_id = %playbook.playbook_id,
            version = %playbook.playbook_version,
            sequence = registered.sequence,
            "Playbook registered"
        );
        Ok(registered)
    }

    /// Look up one registered version.
    pub async fn get(&self, playbook_id: &str, version: &str) -> Result<Playbook> {
        Ok(self.get_entry(playbook_id, version).await?.playbook)
    }

    pub async fn get_entry(&self, playbook_id: &str, version: &str) -> Result<RegisteredPlaybook> {
        self.log
            .find(|r| r.playbook.playbook_id == playbook_id && r.playbook.playbook_version == version)
            .await
            .map(RegisteredPlaybook::from)
            .ok_or_else(|| {
                NotFoundError::Playbook {
                    playbook_id: playbook_id.to_string(),
                    version: version.to_string(),
                }
                .into()
            })
    }

    /// All registered playbooks in registration order.
    pub async fn list(&self) -> Vec<RegisteredPlaybook> {
        self.log
            .entries()
            .await
            .into_iter()
            .map(RegisteredPlaybook::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, PlaygateError};
    use crate::ledger::InMemoryLedger;
    use crate::signing::{InMemoryKeyRegistry, PlaybookSigner};
    use crate::types::{Parameters, Step, StepType};
    use chrono::TimeZone;
    use ed25519_dalek::SigningKey;

    fn playbook(name: &str) -> Playbook {
        Playbook {
            playbook_id: "pb-1".into(),
            playbook_name: name.into(),
            playbook_version: "1.0.0".into(),
            scope: "incident".into(),
            steps: vec![Step {
                step_id: "isolate".into(),
                step_type: StepType::IsolateHost,
                step_order: 0,
                parameters: Parameters::new(),
            }],
            created_by: "alice".into(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            playbook_signature: None,
            playbook_key_id: None,
        }
    }

    async fn setup() -> (PlaybookRegistry, PlaybookSigner, Arc<InMemoryLedger>) {
        let signer = PlaybookSigner::new("k1", SigningKey::from_bytes(&[5; 32]));
        let keys = Arc::new(InMemoryKeyRegistry::new());
        keys.insert("k1", signer.verifying_key()).await;
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = PlaybookRegistry::in_memory(
            PlaybookVerifier::new(keys),
            Arc::new(AuditOutbox::in_memory(ledger.clone())),
        );
        (registry, signer, ledger)
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let (registry, signer, ledger) = setup().await;
        let registered = registry.register(signer.seal(playbook("Contain"))).await.unwrap();
        assert_eq!(registered.sequence, 0);

        let fetched = registry.get("pb-1", "1.0.0").await.unwrap();
        assert_eq!(fetched, registered.playbook);
        assert_eq!(registry.list().await.len(), 1);
        assert_eq!(ledger.entries_of(LedgerActionType::PlaybookRegistered).await.len(), 1);
    }

    #[tokio::test]
    async fn test_reregistration_is_idempotent() {
        let (registry, signer, ledger) = setup().await;
        let first = registry.register(signer.seal(playbook("Contain"))).await.unwrap();
        let second = registry.register(signer.seal(playbook("Contain"))).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.list().await.len(), 1);
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_changed_content_is_refused() {
        let (registry, signer, _) = setup().await;
        registry.register(signer.seal(playbook("Contain"))).await.unwrap();
        let err = registry
            .register(signer.seal(playbook("Contain v2")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImmutabilityViolation);
    }

    #[tokio::test]
    async fn test_unsigned_is_refused() {
        let (registry, _, ledger) = setup().await;
        let err = registry.register(playbook("Contain")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_validation_precedes_signature_check() {
        let (registry, _, _) = setup().await;
        let mut bad = playbook("Contain");
        bad.steps[0].step_order = 3;
        let err = registry.register(bad).await.unwrap_err();
        assert!(matches!(err, PlaygateError::Validation(_)));
    }

    #[tokio::test]
    async fn test_missing_playbook() {
        let (registry, _, _) = setup().await;
        let err = registry.get("pb-404", "1.0.0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
