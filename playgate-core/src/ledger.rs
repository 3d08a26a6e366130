//! # Audit Ledger
//!
//! The engine does not own the audit ledger; it writes to one through the
//! [`AuditLedger`] trait. Two adapters ship with the crate: [`InMemoryLedger`]
//! for tests and embedders, and [`JsonlLedger`] backed by an append-only file.
//!
//! The [`AuditLedger`] contract is append-only and nothing more. As an extra,
//! both adapters hash-chain what they store: each line carries its
//! predecessor's hash and its own `SHA-256(previous_hash || entry)`, which lets
//! [`ChainVerification`] point at the first altered entry.

use crate::error::{LedgerError, StoreError};
use crate::signing::write_canonical;
use crate::store::{AppendLog, LogEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerActionType {
    PlaybookRegistered,
    PlaybookExecuted,
    ExecutionRejected,
    PlaybookRolledBack,
    RollbackRejected,
}

impl LedgerActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerActionType::PlaybookRegistered => "playbook_registered",
            LedgerActionType::PlaybookExecuted => "playbook_executed",
            LedgerActionType::ExecutionRejected => "execution_rejected",
            LedgerActionType::PlaybookRolledBack => "playbook_rolled_back",
            LedgerActionType::RollbackRejected => "rollback_rejected",
        }
    }
}

impl fmt::Display for LedgerActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an entry is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSubject {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl LedgerSubject {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// One audit ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub action_type: LedgerActionType,
    pub subject: LedgerSubject,
    pub actor: String,
    pub payload: Value,
}

impl LedgerEntry {
    pub fn new(
        component: impl Into<String>,
        action_type: LedgerActionType,
        subject: LedgerSubject,
        actor: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            component: component.into(),
            action_type,
            subject,
            actor: actor.into(),
            payload,
        }
    }
}

/// Sink for audit entries. Returns the sequence number assigned to the entry.
#[async_trait]
pub trait AuditLedger: Send + Sync {
    async fn append(&self, entry: LedgerEntry) -> Result<u64, LedgerError>;
}

// ---------------------------------------------------------------------------
// Hash chain
// ---------------------------------------------------------------------------

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A ledger entry as stored, linked to its predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainedEntry {
    pub entry: LedgerEntry,
    pub previous_hash: String,
    pub chain_hash: String,
}

/// Result of walking a ledger's hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub is_valid: bool,
    pub checked_entries: usize,
    pub first_invalid: Option<u64>,
}

fn canonical_entry(entry: &LedgerEntry) -> Result<String, LedgerError> {
    let mut canonical = String::new();
    write_canonical(&serde_json::to_value(entry)?, &mut canonical);
    Ok(canonical)
}

fn link(previous_hash: &str, canonical_entry: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(canonical_entry.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify a sequence of stored entries in order.
pub fn verify_chain(entries: &[LogEntry<ChainedEntry>]) -> ChainVerification {
    let mut previous = GENESIS_HASH.to_string();
    for (index, stored) in entries.iter().enumerate() {
        let record = &stored.record;
        let intact = record.previous_hash == previous
            && canonical_entry(&record.entry)
                .is_ok_and(|canonical| link(&record.previous_hash, &canonical) == record.chain_hash);
        if !intact {
            return ChainVerification {
                is_valid: false,
                checked_entries: index + 1,
                first_invalid: Some(stored.sequence),
            };
        }
        previous = record.chain_hash.clone();
    }
    ChainVerification {
        is_valid: true,
        checked_entries: entries.len(),
        first_invalid: None,
    }
}

/// Shared machinery behind both adapters.
#[derive(Debug)]
struct ChainedLog {
    log: AppendLog<ChainedEntry>,
}

impl ChainedLog {
    fn new(log: AppendLog<ChainedEntry>) -> Self {
        Self { log }
    }

    async fn append(&self, entry: LedgerEntry) -> Result<u64, LedgerError> {
        let canonical = canonical_entry(&entry)?;
        let action_type = entry.action_type;

        let stored = self
            .log
            .append_with(|last| {
                let previous_hash = last
                    .map(|e| e.record.chain_hash.clone())
                    .unwrap_or_else(|| GENESIS_HASH.to_string());
                let chain_hash = link(&previous_hash, &canonical);
                ChainedEntry {
                    entry,
                    previous_hash,
                    chain_hash,
                }
            })
            .await
            .map_err(store_to_ledger)?;

        debug!(sequence = stored.sequence, action_type = %action_type, "Ledger entry appended");
        Ok(stored.sequence)
    }

    async fn entries(&self) -> Vec<LedgerEntry> {
        self.log
            .entries()
            .await
            .into_iter()
            .map(|e| e.record.entry)
            .collect()
    }

    async fn verify(&self) -> ChainVerification {
        verify_chain(&self.log.entries().await)
    }
}

fn store_to_ledger(err: StoreError) -> LedgerError {
    match err {
        StoreError::Serialization(e) => LedgerError::Serialization(e),
        other => LedgerError::AppendFailed {
            message: other.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Process-local ledger.
#[derive(Debug)]
pub struct InMemoryLedger {
    inner: ChainedLog,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: ChainedLog::new(AppendLog::in_memory()),
        }
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.entries().await
    }

    /// Entries with the given action type, in append order.
    pub async fn entries_of(&self, action_type: LedgerActionType) -> Vec<LedgerEntry> {
        self.entries()
            .await
            .into_iter()
            .filter(|e| e.action_type == action_type)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.log.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.log.is_empty().await
    }

    pub async fn verify(&self) -> ChainVerification {
        self.inner.verify().await
    }
}

#[async_trait]
impl AuditLedger for InMemoryLedger {
    async fn append(&self, entry: LedgerEntry) -> Result<u64, LedgerError> {
        self.inner.append(entry).await
    }
}

/// Ledger backed by a JSONL file, one chained entry per line.
#[derive(Debug)]
pub struct JsonlLedger {
    inner: ChainedLog,
}

impl JsonlLedger {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let log = AppendLog::open(path).await.map_err(store_to_ledger)?;
        Ok(Self {
            inner: ChainedLog::new(log),
        })
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.entries().await
    }

    pub async fn verify(&self) -> ChainVerification {
        self.inner.verify().await
    }
}

#[async_trait]
impl AuditLedger for JsonlLedger {
    async fn append(&self, entry: LedgerEntry) -> Result<u64, LedgerError> {
        self.inner.append(entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(action_type: LedgerActionType, id: &str) -> LedgerEntry {
        LedgerEntry::new(
            "registry",
            action_type,
            LedgerSubject::new("playbook", id),
            "alice",
            json!({"playbook_id": id}),
        )
    }

    #[tokio::test]
    async fn test_in_memory_sequence_and_filter() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.is_empty().await);
        assert_eq!(
            ledger.append(entry(LedgerActionType::PlaybookRegistered, "a")).await.unwrap(),
            0
        );
        assert_eq!(
            ledger.append(entry(LedgerActionType::ExecutionRejected, "b")).await.unwrap(),
            1
        );
        assert_eq!(ledger.len().await, 2);
        let rejected = ledger.entries_of(LedgerActionType::ExecutionRejected).await;
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].subject.id, "b");
        assert!(ledger.verify().await.is_valid);
    }

    #[test]
    fn test_entry_shape() {
        let json = serde_json::to_value(entry(LedgerActionType::PlaybookRolledBack, "x")).unwrap();
        assert_eq!(json["action_type"], "playbook_rolled_back");
        assert_eq!(json["subject"]["type"], "playbook");
        assert_eq!(json["component"], "registry");
    }

    #[tokio::test]
    async fn test_jsonl_reload_and_verify() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = JsonlLedger::open(&path).await.unwrap();
            ledger.append(entry(LedgerActionType::PlaybookRegistered, "a")).await.unwrap();
            ledger.append(entry(LedgerActionType::PlaybookExecuted, "a")).await.unwrap();
        }
        let ledger = JsonlLedger::open(&path).await.unwrap();
        assert_eq!(ledger.entries().await.len(), 2);
        assert_eq!(
            ledger.append(entry(LedgerActionType::PlaybookRolledBack, "a")).await.unwrap(),
            2
        );
        let verification = ledger.verify().await;
        assert!(verification.is_valid);
        assert_eq!(verification.checked_entries, 3);
    }

    #[tokio::test]
    async fn test_jsonl_writers_share_one_chain() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let first = JsonlLedger::open(&path).await.unwrap();
        let second = JsonlLedger::open(&path).await.unwrap();

        assert_eq!(first.append(entry(LedgerActionType::PlaybookRegistered, "a")).await.unwrap(), 0);
        assert_eq!(second.append(entry(LedgerActionType::PlaybookExecuted, "a")).await.unwrap(), 1);
        assert_eq!(first.append(entry(LedgerActionType::PlaybookRolledBack, "a")).await.unwrap(), 2);

        let reopened = JsonlLedger::open(&path).await.unwrap();
        let verification = reopened.verify().await;
        assert!(verification.is_valid);
        assert_eq!(verification.checked_entries, 3);
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let ledger = InMemoryLedger::new();
        for id in ["a", "b", "c"] {
            ledger.append(entry(LedgerActionType::PlaybookRegistered, id)).await.unwrap();
        }
        let mut stored = ledger.inner.log.entries().await;
        stored[1].record.entry.actor = "mallory".into();

        let verification = verify_chain(&stored);
        assert!(!verification.is_valid);
        assert_eq!(verification.first_invalid, Some(1));
    }
}
