//! Audit delivery.
//!
//! Registrations, executions and rollbacks are persisted first and audited
//! second. When the ledger refuses an entry, [`AuditOutbox`] parks it in its
//! own append-only log and delivers it ahead of the next entry, or on
//! [`AuditOutbox::flush`]. Parked entries are delivered oldest first and each
//! is delivered once.

use crate::error::{PlaygateError, StoreError};
use crate::ledger::{AuditLedger, LedgerEntry};
use crate::store::AppendLog;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Line format of the outbox log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OutboxRecord {
    /// The ledger refused this entry.
    Parked { entry: LedgerEntry, reason: String },
    /// A parked entry reached the ledger.
    Delivered { entry_id: Uuid, ledger_sequence: u64 },
}

pub struct AuditOutbox {
    ledger: Arc<dyn AuditLedger>,
    log: AppendLog<OutboxRecord>,
    delivery: Mutex<()>,
}

impl AuditOutbox {
    pub fn new(ledger: Arc<dyn AuditLedger>, log: AppendLog<OutboxRecord>) -> Self {
        Self {
            ledger,
            log,
            delivery: Mutex::new(()),
        }
    }

    pub fn in_memory(ledger: Arc<dyn AuditLedger>) -> Self {
        Self::new(ledger, AppendLog::in_memory())
    }

    pub async fn open(
        path: impl Into<PathBuf>,
        ledger: Arc<dyn AuditLedger>,
    ) -> Result<Self, StoreError> {
        Ok(Self::new(ledger, AppendLog::open(path).await?))
    }

    /// Entries still waiting for the ledger, oldest first.
    pub async fn pending(&self) -> Vec<LedgerEntry> {
        let entries = self.log.entries().await;
        let delivered: HashSet<Uuid> = entries
            .iter()
            .filter_map(|e| match &e.record {
                OutboxRecord::Delivered { entry_id, .. } => Some(*entry_id),
                OutboxRecord::Parked { .. } => None,
            })
            .collect();
        entries
            .into_iter()
            .filter_map(|e| match e.record {
                OutboxRecord::Parked { entry, .. } if !delivered.contains(&entry.entry_id) => {
                    Some(entry)
                }
                _ => None,
            })
            .collect()
    }

    /// Deliver every parked entry. Returns how many reached the ledger.
    pub async fn flush(&self) -> Result<usize, PlaygateError> {
        let _delivery = self.delivery.lock().await;
        self.deliver_parked().await
    }

    /// Deliver `entry`, after anything parked before it.
    ///
    /// On `Err` the entry is parked and will be delivered later; the state
    /// change it describes stays in place.
    pub async fn submit(&self, entry: LedgerEntry) -> Result<u64, PlaygateError> {
        let _delivery = self.delivery.lock().await;

        if let Err(err) = self.deliver_parked().await {
            self.park(entry, &err).await;
            return Err(err);
        }

        match self.ledger.append(entry.clone()).await {
            Ok(sequence) => Ok(sequence),
            Err(ledger_err) => {
                let err = PlaygateError::Ledger(ledger_err);
                self.park(entry, &err).await;
                Err(err)
            }
        }
    }

    async fn deliver_parked(&self) -> Result<usize, PlaygateError> {
        let parked = self.pending().await;
        let mut delivered = 0;
        for entry in parked {
            let entry_id = entry.entry_id;
            let ledger_sequence = self.ledger.append(entry).await?;
            self.log
                .append(OutboxRecord::Delivered {
                    entry_id,
                    ledger_sequence,
                })
                .await?;
            delivered += 1;
        }
        if delivered > 0 {
            info!(delivered, "Delivered parked audit entries");
        }
        Ok(delivered)
    }

    async fn park(&self, entry: LedgerEntry, cause: &PlaygateError) {
        let entry_id = entry.entry_id;
        let action_type = entry.action_type;
        match self
            .log
            .append(OutboxRecord::Parked {
                entry,
                reason: cause.to_string(),
            })
            .await
        {
            Ok(_) => {
                warn!(%entry_id, action_type = %action_type, error = %cause, "Audit entry parked for redelivery")
            }
            Err(store_err) => {
                error!(%entry_id, action_type = %action_type, error = %store_err, "Failed to park audit entry")
            }
        }
    }
}
