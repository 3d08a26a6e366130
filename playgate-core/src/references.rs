//! External references: authority actions and explanation bundles.
//!
//! Neither is owned here. An execution or rollback only names them by id; the
//! stores below answer "does it exist, and what does it say". Directory-backed
//! stores read `<id>.json` files and never write them.

use crate::error::{AuthorityError, PlaygateError, ReferenceError, StoreError};
use crate::persistence;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

/// A human authority grant authorizing actions within a scope on one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityAction {
    pub action_id: String,
    pub scope: String,
    pub subject_id: String,
    pub issued_by: String,
    pub valid_from: DateTime<Utc>,
    /// Open-ended when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl AuthorityAction {
    /// Check the validity window and the binding to scope and subject.
    ///
    /// The window is inclusive at both ends.
    pub fn check(
        &self,
        required_scope: &str,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AuthorityError> {
        if now < self.valid_from {
            return Err(AuthorityError::NotYetValid {
                action_id: self.action_id.clone(),
                valid_from: self.valid_from.to_rfc3339(),
            });
        }
        if let Some(valid_until) = self.valid_until
            && now > valid_until
        {
            return Err(AuthorityError::Expired {
                action_id: self.action_id.clone(),
                valid_until: valid_until.to_rfc3339(),
            });
        }
        if self.scope != required_scope {
            return Err(AuthorityError::ScopeMismatch {
                authority_scope: self.scope.clone(),
                required_scope: required_scope.to_string(),
            });
        }
        if self.subject_id != subject_id {
            return Err(AuthorityError::SubjectMismatch {
                authority_subject: self.subject_id.clone(),
                subject_id: subject_id.to_string(),
            });
        }
        Ok(())
    }
}

/// Lookup of authority actions by id.
#[async_trait]
pub trait AuthorityStore: Send + Sync {
    async fn get(&self, action_id: &str) -> Result<Option<AuthorityAction>, StoreError>;
}

/// Existence check for explanation bundles.
#[async_trait]
pub trait ExplanationStore: Send + Sync {
    async fn exists(&self, bundle_id: &str) -> Result<bool, StoreError>;
}

/// Fetch an authority action and check it against scope, subject and time.
pub async fn authorize(
    store: &dyn AuthorityStore,
    action_id: &str,
    required_scope: &str,
    subject_id: &str,
    now: DateTime<Utc>,
) -> Result<AuthorityAction, PlaygateError> {
    let action = store
        .get(action_id)
        .await?
        .ok_or_else(|| AuthorityError::NotFound {
            action_id: action_id.to_string(),
        })?;
    action.check(required_scope, subject_id, now)?;
    Ok(action)
}

/// Fail unless the explanation bundle exists.
pub async fn require_bundle(store: &dyn ExplanationStore, bundle_id: &str) -> Result<(), PlaygateError> {
    if store.exists(bundle_id).await? {
        Ok(())
    } else {
        Err(ReferenceError::ExplanationBundleNotFound {
            bundle_id: bundle_id.to_string(),
        }
        .into())
    }
}

// ---------------------------------------------------------------------------
// In-memory adapters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryAuthorityStore {
    actions: RwLock<HashMap<String, AuthorityAction>>,
}

impl InMemoryAuthorityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, action: AuthorityAction) {
        self.actions
            .write()
            .await
            .insert(action.action_id.clone(), action);
    }
}

#[async_trait]
impl AuthorityStore for InMemoryAuthorityStore {
    async fn get(&self, action_id: &str) -> Result<Option<AuthorityAction>, StoreError> {
        Ok(self.actions.read().await.get(action_id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryExplanationStore {
    bundles: RwLock<HashSet<String>>,
}

impl InMemoryExplanationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, bundle_id: impl Into<String>) {
        self.bundles.write().await.insert(bundle_id.into());
    }
}

#[async_trait]
impl ExplanationStore for InMemoryExplanationStore {
    async fn exists(&self, bundle_id: &str) -> Result<bool, StoreError> {
        Ok(self.bundles.read().await.contains(bundle_id))
    }
}

// ---------------------------------------------------------------------------
// Directory adapters
// ---------------------------------------------------------------------------

fn document_path(dir: &Path, id: &str) -> Option<PathBuf> {
    if persistence::is_plain_file_stem(id) {
        Some(dir.join(format!("{id}.json")))
    } else {
        warn!(id, dir = %dir.display(), "Rejected reference id that is not a plain file name");
        None
    }
}

/// Authority actions stored as `<action_id>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryAuthorityStore {
    dir: PathBuf,
}

impl DirectoryAuthorityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl AuthorityStore for DirectoryAuthorityStore {
    async fn get(&self, action_id: &str) -> Result<Option<AuthorityAction>, StoreError> {
        let Some(path) = document_path(&self.dir, action_id) else {
            return Ok(None);
        };
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        let action: AuthorityAction =
            serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
                path: path.display().to_string(),
                line: e.line(),
                message: e.to_string(),
            })?;
        if action.action_id != action_id {
            return Err(StoreError::Corrupt {
                path: path.display().to_string(),
                line: 1,
                message: format!(
                    "file declares action_id '{}', expected '{action_id}'",
                    action.action_id
                ),
            });
        }
        Ok(Some(action))
    }
}

/// Explanation bundles present as `<bundle_id>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryExplanationStore {
    dir: PathBuf,
}

impl DirectoryExplanationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ExplanationStore for DirectoryExplanationStore {
    async fn exists(&self, bundle_id: &str) -> Result<bool, StoreError> {
        let Some(path) = document_path(&self.dir, bundle_id) else {
            return Ok(false);
        };
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })
    }
}
