//! # Playbook Signing
//!
//! Canonicalization, Ed25519 signing and verification, and resolution of
//! public keys through a [`KeyRegistry`].
//!
//! The canonical form of a playbook is compact JSON with object keys sorted at
//! every depth, steps in `step_order`, and the signature fields excluded. The
//! SHA-256 digest of those bytes is what gets signed. Signing and verification
//! both go through [`canonical_bytes`]; there is no second serializer.

use crate::error::SignatureError;
use crate::persistence;
use crate::types::Playbook;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Canonicalization
// ---------------------------------------------------------------------------

/// The playbook as a JSON value, minus signature fields, steps ordered.
pub fn canonical_value(playbook: &Playbook) -> Value {
    let mut steps: Vec<_> = playbook.steps.iter().collect();
    steps.sort_by_key(|s| s.step_order);

    let steps: Vec<Value> = steps
        .into_iter()
        .map(|step| {
            let parameters: Map<String, Value> = step
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            json!({
                "step_id": step.step_id,
                "step_type": step.step_type.as_str(),
                "step_order": step.step_order,
                "parameters": parameters,
            })
        })
        .collect();

    json!({
        "playbook_id": playbook.playbook_id,
        "playbook_name": playbook.playbook_name,
        "playbook_version": playbook.playbook_version,
        "scope": playbook.scope,
        "steps": steps,
        "created_by": playbook.created_by,
        "created_at": playbook
            .created_at
            .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
    })
}

/// Deterministic byte serialization of a playbook.
pub fn canonical_bytes(playbook: &Playbook) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(&canonical_value(playbook), &mut out);
    out.into_bytes()
}

/// Write `value` as compact JSON with lexicographically sorted object keys.
pub fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => push_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_json_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn push_json_string(s: &str, out: &mut String) {
    // Serializing a str to JSON cannot fail.
    out.push_str(&Value::String(s.to_string()).to_string());
}

/// SHA-256 of the canonical bytes.
pub fn digest(canonical: &[u8]) -> [u8; 32] {
    Sha256::digest(canonical).into()
}

/// Hex SHA-256 of a playbook's canonical form. Used as its content identity.
pub fn content_hash(playbook: &Playbook) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(playbook));
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Sign / verify
// ---------------------------------------------------------------------------

/// Sign a playbook's canonical form. Returns a base64 signature.
pub fn sign(playbook: &Playbook, key: &SigningKey) -> String {
    sign_canonical(&canonical_bytes(playbook), key)
}

/// Sign already-canonicalized bytes.
pub fn sign_canonical(canonical: &[u8], key: &SigningKey) -> String {
    let signature = key.sign(&digest(canonical));
    STANDARD.encode(signature.to_bytes())
}

/// Check a base64 signature against a playbook.
pub fn verify(playbook: &Playbook, signature: &str, key: &VerifyingKey) -> bool {
    verify_canonical(&canonical_bytes(playbook), signature, key)
}

/// Check a base64 signature against canonical bytes.
///
/// Any decoding problem counts as a failed verification.
pub fn verify_canonical(canonical: &[u8], signature: &str, key: &VerifyingKey) -> bool {
    match decode_signature(signature) {
        Ok(sig) => key.verify(&digest(canonical), &sig).is_ok(),
        Err(_) => false,
    }
}

fn decode_signature(signature: &str) -> Result<Signature, SignatureError> {
    let bytes = STANDARD
        .decode(signature.trim())
        .map_err(|e| SignatureError::Malformed {
            reason: format!("signature is not valid base64: {e}"),
        })?;
    Signature::from_slice(&bytes).map_err(|_| SignatureError::Malformed {
        reason: format!("signature must be 64 bytes, got {}", bytes.len()),
    })
}

/// A signing key bound to the id under which its public half is published.
pub struct PlaybookSigner {
    key: SigningKey,
    key_id: String,
}

impl PlaybookSigner {
    pub fn new(key_id: impl Into<String>, key: SigningKey) -> Self {
        Self {
            key,
            key_id: key_id.into(),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn sign(&self, playbook: &Playbook) -> String {
        sign(playbook, &self.key)
    }

    /// Return the playbook with its signature and key id set.
    pub fn seal(&self, mut playbook: Playbook) -> Playbook {
        playbook.playbook_signature = Some(self.sign(&playbook));
        playbook.playbook_key_id = Some(self.key_id.clone());
        playbook
    }
}

impl fmt::Debug for PlaybookSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybookSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Key registry
// ---------------------------------------------------------------------------

/// Result of looking up a key id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolution {
    Active(VerifyingKey),
    Revoked,
    NotFound,
}

/// Source of trusted public keys.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn resolve(&self, key_id: &str) -> Result<KeyResolution, SignatureError>;
}

/// Keys held in memory. Used by tests and embedders.
#[derive(Debug, Default)]
pub struct InMemoryKeyRegistry {
    keys: RwLock<HashMap<String, VerifyingKey>>,
    revoked: RwLock<HashSet<String>>,
}

impl InMemoryKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key_id: impl Into<String>, key: VerifyingKey) {
        self.keys.write().await.insert(key_id.into(), key);
    }

    pub async fn revoke(&self, key_id: &str) {
        self.revoked.write().await.insert(key_id.to_string());
    }
}

#[async_trait]
impl KeyRegistry for InMemoryKeyRegistry {
    async fn resolve(&self, key_id: &str) -> Result<KeyResolution, SignatureError> {
        if self.revoked.read().await.contains(key_id) {
            return Ok(KeyResolution::Revoked);
        }
        Ok(match self.keys.read().await.get(key_id) {
            Some(key) => KeyResolution::Active(*key),
            None => KeyResolution::NotFound,
        })
    }
}

/// Public keys published as files: `<key_id>.pub` holds the base64 key, and a
/// `<key_id>.revoked` marker next to it revokes it.
#[derive(Debug, Clone)]
pub struct DirectoryKeyRegistry {
    dir: PathBuf,
}

impl DirectoryKeyRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl KeyRegistry for DirectoryKeyRegistry {
    async fn resolve(&self, key_id: &str) -> Result<KeyResolution, SignatureError> {
        if !is_safe_key_id(key_id) {
            warn!(key_id, "Rejected key id that is not a plain file name");
            return Ok(KeyResolution::NotFound);
        }

        let revoked = self.dir.join(format!("{key_id}.revoked"));
        match tokio::fs::try_exists(&revoked).await {
            Ok(true) => return Ok(KeyResolution::Revoked),
            Ok(false) => {}
            Err(e) => {
                return Err(SignatureError::KeyMaterial {
                    reason: format!("failed to check {}: {e}", revoked.display()),
                });
            }
        }

        let path = self.dir.join(format!("{key_id}.pub"));
        let encoded = match tokio::fs::read_to_string(&path).await {
            Ok(encoded) => encoded,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(KeyResolution::NotFound);
            }
            Err(e) => {
                return Err(SignatureError::KeyMaterial {
                    reason: format!("failed to read {}: {e}", path.display()),
                });
            }
        };

        debug!(key_id, path = %path.display(), "Resolved public key file");
        decode_verifying_key(&encoded).map(KeyResolution::Active)
    }
}

/// Key ids double as file names, so they must not escape the key directory.
pub fn is_safe_key_id(key_id: &str) -> bool {
    persistence::is_plain_file_stem(key_id)
}

/// Resolves a playbook's signing key and checks its signature. Fail-closed.
#[derive(Clone)]
pub struct PlaybookVerifier {
    keys: Arc<dyn KeyRegistry>,
}

impl PlaybookVerifier {
    pub fn new(keys: Arc<dyn KeyRegistry>) -> Self {
        Self { keys }
    }

    pub async fn verify(&self, playbook: &Playbook) -> Result<(), SignatureError> {
        let (Some(signature), Some(key_id)) = (
            playbook.playbook_signature.as_deref(),
            playbook.playbook_key_id.as_deref(),
        ) else {
            return Err(SignatureError::MissingSignature {
                playbook_id: playbook.playbook_id.clone(),
            });
        };

        let signature = decode_signature(signature)?;

        let key = match self.keys.resolve(key_id).await? {
            KeyResolution::Active(key) => key,
            KeyResolution::Revoked => {
                return Err(SignatureError::KeyRevoked {
                    key_id: key_id.to_string(),
                });
            }
            KeyResolution::NotFound => {
                return Err(SignatureError::KeyNotFound {
                    key_id: key_id.to_string(),
                });
            }
        };

        let hashed = digest(&canonical_bytes(playbook));
        key.verify(&hashed, &signature)
            .map_err(|_| SignatureError::SignatureInvalid {
                playbook_id: playbook.playbook_id.clone(),
                version: playbook.playbook_version.clone(),
            })
    }
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// Generate a fresh signing key from the OS random source.
pub fn generate_signing_key() -> SigningKey {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    SigningKey::from_bytes(&seed)
}

pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    STANDARD.encode(key.to_bytes())
}

pub fn decode_verifying_key(encoded: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = decode_32(encoded, "public key")?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SignatureError::KeyMaterial {
        reason: format!("invalid public key: {e}"),
    })
}

pub fn encode_signing_key(key: &SigningKey) -> String {
    STANDARD.encode(key.to_bytes())
}

pub fn decode_signing_key(encoded: &str) -> Result<SigningKey, SignatureError> {
    decode_32(encoded, "private key").map(|seed| SigningKey::from_bytes(&seed))
}

fn decode_32(encoded: &str, what: &str) -> Result<[u8; 32], SignatureError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| SignatureError::KeyMaterial {
            reason: format!("{what} is not valid base64: {e}"),
        })?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| SignatureError::KeyMaterial {
        reason: format!("{what} must be 32 bytes, got {}", bytes.len()),
    })
}

/// Write `<key_id>.key` into `private_dir` and `<key_id>.pub` into `public_dir`.
pub fn write_key_pair(
    private_dir: &Path,
    public_dir: &Path,
    key_id: &str,
    key: &SigningKey,
) -> Result<(), SignatureError> {
    check_key_id(key_id)?;
    let io_err = |path: &Path, e: std::io::Error| SignatureError::KeyMaterial {
        reason: format!("failed to write {}: {e}", path.display()),
    };

    let private_path = private_dir.join(format!("{key_id}.key"));
    persistence::write_private(&private_path, encode_signing_key(key).as_bytes())
        .map_err(|e| io_err(&private_path, e))?;

    let public_path = public_dir.join(format!("{key_id}.pub"));
    persistence::atomic_write(
        &public_path,
        encode_verifying_key(&key.verifying_key()).as_bytes(),
    )
    .map_err(|e| io_err(&public_path, e))?;

    Ok(())
}

/// Load `<key_id>.key` from `private_dir`.
pub fn load_signing_key(private_dir: &Path, key_id: &str) -> Result<SigningKey, SignatureError> {
    check_key_id(key_id)?;
    let path = private_dir.join(format!("{key_id}.key"));
    let encoded = std::fs::read_to_string(&path).map_err(|e| SignatureError::KeyMaterial {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    decode_signing_key(&encoded)
}

/// Mark a published key as revoked by writing `<key_id>.revoked`.
pub fn revoke_key(public_dir: &Path, key_id: &str) -> Result<(), SignatureError> {
    check_key_id(key_id)?;
    let path = public_dir.join(format!("{key_id}.revoked"));
    persistence::atomic_write(&path, chrono::Utc::now().to_rfc3339().as_bytes()).map_err(|e| {
        SignatureError::KeyMaterial {
            reason: format!("failed to write {}: {e}", path.display()),
        }
    })
}

fn check_key_id(key_id: &str) -> Result<(), SignatureError> {
    if is_safe_key_id(key_id) {
        Ok(())
    } else {
        Err(SignatureError::KeyMaterial {
            reason: format!("key id '{key_id}' must be a plain file name"),
        })
    }
}
