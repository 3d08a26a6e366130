//! Configuration system for Playgate.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from the user config directory and/or `.playgate/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaygateConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub references: ReferencesConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Where the append-only logs live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub registry_file: String,
    pub executions_file: String,
    pub rollbacks_file: String,
    pub ledger_file: String,
    /// Audit entries waiting for the ledger.
    pub audit_outbox_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".playgate/data"),
            registry_file: "playbooks.jsonl".into(),
            executions_file: "executions.jsonl".into(),
            rollbacks_file: "rollbacks.jsonl".into(),
            ledger_file: "ledger.jsonl".into(),
            audit_outbox_file: "audit_outbox.jsonl".into(),
        }
    }
}

impl StorageConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(&self.registry_file)
    }

    pub fn executions_path(&self) -> PathBuf {
        self.data_dir.join(&self.executions_file)
    }

    pub fn rollbacks_path(&self) -> PathBuf {
        self.data_dir.join(&self.rollbacks_file)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(&self.ledger_file)
    }

    pub fn audit_outbox_path(&self) -> PathBuf {
        self.data_dir.join(&self.audit_outbox_file)
    }
}

/// Signing key locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Trusted public keys (`<key_id>.pub`, `<key_id>.revoked`).
    pub public_dir: PathBuf,
    /// Private signing keys (`<key_id>.key`). Only needed for signing.
    pub private_dir: PathBuf,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            public_dir: PathBuf::from(".playgate/keys/public"),
            private_dir: PathBuf::from(".playgate/keys/private"),
        }
    }
}

/// External reference stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferencesConfig {
    /// Authority actions as `<action_id>.json`.
    pub authority_dir: PathBuf,
    /// Explanation bundles as `<bundle_id>.json`.
    pub explanation_dir: PathBuf,
}

impl Default for ReferencesConfig {
    fn default() -> Self {
        Self {
            authority_dir: PathBuf::from(".playgate/authority"),
            explanation_dir: PathBuf::from(".playgate/explanations"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-step actuator timeout in milliseconds.
    pub step_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
        }
    }
}

impl ExecutionConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

impl PlaygateConfig {
    /// Resolve relative paths against `root`. Absolute paths are kept.
    pub fn rooted_at(mut self, root: &Path) -> Self {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        };
        anchor(&mut self.storage.data_dir);
        anchor(&mut self.keys.public_dir);
        anchor(&mut self.keys.private_dir);
        anchor(&mut self.references.authority_dir);
        anchor(&mut self.references.explanation_dir);
        self
    }
}

/// Load configuration from all sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `PLAYGATE_`)
/// 3. Workspace-local config (`.playgate/config.toml`)
/// 4. User config (`~/.config/playgate/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&PlaygateConfig>,
) -> Result<PlaygateConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(PlaygateConfig::default()));

    // User-level config
    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (PLAYGATE_EXECUTION__STEP_TIMEOUT_MS, PLAYGATE_STORAGE__DATA_DIR, etc.)
    figment = figment.merge(Env::prefixed("PLAYGATE_").split("__"));

    // Explicit overrides
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "playgate", "playgate")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".playgate").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PlaygateConfig::default();
        assert_eq!(config.execution.step_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.storage.ledger_path(),
            PathBuf::from(".playgate/data/ledger.jsonl")
        );
        assert_eq!(
            config.storage.audit_outbox_path(),
            PathBuf::from(".playgate/data/audit_outbox.jsonl")
        );
        assert_eq!(config.keys.public_dir, PathBuf::from(".playgate/keys/public"));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = PlaygateConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: PlaygateConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: PlaygateConfig = toml::from_str("[execution]\nstep_timeout_ms = 500\n").unwrap();
        assert_eq!(config.execution.step_timeout_ms, 500);
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_workspace_config_is_merged() {
        let dir = TempDir::new().unwrap();
        let path = workspace_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "[execution]\nstep_timeout_ms = 1500\n\n[storage]\nledger_file = \"audit.jsonl\"\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.execution.step_timeout_ms, 1500);
        assert_eq!(config.storage.ledger_file, "audit.jsonl");
        assert_eq!(config.storage.registry_file, "playbooks.jsonl");
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = PlaygateConfig::default();
        overrides.execution.step_timeout_ms = 42;
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.execution.step_timeout_ms, 42);
    }

    #[test]
    fn test_rooted_at() {
        let mut config = PlaygateConfig::default();
        config.keys.private_dir = PathBuf::from("/secure/keys");
        let rooted = config.rooted_at(Path::new("/srv/ir"));
        assert_eq!(rooted.storage.data_dir, PathBuf::from("/srv/ir/.playgate/data"));
        assert_eq!(rooted.keys.private_dir, PathBuf::from("/secure/keys"));
    }
}
