//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::ExecutionAction;
use crate::KeyAction;
use crate::LedgerAction;
use crate::PlaybookAction;
use anyhow::Context;
use playgate_core::config::{self, PlaygateConfig};
use playgate_core::engine::ExecutionRequest;
use playgate_core::ledger::JsonlLedger;
use playgate_core::persistence;
use playgate_core::rollback::RollbackRequest;
use playgate_core::signing::{self, PlaybookSigner};
use playgate_core::{ResponseApi, validator};
use serde_json::Value;
use std::path::Path;
use uuid::Uuid;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace),
        Commands::Key { action } => handle_key(action, workspace),
        Commands::Validate { file } => handle_validate(&file),
        Commands::Sign { file, key_id, out } => {
            handle_sign(&file, &key_id, out.as_deref(), workspace)
        }
        Commands::Register { file } => handle_register(&file, workspace).await,
        Commands::Playbook { action } => handle_playbook(action, workspace).await,
        Commands::Execute {
            playbook,
            version,
            subject,
            authority,
            bundle,
            by,
        } => {
            let request = ExecutionRequest {
                playbook_id: playbook,
                playbook_version: version,
                subject_id: subject,
                authority_action_id: authority,
                explanation_bundle_id: bundle,
                executed_by: by,
            };
            handle_execute(&request, workspace).await
        }
        Commands::Rollback {
            execution_id,
            authority,
            by,
            reason,
        } => {
            let request = RollbackRequest {
                execution_id,
                authority_action_id: authority,
                rolled_back_by: by,
                reason,
            };
            handle_rollback(&request, workspace).await
        }
        Commands::Execution { action } => handle_execution(action, workspace).await,
        Commands::Ledger { action } => handle_ledger(action, workspace).await,
    }
}

/// Effective configuration with relative paths anchored at the workspace.
fn load_config(workspace: &Path) -> anyhow::Result<PlaygateConfig> {
    let config = config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    Ok(config.rooted_at(workspace))
}

async fn open_api(workspace: &Path) -> anyhow::Result<ResponseApi> {
    let config = load_config(workspace)?;
    tracing::debug!("Opening stores under {}", config.storage.data_dir.display());
    Ok(ResponseApi::from_config(&config).await?)
}

fn read_document(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = config::workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let toml_str = toml::to_string_pretty(&PlaygateConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = config::load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn handle_key(action: KeyAction, workspace: &Path) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    match action {
        KeyAction::Generate { key_id } => {
            let key = signing::generate_signing_key();
            signing::write_key_pair(
                &config.keys.private_dir,
                &config.keys.public_dir,
                &key_id,
                &key,
            )?;
            println!("Generated key '{}'", key_id);
            println!(
                "  public:  {}",
                signing::encode_verifying_key(&key.verifying_key())
            );
            println!("  private: {}", config.keys.private_dir.display());
            Ok(())
        }
        KeyAction::Revoke { key_id } => {
            signing::revoke_key(&config.keys.public_dir, &key_id)?;
            tracing::info!("Revoked signing key '{}'", key_id);
            println!("Revoked key '{}'", key_id);
            Ok(())
        }
    }
}

fn handle_validate(file: &Path) -> anyhow::Result<()> {
    let playbook = validator::validate(&read_document(file)?)?;
    println!(
        "Playbook '{}' version {} is valid ({} steps)",
        playbook.playbook_id,
        playbook.playbook_version,
        playbook.steps.len()
    );
    Ok(())
}

fn handle_sign(
    file: &Path,
    key_id: &str,
    out: Option<&Path>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let playbook = validator::validate(&read_document(file)?)?;
    let key = signing::load_signing_key(&config.keys.private_dir, key_id)?;
    let sealed = PlaybookSigner::new(key_id, key).seal(playbook);

    match out {
        Some(path) => {
            persistence::atomic_write_json(path, &sealed)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Signed playbook written to {}", path.display());
            Ok(())
        }
        None => print_json(&sealed),
    }
}

async fn handle_register(file: &Path, workspace: &Path) -> anyhow::Result<()> {
    let api = open_api(workspace).await?;
    let registered = api.register_document(&read_document(file)?).await?;
    println!(
        "Registered '{}' version {} (sha256 {})",
        registered.playbook.playbook_id,
        registered.playbook.playbook_version,
        registered.content_hash
    );
    Ok(())
}

async fn handle_playbook(action: PlaybookAction, workspace: &Path) -> anyhow::Result<()> {
    let api = open_api(workspace).await?;
    match action {
        PlaybookAction::List => {
            let playbooks = api.playbooks().await;
            if playbooks.is_empty() {
                println!("No playbooks registered.");
                return Ok(());
            }
            println!("Registered playbooks ({}):", playbooks.len());
            for entry in playbooks {
                println!(
                    "  {} {}  {}  [{} steps, scope {}]",
                    entry.playbook.playbook_id,
                    entry.playbook.playbook_version,
                    entry.playbook.playbook_name,
                    entry.playbook.steps.len(),
                    entry.playbook.scope
                );
            }
            Ok(())
        }
        PlaybookAction::Show {
            playbook_id,
            version,
        } => print_json(&api.playbook(&playbook_id, &version).await?),
    }
}

async fn handle_execute(request: &ExecutionRequest, workspace: &Path) -> anyhow::Result<()> {
    let api = open_api(workspace).await?;
    let record = api.execute(request).await?;
    print_json(&record)?;
    eprintln!("Execution {} finished: {}", record.execution_id, record.status);
    Ok(())
}

async fn handle_rollback(request: &RollbackRequest, workspace: &Path) -> anyhow::Result<()> {
    let api = open_api(workspace).await?;
    let record = api.rollback(request).await?;
    print_json(&record)?;
    eprintln!(
        "Execution {} rolled back ({} steps reversed)",
        record.execution_id,
        record.reversed_steps.len()
    );
    Ok(())
}

async fn handle_execution(action: ExecutionAction, workspace: &Path) -> anyhow::Result<()> {
    let api = open_api(workspace).await?;
    match action {
        ExecutionAction::List => {
            let executions = api.executions().await;
            if executions.is_empty() {
                println!("No executions recorded.");
                return Ok(());
            }
            for record in executions {
                println!(
                    "  {}  {} {}  subject {}  {}",
                    record.execution_id,
                    record.playbook_id,
                    record.playbook_version,
                    record.subject_id,
                    record.status
                );
            }
            Ok(())
        }
        ExecutionAction::Show { execution_id } => show_execution(&api, execution_id).await,
    }
}

async fn show_execution(api: &ResponseApi, execution_id: Uuid) -> anyhow::Result<()> {
    let record = api.execution(execution_id).await?;
    let rollback = api.rollback_of(execution_id).await?;
    print_json(&serde_json::json!({
        "execution": record,
        "rollback": rollback,
    }))
}

async fn handle_ledger(action: LedgerAction, workspace: &Path) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let ledger = JsonlLedger::open(config.storage.ledger_path()).await?;
    match action {
        LedgerAction::Verify => {
            let report = ledger.verify().await;
            if report.is_valid {
                println!("Ledger intact ({} entries)", report.checked_entries);
                Ok(())
            } else {
                let at = report
                    .first_invalid
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "?".into());
                tracing::warn!("Ledger verification failed after {} entries", report.checked_entries);
                anyhow::bail!("Ledger chain broken at entry {}", at)
            }
        }
        LedgerAction::List => {
            for entry in ledger.entries().await {
                println!(
                    "  {}  {:<20} {:<20} {}:{}  by {}",
                    entry.timestamp.to_rfc3339(),
                    entry.component,
                    entry.action_type.as_str(),
                    entry.subject.kind,
                    entry.subject.id,
                    entry.actor
                );
            }
            Ok(())
        }
        LedgerAction::Pending => show_pending_audit(workspace).await,
    }
}

async fn show_pending_audit(workspace: &Path) -> anyhow::Result<()> {
    let api = open_api(workspace).await?;
    let pending = api.pending_audit().await;
    if pending.is_empty() {
        println!("No audit entries waiting for the ledger.");
        return Ok(());
    }
    tracing::warn!("{} audit entries are waiting for the ledger", pending.len());
    for entry in pending {
        println!(
            "  {}  {:<20} {}:{}  by {}",
            entry.timestamp.to_rfc3339(),
            entry.action_type.as_str(),
            entry.subject.kind,
            entry.subject.id,
            entry.actor
        );
    }
    Ok(())
}
