//! Playgate CLI - operator interface for the Playgate playbook engine.
//!
//! Signs, registers, executes, and rolls back incident-response playbooks
//! against the file-backed stores configured for a workspace.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Playgate: deterministic, authority-gated incident response
#[derive(Parser, Debug)]
#[command(name = "playgate", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage signing keys
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Validate a playbook document without registering it
    Validate {
        /// Path to a playbook JSON document
        file: PathBuf,
    },
    /// Validate and sign a playbook document
    Sign {
        /// Path to a playbook JSON document
        file: PathBuf,
        /// Signing key identifier
        #[arg(short, long)]
        key_id: String,
        /// Output path (defaults to stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Register a signed playbook
    Register {
        /// Path to a signed playbook JSON document
        file: PathBuf,
    },
    /// Inspect registered playbooks
    Playbook {
        #[command(subcommand)]
        action: PlaybookAction,
    },
    /// Execute a registered playbook against a subject
    Execute {
        /// Playbook identifier
        #[arg(long)]
        playbook: String,
        /// Playbook version
        #[arg(long)]
        version: String,
        /// Subject the playbook acts on (e.g. a host id)
        #[arg(long)]
        subject: String,
        /// Authority action authorizing the execution
        #[arg(long)]
        authority: String,
        /// Explanation bundle justifying the execution
        #[arg(long)]
        bundle: String,
        /// Operator performing the execution
        #[arg(long)]
        by: String,
    },
    /// Roll back a completed or failed execution
    Rollback {
        /// Execution identifier
        execution_id: uuid::Uuid,
        /// Authority action authorizing the rollback
        #[arg(long)]
        authority: String,
        /// Operator performing the rollback
        #[arg(long)]
        by: String,
        /// Reason recorded with the rollback
        #[arg(long)]
        reason: String,
    },
    /// Inspect execution history
    Execution {
        #[command(subcommand)]
        action: ExecutionAction,
    },
    /// Inspect the audit ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default configuration file
    Init,
    /// Show the current effective configuration
    Show,
}

#[derive(clap::Subcommand, Debug)]
enum KeyAction {
    /// Generate a new Ed25519 signing key pair
    Generate {
        /// Key identifier
        key_id: String,
    },
    /// Revoke a published key
    Revoke {
        /// Key identifier
        key_id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum PlaybookAction {
    /// List registered playbooks
    List,
    /// Show one registered playbook
    Show {
        /// Playbook identifier
        playbook_id: String,
        /// Playbook version
        version: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ExecutionAction {
    /// List executions
    List,
    /// Show an execution and its rollback, if any
    Show {
        /// Execution identifier
        execution_id: uuid::Uuid,
    },
}

#[derive(clap::Subcommand, Debug)]
enum LedgerAction {
    /// Verify the ledger hash chain
    Verify,
    /// Print ledger entries
    List,
    /// Print audit entries the ledger has not accepted yet
    Pending,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "playgate", "playgate")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "playgate.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}
