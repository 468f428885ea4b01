//! mailsync - Inspection CLI over the persisted sync state

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use mailsync::config::Settings;
use mailsync::domain::AccountId;
use mailsync::services::{ConflictStorage, SyncStorage};
use mailsync::StorageLayer;

#[derive(Debug, Parser)]
#[command(name = "mailsync", version, about = "Inspect mailbox sync state")]
struct Cli {
    /// Database file (defaults to the configured or platform data path)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Settings file (defaults to the platform config path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sync state of every account
    Status,
    /// Recorded sync failures
    Failures {
        /// Only this account
        #[arg(long)]
        account: Option<String>,
    },
    /// Conflicts waiting for a decision
    Conflicts {
        /// Only this account
        #[arg(long)]
        account: Option<String>,
    },
    /// Conflict resolution audit trail
    Audit,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        tracing::error!("mailsync error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let database = match cli.database {
        Some(path) => path,
        None => {
            let settings_path = match cli.config {
                Some(path) => path,
                None => Settings::default_path()?,
            };
            let mut settings = Settings::load(&settings_path)
                .with_context(|| format!("loading {}", settings_path.display()))?;
            settings.apply_env_overrides()?;
            settings.database_path()?
        }
    };

    tracing::debug!(path = %database.display(), "opening database");
    let storage = StorageLayer::open(&database)
        .await
        .with_context(|| format!("opening {}", database.display()))?;

    match cli.command {
        Command::Status => {
            let accounts = SyncStorage::accounts(&storage).await?;
            print(cli.json, &accounts, |account| {
                format!(
                    "{}\t{}\t{}\tcursor={}\tlast_sync={}",
                    account.id,
                    account.provider.as_str(),
                    account.status.as_str(),
                    account.cursor.as_ref().map_or("-", |c| c.as_str()),
                    account
                        .last_sync_at
                        .map_or_else(|| "never".to_string(), |at| at.to_rfc3339()),
                )
            })
        }
        Command::Failures { account } => {
            let account = account.map(AccountId::from);
            let failures = storage.failures(account.as_ref()).await?;
            print(cli.json, &failures, |failure| {
                format!(
                    "{}\t{}\t{}\tattempt={}\t{:?}\t{}",
                    failure.account_id,
                    failure.item_id.as_ref().map_or("<account>", |id| id.as_str()),
                    failure.status.as_str(),
                    failure.attempt,
                    failure.error.kind,
                    failure.error.message,
                )
            })
        }
        Command::Conflicts { account } => {
            let mut conflicts = storage.pending_conflicts().await?;
            if let Some(account) = account.map(AccountId::from) {
                conflicts.retain(|c| c.account_id == account);
            }
            print(cli.json, &conflicts, |conflict| {
                format!(
                    "{}\t{}\t{}\t{}\t[{}]",
                    conflict.id,
                    conflict.account_id,
                    conflict.email_id,
                    conflict.conflict_type.as_str(),
                    conflict.conflicting_fields.join(", "),
                )
            })
        }
        Command::Audit => {
            let resolutions = storage.resolutions().await?;
            print(cli.json, &resolutions, |resolution| {
                format!(
                    "{}\t{}\t{}\t{}\t{}",
                    resolution.resolved_at.to_rfc3339(),
                    resolution.conflict_id,
                    resolution.email_id,
                    resolution.conflict_type.as_str(),
                    resolution.strategy.as_str(),
                )
            })
        }
    }
}

fn print<T: Serialize>(json: bool, rows: &[T], line: impl Fn(&T) -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
    } else if rows.is_empty() {
        println!("(none)");
    } else {
        for row in rows {
            println!("{}", line(row));
        }
    }
    Ok(())
}
