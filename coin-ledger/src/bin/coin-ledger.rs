//! Coin ledger operator CLI
//!
//! Inspection and manual reconciliation against the durable store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coin_ledger::{AccountId, Config, Ledger, StorageBackend};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "coin-ledger")]
#[command(about = "Coin ledger operator tools")]
#[command(version)]
struct Cli {
    /// Config file (TOML); environment variables override it
    #[arg(short, long, global = true, env = "LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show an account and its balance
    Balance {
        /// Account id
        account: String,
    },

    /// Create the account if it does not exist
    Ensure {
        /// Account id
        account: String,
    },

    /// Gift coins to the account holding a share code
    Gift {
        /// Account share code
        code: String,

        /// Coins to credit
        amount: u64,
    },

    /// Apply an external credit exactly once
    ApplyCredit {
        /// Idempotency key (payment id)
        event_id: String,

        /// Account id
        account: String,

        /// Coins to credit
        amount: u64,
    },

    /// Usage history
    Usage {
        #[command(subcommand)]
        action: UsageCommand,
    },

    /// Published bundles and rates
    Pricing,
}

#[derive(Subcommand)]
enum UsageCommand {
    /// List records, newest first
    List {
        /// Account id
        account: String,
    },

    /// Delete one record
    Delete {
        /// Account id
        account: String,

        /// Record id
        record: Uuid,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = load_config(&cli)?;
    if config.backend == StorageBackend::Memory {
        tracing::warn!("Memory backend selected; changes will not persist");
    }
    let ledger = Ledger::open(config).await.context("opening ledger")?;

    match cli.command {
        Commands::Balance { account } => {
            let account = ledger.account(&AccountId::new(account)).await?;
            println!("{}", serde_json::to_string_pretty(&account)?);
        }
        Commands::Ensure { account } => {
            let account = ledger.ensure_account(&AccountId::new(account)).await?;
            println!("{}", serde_json::to_string_pretty(&account)?);
        }
        Commands::Gift { code, amount } => {
            let account = ledger.gift(&code, amount).await?;
            println!("{} now has {} coins", account.id, account.balance);
        }
        Commands::ApplyCredit {
            event_id,
            account,
            amount,
        } => {
            let outcome = ledger
                .intake()
                .apply_credit(&event_id, &AccountId::new(account), amount)
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Usage { action } => match action {
            UsageCommand::List { account } => {
                let records = ledger.usage(&AccountId::new(account)).await?;
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
            UsageCommand::Delete { account, record } => {
                if ledger.delete_usage(&AccountId::new(account), record).await? {
                    println!("deleted {}", record);
                } else {
                    anyhow::bail!("no usage record {} for that account", record);
                }
            }
        },
        Commands::Pricing => {
            let pricing = serde_json::json!({
                "rates": ledger.rates(),
                "bundles": coin_ledger::pricing::bundles(),
            });
            println!("{}", serde_json::to_string_pretty(&pricing)?);
        }
    }

    Ok(())
}
