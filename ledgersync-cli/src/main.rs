mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::CliConfig;
use ledgersync_core::handlers::{LedgerService, StatusResponse, SyncResponse};
use ledgersync_core::ledger::{PayeeRule, RuleKind};
use ledgersync_core::sync::{
    DeviceIdentity, LedgerLocks, RelayClient, ResetConfirmation, SystemClock,
};
use ledgersync_core::{platform, BankTransaction, Database, KeyManager, ReconcileOptions};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// LedgerSync CLI - encrypted ledger sync and bank import
#[derive(Parser)]
#[command(name = "ledgersync")]
#[command(about = "Encrypted multi-device ledger sync and bank import", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "LEDGERSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Ledger id
    #[arg(long, global = true, env = "LEDGERSYNC_LEDGER")]
    ledger: Option<String>,

    /// Ledger database file
    #[arg(long, global = true, env = "LEDGERSYNC_DATABASE")]
    database: Option<PathBuf>,

    /// Relay base URL
    #[arg(long, global = true, env = "LEDGERSYNC_RELAY_URL")]
    relay: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a local ledger database and save the CLI configuration
    Init {
        /// Name this device shows on the relay
        #[arg(long)]
        device_name: Option<String>,
    },

    /// Create the ledger key, or rotate it
    KeyMake {
        /// Replace an existing key and re-encrypt the log
        #[arg(long)]
        rotate: bool,
    },

    /// Check the password and load the key
    KeyTest,

    /// Push local changes and merge remote ones
    Sync,

    /// Discard local state and rebuild it from the relay
    SyncReset {
        /// Confirm that local unsynced changes may be lost
        #[arg(long)]
        yes: bool,
    },

    /// Look for gaps in the sync log and fill them from the relay
    SyncRepair,

    /// Import a JSON array of bank transactions into an account
    Import {
        /// Target account id
        #[arg(long)]
        account: String,

        /// JSON file with the statement
        file: PathBuf,

        /// Show what would change without writing
        #[arg(long)]
        preview: bool,

        /// Largest date distance in days for matching
        #[arg(long)]
        window_days: Option<i64>,

        /// Add rows again even if their transaction was deleted
        #[arg(long)]
        reimport_deleted: bool,
    },

    /// Add a payee rule
    RuleAdd {
        /// Text to compare with the bank's payee
        #[arg(long)]
        pattern: String,

        /// Payee id to assign
        #[arg(long)]
        payee: String,

        /// is, contains or one_of
        #[arg(long, default_value = "contains")]
        kind: String,

        /// Limit the rule to one account
        #[arg(long)]
        account: Option<String>,

        #[arg(long, default_value_t = 0)]
        priority: i64,
    },

    /// Show sync status
    Status,
}

/// Effective settings after merging flags, env and the config file.
struct Settings {
    config_path: PathBuf,
    file: CliConfig,
    ledger_id: String,
    database: PathBuf,
    relay_url: Option<String>,
    device_name: String,
}

impl Settings {
    fn resolve(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(platform::get_default_config_path);
        let file = CliConfig::load(&config_path)?;

        let ledger_id = cli
            .ledger
            .clone()
            .or_else(|| file.ledger_id.clone())
            .context("no ledger configured; pass --ledger or run `ledgersync init --ledger <id>`")?;
        let database = cli
            .database
            .clone()
            .or_else(|| file.database.clone())
            .unwrap_or_else(|| platform::get_default_ledger_path(&ledger_id));
        let relay_url = cli.relay.clone().or_else(|| file.relay_url.clone());
        let device_name = file
            .device_name
            .clone()
            .unwrap_or_else(|| "ledgersync-cli".to_string());

        Ok(Self {
            config_path,
            file,
            ledger_id,
            database,
            relay_url,
            device_name,
        })
    }

    fn open(&self) -> Result<LedgerService> {
        if let Some(parent) = self.database.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&self.database)
            .with_context(|| format!("opening {}", self.database.display()))?;
        let service = LedgerService::open(
            &self.ledger_id,
            db,
            &self.device_name,
            Arc::new(KeyManager::new()),
            Arc::new(SystemClock),
            LedgerLocks::new(),
        )?;
        Ok(service)
    }
}

fn read_password(prompt: &str) -> Result<String> {
    if let Ok(password) = std::env::var("LEDGERSYNC_PASSWORD") {
        return Ok(password);
    }
    Ok(rpassword::prompt_password(prompt)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn check(response: StatusResponse, action: &str) -> Result<()> {
    match response.error {
        None => Ok(()),
        Some(error) => bail!("{} failed ({}): {}", action, error.reason, error.message),
    }
}

/// Load the key, fetching the published key record from the relay when
/// this device has none.
async fn unlock(service: LedgerService, relay_url: Option<&str>) -> Result<LedgerService> {
    let service = match relay_url {
        Some(url) => {
            // The key record endpoint is public, so a throwaway identity will do.
            let probe = DeviceIdentity::generate(Uuid::new_v4(), "key-test");
            service.with_remote(Arc::new(RelayClient::new(url, &probe)?))
        }
        None => service,
    };
    let password = read_password("Ledger password: ")?;
    let ledger_id = service.ledger_id().to_string();
    check(service.key_test(&ledger_id, &password).await, "key-test")?;
    Ok(service)
}

/// Unlock, register this device with the relay, and attach the relay.
async fn connect(settings: &Settings) -> Result<LedgerService> {
    let url = settings
        .relay_url
        .as_deref()
        .context("no relay configured; pass --relay or set relay_url in the config file")?;
    let service = unlock(settings.open()?, Some(url)).await?;

    let identity = service.device_identity()?;
    let client = RelayClient::new(url, &identity)?;
    client
        .register_device(
            service.ledger_id(),
            &identity.device_name,
            &identity.public_key_bytes(),
        )
        .await?;
    service.configure_sync(Some(url), true)?;
    Ok(service.with_remote(Arc::new(client)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = Settings::resolve(&cli)?;

    match cli.command {
        Commands::Init { device_name } => {
            let mut file = settings.file.clone();
            file.ledger_id = Some(settings.ledger_id.clone());
            file.database = Some(settings.database.clone());
            file.relay_url = settings.relay_url.clone();
            if device_name.is_some() {
                file.device_name = device_name;
            }
            file.save(&settings.config_path)?;

            let settings = Settings {
                device_name: file
                    .device_name
                    .clone()
                    .unwrap_or(settings.device_name),
                ..settings
            };
            let service = settings.open()?;
            service.configure_sync(settings.relay_url.as_deref(), settings.relay_url.is_some())?;
            info!(
                ledger_id = %settings.ledger_id,
                database = %settings.database.display(),
                config = %settings.config_path.display(),
                "Ledger initialized"
            );
            print_json(&service.status()?)?;
        }
        Commands::KeyMake { rotate } => {
            let service = settings.open()?;
            let password = read_password("New ledger password: ")?;
            if std::env::var("LEDGERSYNC_PASSWORD").is_err()
                && rpassword::prompt_password("Repeat password: ")? != password
            {
                bail!("passwords do not match");
            }
            if rotate {
                // Rotation re-encrypts the log, which needs the current key.
                let current = read_password("Current ledger password: ")?;
                check(service.key_test(&settings.ledger_id, &current).await, "key-test")?;
            }
            check(service.key_make(&password, rotate).await, "key-make")?;
            println!("Key installed for ledger {}", settings.ledger_id);
        }
        Commands::KeyTest => {
            unlock(settings.open()?, settings.relay_url.as_deref()).await?;
            println!("Password accepted");
        }
        Commands::Sync => {
            let service = connect(&settings).await?;
            match service.sync().await {
                SyncResponse::Messages { messages } => {
                    info!(applied = messages.len(), "Sync complete");
                    print_json(&messages)?;
                }
                SyncResponse::Error { error } => {
                    print_json(&error)?;
                    bail!("sync failed ({})", error.reason);
                }
            }
        }
        Commands::SyncReset { yes } => {
            if !yes {
                bail!("sync-reset replaces all local data with the relay's copy; rerun with --yes");
            }
            let service = connect(&settings).await?;
            check(service.sync_reset(ResetConfirmation::confirmed()).await, "sync-reset")?;
            print_json(&service.status()?)?;
        }
        Commands::SyncRepair => {
            let service = connect(&settings).await?;
            let response = service.sync_repair().await;
            print_json(&response)?;
            if let Some(error) = response.error {
                bail!("sync-repair: {}", error.message);
            }
        }
        Commands::Import {
            account,
            file,
            preview,
            window_days,
            reimport_deleted,
        } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let transactions: Vec<BankTransaction> = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", file.display()))?;
            let mut options = ReconcileOptions {
                reimport_deleted,
                ..Default::default()
            };
            if let Some(days) = window_days {
                options.date_window_days = days;
            }

            let service = unlock(settings.open()?, None).await?;
            let response = service
                .transactions_import(&account, &transactions, preview, &options)
                .await;
            print_json(&response)?;
            if let Some(error) = response.error {
                bail!("import failed ({})", error.reason);
            }
        }
        Commands::RuleAdd {
            pattern,
            payee,
            kind,
            account,
            priority,
        } => {
            let service = unlock(settings.open()?, None).await?;
            let rule = PayeeRule {
                id: Uuid::new_v4().to_string(),
                account_id: account,
                kind: RuleKind::parse(&kind),
                pattern,
                payee_id: payee,
                priority,
                active: true,
            };
            service.save_payee_rule(&rule).await?;
            println!("Rule {} added", rule.id);
        }
        Commands::Status => {
            print_json(&settings.open()?.status()?)?;
        }
    }

    Ok(())
}
