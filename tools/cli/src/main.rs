//! Lockbox CLI - Command line interface for the encrypted secret store.
//!
//! This tool prompts for passphrases, parses arguments, and drives the
//! vault service. All cryptography and storage live in the core crates.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

use lockbox_app::{
    AppConfig, EntryPatch, FixedPassphrase, MutationReport, NewEntry, PassphraseSource,
    RemotePolicy, RemoteSpec, RemoteStatus, SyncOutcome, VaultService,
};
use lockbox_common::{Error, SensitiveBytes};
use lockbox_crypto::KdfParams;

/// Environment variable read instead of prompting, for scripted use.
const PASSPHRASE_ENV: &str = "LOCKBOX_PASSPHRASE";

#[derive(Parser)]
#[command(name = "lockbox")]
#[command(about = "Lockbox - Encrypted secret store")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file (default: ~/.lockbox/config.json if present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep all state under this directory instead of ~/.lockbox.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Account identifier used as the remote key.
    #[arg(short, long, global = true)]
    account: Option<String>,

    /// Use a shared directory as the remote.
    #[arg(long, global = true)]
    remote_dir: Option<PathBuf>,

    /// Fail writes when the remote push fails.
    #[arg(long, global = true)]
    require_remote: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault.
    Init {
        /// KDF strength: "interactive" or "sensitive".
        #[arg(short, long, default_value = "interactive")]
        strength: String,
    },

    /// Unlock and start a session.
    Unlock,

    /// End the session.
    Lock,

    /// Show vault status without unlocking.
    Status,

    /// Add an entry. The secret is prompted for.
    Add {
        /// Unique entry name.
        name: String,

        #[arg(short, long)]
        username: Option<String>,

        #[arg(long)]
        url: Option<String>,

        #[arg(short, long)]
        notes: Option<String>,

        /// Backup code; repeat for several.
        #[arg(short, long = "backup-code")]
        backup_codes: Vec<String>,
    },

    /// Show an entry by id or name.
    Get {
        identifier: String,

        /// Print the secret.
        #[arg(short, long)]
        show: bool,
    },

    /// List entries without secrets.
    List,

    /// Update an entry by id or name.
    Update {
        identifier: String,

        /// New entry name.
        #[arg(long)]
        name: Option<String>,

        #[arg(short, long)]
        username: Option<String>,

        #[arg(long)]
        url: Option<String>,

        #[arg(short, long)]
        notes: Option<String>,

        /// Prompt for a new secret.
        #[arg(short, long)]
        password: bool,

        /// Replace the backup codes; repeat for several.
        #[arg(short, long = "backup-code")]
        backup_codes: Vec<String>,
    },

    /// Remove an entry by id or name.
    Remove { identifier: String },

    /// Change the master passphrase.
    RotateMaster,

    /// Reconcile with the remote.
    Sync,

    /// Copy the encrypted vault to a file.
    Backup { dest: PathBuf },

    /// Replace the local vault with a backup file.
    Restore { src: PathBuf },
}

/// Terminal prompt, or the passphrase environment variable when set.
struct TerminalPassphrase;

impl PassphraseSource for TerminalPassphrase {
    fn passphrase(&self, prompt: &str) -> lockbox_common::Result<Zeroizing<Vec<u8>>> {
        if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
            return FixedPassphrase::new(value).passphrase(prompt);
        }
        let value = rpassword::prompt_password(prompt)?;
        if value.is_empty() {
            return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
        }
        Ok(Zeroizing::new(value.into_bytes()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli).await?;
    let service = VaultService::from_config(&config).context("Invalid configuration")?;

    match cli.command {
        Commands::Init { strength } => cmd_init(&config, &strength).await,
        Commands::Unlock => cmd_unlock(&service).await,
        Commands::Lock => cmd_lock(&service).await,
        Commands::Status => cmd_status(&service).await,
        Commands::Add {
            name,
            username,
            url,
            notes,
            backup_codes,
        } => {
            let mut entry = NewEntry::new(name, prompt_secret("Secret: ")?);
            if let Some(username) = username {
                entry = entry.username(username);
            }
            if let Some(url) = url {
                entry = entry.url(url);
            }
            if let Some(notes) = notes {
                entry = entry.notes(notes);
            }
            if !backup_codes.is_empty() {
                entry = entry.backup_codes(backup_codes);
            }
            cmd_add(&service, entry).await
        }
        Commands::Get { identifier, show } => cmd_get(&service, &identifier, show).await,
        Commands::List => cmd_list(&service).await,
        Commands::Update {
            identifier,
            name,
            username,
            url,
            notes,
            password,
            backup_codes,
        } => {
            let patch = EntryPatch {
                name,
                username,
                url,
                notes,
                password: if password {
                    Some(prompt_secret("New secret: ")?)
                } else {
                    None
                },
                backup_codes: (!backup_codes.is_empty()).then_some(backup_codes),
            };
            cmd_update(&service, &identifier, patch).await
        }
        Commands::Remove { identifier } => cmd_remove(&service, &identifier).await,
        Commands::RotateMaster => cmd_rotate(&service).await,
        Commands::Sync => cmd_sync(&service).await,
        Commands::Backup { dest } => cmd_backup(&service, &dest).await,
        Commands::Restore { src } => cmd_restore(&service, &src).await,
    }
}

/// Build the effective configuration: file, then flags.
async fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match (&cli.config, &cli.home) {
        (Some(path), _) => read_config(path).await?,
        (None, Some(home)) => {
            let path = home.join("config.json");
            if path.exists() {
                read_config(&path).await?
            } else {
                AppConfig::in_dir(home)
            }
        }
        (None, None) => {
            let defaults = AppConfig::default_paths()?;
            let path = defaults.vault_path.with_file_name("config.json");
            if path.exists() {
                read_config(&path).await?
            } else {
                defaults
            }
        }
    };

    if let Some(account) = &cli.account {
        config.account = account.clone();
    }
    if let Some(dir) = &cli.remote_dir {
        config.remote = Some(RemoteSpec::directory(dir));
    }
    if cli.require_remote {
        config.remote_policy = RemotePolicy::Required;
    }
    Ok(config)
}

async fn read_config(path: &Path) -> Result<AppConfig> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    AppConfig::from_json(&json).with_context(|| format!("Invalid config {}", path.display()))
}

fn prompt_secret(prompt: &str) -> Result<SensitiveBytes> {
    let secret = rpassword::prompt_password(prompt).context("Failed to read secret")?;
    Ok(SensitiveBytes::new(secret.into_bytes()))
}

fn print_report(action: &str, report: &MutationReport) {
    println!("{} (version {})", action, report.version);
    match &report.remote {
        RemoteStatus::Pushed => println!("  Remote: updated"),
        RemoteStatus::Skipped => {}
        RemoteStatus::Failed(reason) => println!("  Remote: not updated ({})", reason),
    }
}

/// Create a new vault.
async fn cmd_init(config: &AppConfig, strength: &str) -> Result<()> {
    let kdf_params = match strength {
        "interactive" => KdfParams::interactive(),
        "sensitive" => KdfParams::sensitive(),
        _ => {
            anyhow::bail!("Invalid strength. Use: interactive or sensitive");
        }
    };
    let mut config = config.clone();
    config.kdf = kdf_params;
    let service = VaultService::from_config(&config)?;

    let source = TerminalPassphrase;
    let passphrase = source.passphrase("New master passphrase: ")?;
    let confirmation = source.passphrase("Confirm master passphrase: ")?;

    let (vault, report) = service
        .init(&passphrase, &confirmation)
        .await
        .context("Failed to create vault")?;
    service.save_session(&vault).await?;

    print_report("Vault created", &report);
    println!("  ID: {}", vault.vault_id());
    println!("  Location: {}", config.vault_path.display());

    Ok(())
}

async fn cmd_unlock(service: &VaultService) -> Result<()> {
    let passphrase = TerminalPassphrase.passphrase("Master passphrase: ")?;
    let vault = service
        .unlock(&passphrase)
        .await
        .context("Failed to unlock vault")?;
    service.save_session(&vault).await?;

    println!(
        "Vault unlocked for {} minutes.",
        service.sessions().timeout().as_secs() / 60
    );
    Ok(())
}

async fn cmd_lock(service: &VaultService) -> Result<()> {
    service.clear_session().await?;
    println!("Vault locked.");
    Ok(())
}

async fn cmd_status(service: &VaultService) -> Result<()> {
    let status = service.status().await?;

    println!("Vault Information:");
    println!("  Location: {}", status.location);
    if !status.initialized {
        println!("  Not initialized. Run `lockbox init`.");
        return Ok(());
    }
    if let Some(id) = &status.vault_id {
        println!("  ID: {}", id);
    }
    if let Some(version) = status.version {
        println!("  Version: {}", version);
    }
    if let Some(modified) = &status.modified_at {
        println!("  Modified: {}", modified);
    }
    if let Some(fingerprint) = &status.fingerprint {
        println!("  Fingerprint: {}", fingerprint);
    }
    println!(
        "  Session: {}",
        if status.session_active { "active" } else { "none" }
    );
    if let Some(account) = &status.remote {
        println!("  Remote account: {}", account);
    }
    Ok(())
}

async fn cmd_add(service: &VaultService, entry: NewEntry) -> Result<()> {
    let mut vault = service.open(&TerminalPassphrase).await?;
    let (id, report) = service
        .add_entry(&mut vault, entry)
        .await
        .context("Failed to add entry")?;
    print_report("Entry added", &report);
    println!("  ID: {}", id);
    Ok(())
}

async fn cmd_get(service: &VaultService, identifier: &str, show: bool) -> Result<()> {
    let vault = service.open(&TerminalPassphrase).await?;
    let entry = vault.get(identifier)?;

    println!("{}", entry.name);
    println!("  ID: {}", entry.id);
    if !entry.username.is_empty() {
        println!("  Username: {}", entry.username);
    }
    if !entry.url.is_empty() {
        println!("  URL: {}", entry.url);
    }
    if show {
        println!(
            "  Secret: {}",
            String::from_utf8_lossy(entry.password.as_bytes())
        );
    } else {
        println!("  Secret: ******** (use --show)");
    }
    if !entry.notes.is_empty() {
        println!("  Notes: {}", entry.notes);
    }
    if !entry.backup_codes.is_empty() {
        println!("  Backup codes: {}", entry.backup_codes.len());
        if show {
            for code in &entry.backup_codes {
                println!("    {}", code);
            }
        }
    }
    println!("  Created: {}", entry.created_at);
    println!("  Updated: {}", entry.updated_at);
    Ok(())
}

async fn cmd_list(service: &VaultService) -> Result<()> {
    let vault = service.open(&TerminalPassphrase).await?;
    let entries = vault.list();

    if entries.is_empty() {
        println!("Vault is empty.");
    } else {
        for entry in entries {
            if entry.username.is_empty() {
                println!("  {}  {}", entry.id, entry.name);
            } else {
                println!("  {}  {} ({})", entry.id, entry.name, entry.username);
            }
        }
    }
    Ok(())
}

async fn cmd_update(service: &VaultService, identifier: &str, patch: EntryPatch) -> Result<()> {
    if patch.is_empty() {
        anyhow::bail!("Nothing to update");
    }
    let mut vault = service.open(&TerminalPassphrase).await?;
    let report = service
        .update_entry(&mut vault, identifier, patch)
        .await
        .context("Failed to update entry")?;
    print_report("Entry updated", &report);
    Ok(())
}

async fn cmd_remove(service: &VaultService, identifier: &str) -> Result<()> {
    let mut vault = service.open(&TerminalPassphrase).await?;
    let (entry, report) = service
        .remove_entry(&mut vault, identifier)
        .await
        .context("Failed to remove entry")?;
    print_report(&format!("Entry '{}' removed", entry.name), &report);
    Ok(())
}

async fn cmd_rotate(service: &VaultService) -> Result<()> {
    info!("Changing master passphrase");

    let source = TerminalPassphrase;
    let current = source.passphrase("Current master passphrase: ")?;
    let new = source.passphrase("New master passphrase: ")?;
    let confirmation = source.passphrase("Confirm new master passphrase: ")?;

    let mut vault = service
        .unlock(&current)
        .await
        .context("Failed to unlock vault")?;
    let report = service
        .rotate_master(&mut vault, &current, &new, &confirmation)
        .await
        .context("Failed to change master passphrase")?;

    print_report("Master passphrase changed", &report);
    Ok(())
}

async fn cmd_sync(service: &VaultService) -> Result<()> {
    match service.sync().await.context("Sync failed")? {
        SyncOutcome::Pushed { version, created } => {
            if created {
                println!("Remote created at version {}.", version);
            } else {
                println!("Remote updated to version {}.", version);
            }
        }
        SyncOutcome::RemoteNewer(envelope) => {
            println!(
                "Remote was newer; local vault replaced with version {}.",
                envelope.version
            );
        }
    }
    Ok(())
}

async fn cmd_backup(service: &VaultService, dest: &Path) -> Result<()> {
    let version = service
        .backup(dest)
        .await
        .context("Failed to write backup")?;
    println!("Backup of version {} written to {}", version, dest.display());
    Ok(())
}

async fn cmd_restore(service: &VaultService, src: &Path) -> Result<()> {
    let version = service
        .restore(src)
        .await
        .context("Failed to restore backup")?;
    println!("Restored version {} from {}", version, src.display());
    Ok(())
}
