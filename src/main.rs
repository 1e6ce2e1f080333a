//! Operator CLI for backup-sync.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use backup_sync::config::{ConfigPatch, JsonConfigStore};
use backup_sync::logging::{init_tracing, DEFAULT_FILTER};
use backup_sync::process::{Password, TokioProcessRunner};
use backup_sync::service::{BackupSyncService, ServiceSettings};
use backup_sync::sync::DEFAULT_SYNC_PROGRAM;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

const PASSWORD_ENV: &str = "BACKUP_SYNC_PASSWORD";

#[derive(Parser)]
#[command(name = "backup-sync")]
#[command(about = "Passwordless SSH setup and local backup inventory")]
#[command(version)]
struct Cli {
    /// Directory holding the SSH identity and config.json
    #[arg(long, env = "BACKUP_SYNC_DATA_DIR", default_value = "/data", global = true)]
    data_dir: PathBuf,

    /// Backup-execution script run by `sync`
    #[arg(long, env = "BACKUP_SYNC_PROGRAM", default_value = DEFAULT_SYNC_PROGRAM, global = true)]
    sync_program: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration and SSH trust state
    Status,
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Install a fresh key on the remote account and verify it.
    /// The password is read from BACKUP_SYNC_PASSWORD or the first line of stdin.
    SetupSsh {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 22)]
        port: u16,
        #[arg(long)]
        user: String,
    },
    /// Delete the local SSH identity
    ResetSsh,
    /// Replace the local SSH identity with a new keypair
    RegenerateKey,
    /// Print the public key
    PublicKey,
    /// Check key-only connectivity to the configured server
    TestConnection,
    /// List recent archives in the configured remote backup path
    TestBackupPath,
    /// List local backups, newest first
    List,
    /// List local backups past their retention window
    Expired,
    /// Delete one local backup
    Delete {
        /// Absolute path inside the backup storage directory
        path: PathBuf,
    },
    /// Run the backup-execution script now
    Sync,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Apply a partial update given as a JSON object
    Set {
        /// e.g. '{"schedule": "0 4 * * *"}'
        patch: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_password() -> Result<Password> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(Password::new(password));
    }
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let password = Password::new(line.trim_end_matches(['\r', '\n']));
    if password.is_empty() {
        bail!("No password supplied (set {PASSWORD_ENV} or pipe it on stdin)");
    }
    Ok(password)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(DEFAULT_FILTER);
    let cli = Cli::parse();

    let mut settings = ServiceSettings::new(&cli.data_dir);
    settings.sync_program = cli.sync_program;
    let store = Arc::new(JsonConfigStore::new(settings.config_path()));
    let service = BackupSyncService::new(settings, Arc::new(TokioProcessRunner::new()), store);

    match cli.command {
        Commands::Status => print_json(&service.status().await)?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => print_json(&service.configuration().await)?,
            ConfigCommands::Set { patch } => {
                let patch: ConfigPatch = serde_json::from_str(&patch).context("Invalid configuration JSON")?;
                if patch.is_empty() {
                    bail!("Patch contains no recognised configuration keys");
                }
                print_json(&service.update_config(patch).await?)?;
            }
        },
        Commands::SetupSsh { host, port, user } => {
            let password = read_password()?;
            let report = service.setup_ssh(&host, port, &user, password).await?;
            print_json(&report)?;
        }
        Commands::ResetSsh => {
            service.reset_ssh().await?;
            print_json(&json!({"success": true, "message": "SSH configuration reset"}))?;
        }
        Commands::RegenerateKey => {
            service.regenerate_key().await?;
            print_json(&json!({"success": true, "public_key": service.public_key().await?}))?;
        }
        Commands::PublicKey => println!("{}", service.public_key().await?),
        Commands::TestConnection => {
            service.test_connection().await?;
            print_json(&json!({"success": true, "message": "Connection successful"}))?;
        }
        Commands::TestBackupPath => {
            let backups = service.test_backup_path().await?;
            print_json(&json!({
                "success": true,
                "message": format!("Found {} recent backup(s)", backups.len()),
                "backups": backups,
            }))?;
        }
        Commands::List => print_json(&service.list_backups().await?)?,
        Commands::Expired => print_json(&service.expired_backups(Utc::now()).await?)?,
        Commands::Delete { path } => {
            service.delete_backup(&path).await?;
            print_json(&json!({"success": true, "message": "Backup deleted successfully"}))?;
        }
        Commands::Sync => {
            let output = service.manual_sync().await?;
            print!("{}", output.stdout);
        }
    }

    Ok(())
}
