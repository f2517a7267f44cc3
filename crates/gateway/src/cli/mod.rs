//! Admin CLI.
//!
//! `model-bazaar [serve|backup|restore|users|models|version]` — exit 0
//! on success, non-zero with the error on stderr.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use mb_domain::error::{Error, Result};
use mb_metadata::store::StatusKind;
use mb_metadata::MetadataStore;

use crate::backup::{restore_archive, run_backup, BackupConfig};

#[derive(Parser)]
#[command(name = "model-bazaar", about = "Self-hosted model control plane")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the control-plane server (default).
    Serve,
    /// Run one backup now using the persisted configuration.
    Backup {
        /// Override the persisted backup configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Restore a backup archive into MODEL_BAZAAR_DIR.
    Restore {
        #[arg(long)]
        archive: PathBuf,
    },
    /// User administration.
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    /// Model administration.
    Models {
        #[command(subcommand)]
        command: ModelsCommand,
    },
    Version,
}

#[derive(Subcommand)]
pub enum UsersCommand {
    List,
    Delete { username: String },
    Promote { username: String },
}

#[derive(Subcommand)]
pub enum ModelsCommand {
    List,
    ResetStatus {
        model_id: Uuid,
        /// `train`, `deploy`, or `cache_refresh`.
        #[arg(long, default_value = "train")]
        kind: String,
    },
}

fn bazaar_dir() -> Result<PathBuf> {
    std::env::var("MODEL_BAZAAR_DIR")
        .map(PathBuf::from)
        .map_err(|_| Error::InvalidArgument("MODEL_BAZAAR_DIR is not set".into()))
}

fn open_store() -> Result<MetadataStore> {
    let uri = std::env::var("DATABASE_URI")
        .map_err(|_| Error::InvalidArgument("DATABASE_URI is not set".into()))?;
    MetadataStore::open(&uri)
}

pub async fn run_backup_command(config_override: Option<PathBuf>) -> Result<()> {
    let dir = bazaar_dir()?;
    let config = match config_override {
        Some(path) => {
            let bytes = std::fs::read(&path)
                .map_err(|e| Error::InvalidArgument(format!("cannot read {}: {e}", path.display())))?;
            serde_json::from_slice::<BackupConfig>(&bytes)
                .map_err(|e| Error::InvalidArgument(format!("bad backup config: {e}")))?
        }
        None => BackupConfig::load(&dir)?,
    };
    let archive = run_backup(&config, &dir).await?;
    println!("{archive}");
    Ok(())
}

pub fn run_restore_command(archive: &PathBuf) -> Result<()> {
    let dir = bazaar_dir()?;
    restore_archive(archive, &dir)?;
    println!("restored into {}", dir.display());
    Ok(())
}

pub fn run_users_command(command: UsersCommand) -> Result<()> {
    let store = open_store()?;
    match command {
        UsersCommand::List => {
            for user in store.list_users() {
                println!(
                    "{}\t{}\t{}\t{}",
                    user.id,
                    user.username,
                    user.email.unwrap_or_default(),
                    if user.global_admin { "admin" } else { "user" },
                );
            }
        }
        UsersCommand::Delete { username } => {
            let user = store
                .user_by_username(&username)
                .ok_or_else(|| Error::NotFound(format!("user {username}")))?;
            store.delete_user(user.id)?;
            println!("deleted {username}");
        }
        UsersCommand::Promote { username } => {
            let user = store
                .user_by_username(&username)
                .ok_or_else(|| Error::NotFound(format!("user {username}")))?;
            store.set_global_admin(user.id, true)?;
            println!("promoted {username}");
        }
    }
    Ok(())
}

pub fn run_models_command(command: ModelsCommand) -> Result<()> {
    let store = open_store()?;
    match command {
        ModelsCommand::List => {
            for model in store.list_models() {
                println!(
                    "{}\t{}\ttrain={}\tdeploy={}",
                    model.id, model.name, model.train_status, model.deploy_status,
                );
            }
        }
        ModelsCommand::ResetStatus { model_id, kind } => {
            let kind = match kind.as_str() {
                "train" => StatusKind::Train,
                "deploy" => StatusKind::Deploy,
                "cache_refresh" => StatusKind::CacheRefresh,
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown status kind {other:?}"
                    )))
                }
            };
            store.reset_status(model_id, kind)?;
            println!("reset {model_id}");
        }
    }
    Ok(())
}
