//! Snapshot/backup service.
//!
//! Tars the model artifacts plus the metadata document into
//! `backup_{timestamp}.tar.gz`, uploads it to the configured
//! destination (local directory, S3, Azure Blob, or GCS via
//! `object_store`), and prunes everything beyond the most recent
//! `backup_limit` archives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};

use mb_domain::error::{Error, Result};

pub const DEFAULT_BACKUP_LIMIT: usize = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Backup destination + schedule, validated per provider. Persisted to
/// `{MODEL_BAZAAR_DIR}/backup_config.json` so the backup job and the
/// CLI see the same settings the API accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    /// `s3`, `azure`, `gcp`, or absent for local backups.
    #[serde(default)]
    pub cloud_provider: Option<String>,
    #[serde(default)]
    pub bucket_name: Option<String>,
    /// Interval for scheduled backups; absent = on-demand only.
    #[serde(default)]
    pub interval_minutes: Option<u64>,
    #[serde(default = "default_backup_limit")]
    pub backup_limit: usize,
    // Provider credentials; fall back to AWS_* / AZURE_* / GOOGLE_* env.
    #[serde(default)]
    pub aws_access_key: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    #[serde(default)]
    pub azure_account_name: Option<String>,
    #[serde(default)]
    pub azure_account_key: Option<String>,
    #[serde(default)]
    pub gcp_credentials_file_path: Option<String>,
}

fn default_backup_limit() -> usize {
    DEFAULT_BACKUP_LIMIT
}

impl BackupConfig {
    pub fn validate(&self) -> Result<()> {
        match self.cloud_provider.as_deref() {
            None => Ok(()),
            Some("s3") => {
                if self.bucket_name.is_none() {
                    return Err(Error::InvalidArgument(
                        "bucket_name is required for s3 backups".into(),
                    ));
                }
                Ok(())
            }
            Some("azure") => {
                if self.bucket_name.is_none() {
                    return Err(Error::InvalidArgument(
                        "bucket_name is required for azure backups".into(),
                    ));
                }
                if self.azure_account_name.is_none()
                    && std::env::var("AZURE_STORAGE_ACCOUNT_NAME").is_err()
                {
                    return Err(Error::InvalidArgument(
                        "azure_account_name is required for azure backups".into(),
                    ));
                }
                Ok(())
            }
            Some("gcp") => {
                if self.bucket_name.is_none() {
                    return Err(Error::InvalidArgument(
                        "bucket_name is required for gcp backups".into(),
                    ));
                }
                Ok(())
            }
            Some(other) => Err(Error::InvalidArgument(format!(
                "unsupported cloud provider {other:?}"
            ))),
        }
    }

    pub fn config_path(model_bazaar_dir: &Path) -> PathBuf {
        model_bazaar_dir.join("backup_config.json")
    }

    pub fn save(&self, model_bazaar_dir: &Path) -> Result<PathBuf> {
        let path = Self::config_path(model_bazaar_dir);
        std::fs::create_dir_all(model_bazaar_dir)?;
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(model_bazaar_dir: &Path) -> Result<Self> {
        let path = Self::config_path(model_bazaar_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(&path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Internal(format!("corrupt backup config: {e}")))
    }

    /// The object store this configuration uploads to.
    fn destination(&self, model_bazaar_dir: &Path) -> Result<Arc<dyn ObjectStore>> {
        match self.cloud_provider.as_deref() {
            None => {
                let dir = model_bazaar_dir.join("backups");
                std::fs::create_dir_all(&dir)?;
                Ok(Arc::new(LocalFileSystem::new_with_prefix(&dir).map_err(
                    |e| Error::Internal(format!("backup destination: {e}")),
                )?))
            }
            Some("s3") => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(self.bucket_name.clone().unwrap_or_default());
                if let Some(key) = &self.aws_access_key {
                    builder = builder.with_access_key_id(key);
                }
                if let Some(secret) = &self.aws_secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                Ok(Arc::new(builder.build().map_err(|e| {
                    Error::Internal(format!("s3 destination: {e}"))
                })?))
            }
            Some("azure") => {
                let mut builder = MicrosoftAzureBuilder::from_env()
                    .with_container_name(self.bucket_name.clone().unwrap_or_default());
                if let Some(account) = &self.azure_account_name {
                    builder = builder.with_account(account);
                }
                if let Some(key) = &self.azure_account_key {
                    builder = builder.with_access_key(key);
                }
                Ok(Arc::new(builder.build().map_err(|e| {
                    Error::Internal(format!("azure destination: {e}"))
                })?))
            }
            Some("gcp") => {
                let mut builder = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(self.bucket_name.clone().unwrap_or_default());
                if let Some(credentials) = &self.gcp_credentials_file_path {
                    builder = builder.with_service_account_path(credentials);
                }
                Ok(Arc::new(builder.build().map_err(|e| {
                    Error::Internal(format!("gcs destination: {e}"))
                })?))
            }
            Some(other) => Err(Error::InvalidArgument(format!(
                "unsupported cloud provider {other:?}"
            ))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Archive + retention
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one backup: archive, upload, prune. Returns the archive name.
pub async fn run_backup(config: &BackupConfig, model_bazaar_dir: &Path) -> Result<String> {
    config.validate()?;
    let archive_name = format!("backup_{}.tar.gz", Utc::now().format("%Y%m%d%H%M%S"));
    let staging = model_bazaar_dir.join("backups").join(".staging");
    std::fs::create_dir_all(&staging)?;
    let archive_path = staging.join(&archive_name);

    create_archive(model_bazaar_dir, &archive_path)?;
    tracing::info!(archive = %archive_name, "backup archive created");

    let destination = config.destination(model_bazaar_dir)?;
    let bytes = std::fs::read(&archive_path)?;
    destination
        .put(
            &object_store::path::Path::from(archive_name.as_str()),
            PutPayload::from(bytes),
        )
        .await
        .map_err(|e| Error::Internal(format!("backup upload: {e}")))?;
    std::fs::remove_file(&archive_path).ok();
    tracing::info!(archive = %archive_name, "backup uploaded");

    prune(destination.as_ref(), config.backup_limit).await?;
    Ok(archive_name)
}

/// Keep the most recent `limit` archives, delete the rest. Archive
/// names embed their timestamp, so lexical order is age order.
async fn prune(destination: &dyn ObjectStore, limit: usize) -> Result<usize> {
    let listing = destination
        .list_with_delimiter(None)
        .await
        .map_err(|e| Error::Internal(format!("backup listing: {e}")))?;
    let mut names: Vec<object_store::path::Path> = listing
        .objects
        .into_iter()
        .map(|o| o.location)
        .filter(|p| p.as_ref().starts_with("backup_"))
        .collect();
    names.sort_by(|a, b| b.as_ref().cmp(a.as_ref()));

    let mut removed = 0usize;
    for stale in names.iter().skip(limit) {
        destination
            .delete(stale)
            .await
            .map_err(|e| Error::Internal(format!("backup prune: {e}")))?;
        tracing::info!(archive = %stale, "stale backup removed");
        removed += 1;
    }
    Ok(removed)
}

/// Tar the models directory and the metadata document.
fn create_archive(model_bazaar_dir: &Path, archive_path: &Path) -> Result<()> {
    let file = std::fs::File::create(archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar = tar::Builder::new(encoder);

    let models_dir = model_bazaar_dir.join("models");
    if models_dir.exists() {
        tar.append_dir_all("models", &models_dir)?;
    }
    let metadata = model_bazaar_dir.join("metadata.json");
    if metadata.exists() {
        tar.append_path_with_name(&metadata, "metadata.json")?;
    }
    tar.into_inner()?.finish()?;
    Ok(())
}

/// Restore an archive into the shared directory (CLI `restore`).
pub fn restore_archive(archive_path: &Path, model_bazaar_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| Error::InvalidArgument(format!("cannot open archive: {e}")))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    std::fs::create_dir_all(model_bazaar_dir)?;
    tar.unpack(model_bazaar_dir)
        .map_err(|e| Error::Internal(format!("restore failed: {e}")))?;
    Ok(())
}

/// Scheduled backups, when `interval_minutes` is configured.
pub async fn run_interval(model_bazaar_dir: PathBuf, cancel: tokio_util::sync::CancellationToken) {
    loop {
        let config = match BackupConfig::load(&model_bazaar_dir) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "cannot load backup config");
                return;
            }
        };
        let Some(minutes) = config.interval_minutes else {
            return;
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(minutes * 60)) => {
                match run_backup(&config, &model_bazaar_dir).await {
                    Ok(name) => tracing::info!(archive = %name, "scheduled backup complete"),
                    Err(e) => tracing::error!(error = %e, "scheduled backup failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models").join("m1");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(models.join("index.json"), b"{\"chunks\":[]}").unwrap();
        std::fs::write(dir.path().join("metadata.json"), b"{}").unwrap();
        dir
    }

    #[test]
    fn provider_validation() {
        assert!(BackupConfig::default().validate().is_ok());
        let bad = BackupConfig {
            cloud_provider: Some("s3".into()),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let weird = BackupConfig {
            cloud_provider: Some("ftp".into()),
            ..Default::default()
        };
        assert!(weird.validate().is_err());
    }

    #[tokio::test]
    async fn local_backup_and_restore_round_trip() {
        let dir = seeded_dir();
        let archive = run_backup(&BackupConfig::default(), dir.path()).await.unwrap();
        let stored = dir.path().join("backups").join(&archive);
        assert!(stored.exists());

        let restore_dir = tempfile::tempdir().unwrap();
        restore_archive(&stored, restore_dir.path()).unwrap();
        assert!(restore_dir.path().join("models/m1/index.json").exists());
        assert!(restore_dir.path().join("metadata.json").exists());
    }

    #[tokio::test]
    async fn retention_keeps_only_the_newest() {
        let dir = seeded_dir();
        let config = BackupConfig {
            backup_limit: 2,
            ..Default::default()
        };
        // Archive names have second resolution; spread them out.
        let mut names = Vec::new();
        for i in 0..3 {
            // Write distinct names directly to avoid sleeping a second.
            let backups = dir.path().join("backups");
            std::fs::create_dir_all(&backups).unwrap();
            std::fs::write(backups.join(format!("backup_2024010100000{i}.tar.gz")), b"x").unwrap();
            names.push(format!("backup_2024010100000{i}.tar.gz"));
        }
        let archive = run_backup(&config, dir.path()).await.unwrap();

        let remaining: Vec<String> = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&archive), "newest archive survives");
        assert!(!remaining.contains(&names[0]), "oldest pre-existing archive pruned");
    }
}
