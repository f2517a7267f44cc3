//! Cloud file staging for insert records.
//!
//! `s3://`, `az://`, and `gs://` URIs resolve through `object_store`
//! builders, which read their credentials from the `AWS_*` / `AZURE_*` /
//! `GOOGLE_*` environment. Downloads land in a staging directory named
//! after the object key.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::{ObjectStore, ObjectStoreScheme};

use mb_domain::error::{Error, Result};

/// Split a cloud URI into a store client and the object path within it.
pub fn store_for_url(url: &str) -> Result<(Arc<dyn ObjectStore>, object_store::path::Path)> {
    let parsed = url::Url::parse(url)
        .map_err(|e| Error::InvalidArgument(format!("bad storage url {url:?}: {e}")))?;
    let (scheme, path) = ObjectStoreScheme::parse(&parsed)
        .map_err(|e| Error::InvalidArgument(format!("bad storage url {url:?}: {e}")))?;
    let bucket = parsed.host_str().unwrap_or_default().to_string();
    let store: Arc<dyn ObjectStore> = match scheme {
        ObjectStoreScheme::AmazonS3 => Arc::new(
            AmazonS3Builder::from_env()
                .with_bucket_name(&bucket)
                .build()
                .map_err(|e| Error::Internal(format!("s3 client: {e}")))?,
        ),
        ObjectStoreScheme::MicrosoftAzure => Arc::new(
            MicrosoftAzureBuilder::from_env()
                .with_container_name(&bucket)
                .build()
                .map_err(|e| Error::Internal(format!("azure client: {e}")))?,
        ),
        ObjectStoreScheme::GoogleCloudStorage => Arc::new(
            GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(&bucket)
                .build()
                .map_err(|e| Error::Internal(format!("gcs client: {e}")))?,
        ),
        _ => {
            return Err(Error::InvalidArgument(format!(
                "unsupported storage scheme in {url:?}"
            )))
        }
    };
    Ok((store, path))
}

/// Download a cloud object into `staging`, returning the local path.
pub async fn download_to(url: &str, staging: &Path) -> Result<PathBuf> {
    let (store, object_path) = store_for_url(url)?;
    let bytes = store
        .get(&object_path)
        .await
        .map_err(|e| Error::InvalidArgument(format!("cannot fetch {url}: {e}")))?
        .bytes()
        .await
        .map_err(|e| Error::InvalidArgument(format!("cannot fetch {url}: {e}")))?;

    std::fs::create_dir_all(staging)?;
    let file_name = object_path
        .filename()
        .map(str::to_string)
        .unwrap_or_else(|| "download".to_string());
    let local = staging.join(file_name);
    std::fs::write(&local, bytes)?;
    Ok(local)
}
