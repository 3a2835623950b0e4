// siterestore/src/restore/download.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::config::SpacesConfig;

/// Where a backup archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSource {
    Local(PathBuf),
    S3 { bucket: String, key: String },
}

impl BackupSource {
    /// `s3://bucket/key` or a local path.
    pub fn parse(source: &str) -> Result<Self> {
        if source.starts_with("s3://") {
            let (bucket, key) = parse_s3_uri(source)?;
            Ok(BackupSource::S3 { bucket, key })
        } else {
            Ok(BackupSource::Local(PathBuf::from(source)))
        }
    }

    /// File name of the archive, used for the staged copy and as the default
    /// backup id.
    pub fn file_name(&self) -> Option<String> {
        match self {
            BackupSource::Local(path) => path.file_name().map(|n| n.to_string_lossy().to_string()),
            BackupSource::S3 { key, .. } => key.rsplit('/').next().map(str::to_string),
        }
        .filter(|name| !name.is_empty())
    }
}

/// Parses an S3 URI (s3://bucket/key) into bucket and key.
pub fn parse_s3_uri(s3_uri: &str) -> Result<(String, String)> {
    let uri =
        url::Url::parse(s3_uri).with_context(|| format!("Invalid S3 URI format: {}", s3_uri))?;
    if uri.scheme() != "s3" {
        return Err(anyhow::anyhow!("S3 URI must start with s3://"));
    }
    let bucket = uri.host_str().context("S3 URI missing bucket name")?.to_string();
    let key = uri.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(anyhow::anyhow!("S3 URI missing key (object path)"));
    }
    Ok((bucket, key))
}

/// Stages a backup archive on local disk.
#[async_trait]
pub trait ArchiveDownloader: Send + Sync {
    /// Copies or downloads `source` to `destination_path` and returns the
    /// number of bytes staged.
    async fn download(&self, source: &BackupSource, destination_path: &Path) -> Result<u64>;
}

/// Stages local archives by copy and `s3://` archives with a streamed GET.
pub struct StorageDownloader {
    spaces_config: Option<SpacesConfig>,
}

impl StorageDownloader {
    pub fn new(spaces_config: Option<SpacesConfig>) -> Self {
        StorageDownloader { spaces_config }
    }
}

#[async_trait]
impl ArchiveDownloader for StorageDownloader {
    async fn download(&self, source: &BackupSource, destination_path: &Path) -> Result<u64> {
        if let Some(parent_dir) = destination_path.parent() {
            tokio::fs::create_dir_all(parent_dir).await.with_context(|| {
                format!(
                    "Failed to create directory for download: {}",
                    parent_dir.display()
                )
            })?;
        }

        match source {
            BackupSource::Local(path) => {
                log::info!(
                    "Copying local archive {} to {}",
                    path.display(),
                    destination_path.display()
                );
                tokio::fs::copy(path, destination_path).await.with_context(|| {
                    format!("Failed to copy archive {} into the temp dir", path.display())
                })
            }
            BackupSource::S3 { bucket, key } => {
                let spaces_config = self.spaces_config.as_ref().context(
                    "Archive source is s3:// but s3_storage is not configured in config.json",
                )?;
                download_file_from_s3(spaces_config, bucket, key, destination_path).await
            }
        }
    }
}

/// Downloads a file from an S3-compatible object storage service, streaming
/// the body chunk by chunk to disk.
///
/// # Arguments
/// * `spaces_config` - Configuration for the S3-compatible service.
/// * `s3_bucket` - The name of the S3 bucket.
/// * `s3_key` - The key (path) of the object in the S3 bucket.
/// * `destination_path` - The local path where the downloaded file will be saved.
///
/// # Returns
/// Number of bytes written.
pub async fn download_file_from_s3(
    spaces_config: &SpacesConfig,
    s3_bucket: &str,
    s3_key: &str,
    destination_path: &Path,
) -> Result<u64> {
    log::info!(
        "⬇️ Downloading s3://{}/{} to {}",
        s3_bucket,
        s3_key,
        destination_path.display()
    );

    let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
        .endpoint_url(&spaces_config.endpoint_url)
        .region(Region::new(spaces_config.region.clone()))
        .credentials_provider(s3::config::Credentials::new(
            &spaces_config.access_key_id,
            &spaces_config.secret_access_key,
            None,
            None,
            "Static",
        ))
        .load()
        .await;
    let client = s3::Client::new(&sdk_config);

    let mut object = client
        .get_object()
        .bucket(s3_bucket)
        .key(s3_key)
        .send()
        .await
        .with_context(|| format!("Failed to get object s3://{}/{}", s3_bucket, s3_key))?;
    let expected = object.content_length().and_then(|len| u64::try_from(len).ok());

    let mut output_file = File::create(destination_path).await.with_context(|| {
        format!(
            "Failed to create destination file: {}",
            destination_path.display()
        )
    })?;

    let mut total_bytes_downloaded = 0u64;
    while let Some(bytes_chunk) = object
        .body
        .try_next()
        .await
        .with_context(|| format!("Download of s3://{}/{} interrupted", s3_bucket, s3_key))?
    {
        output_file.write_all(&bytes_chunk).await.with_context(|| {
            format!(
                "Failed to write to destination file: {}",
                destination_path.display()
            )
        })?;
        total_bytes_downloaded += bytes_chunk.len() as u64;
    }
    output_file.flush().await?;

    if let Some(expected) = expected {
        if expected != total_bytes_downloaded {
            return Err(anyhow::anyhow!(
                "Downloaded {} bytes from s3://{}/{} but the object has {}",
                total_bytes_downloaded,
                s3_bucket,
                s3_key,
                expected
            ));
        }
    }

    log::info!(
        "✅ Downloaded {} bytes from s3://{}/{}",
        total_bytes_downloaded,
        s3_bucket,
        s3_key
    );
    Ok(total_bytes_downloaded)
}
