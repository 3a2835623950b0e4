use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::TransportAdapter;
use crate::config::ConnectionConfig;
use crate::errors::{RestoreError, Result};
use crate::utils::{ancestors_inclusive, path_components};

/// Installation target on the local filesystem.
#[derive(Debug)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let root = PathBuf::from(&config.root_path);
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(LocalTransport { root }),
            Ok(_) => Err(RestoreError::Config(format!(
                "installation path {} is not a directory",
                root.display()
            ))),
            Err(e) => Err(RestoreError::Config(format!(
                "installation path {} is not accessible: {}",
                root.display(),
                e
            ))),
        }
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        path_components(rel)
            .into_iter()
            .fold(self.root.clone(), |path, component| path.join(component))
    }

    async fn mkdir_incremental(&self, rel: &str) -> io::Result<()> {
        let mut path = self.root.clone();
        for component in path_components(rel) {
            path.push(component);
            match fs::create_dir(&path).await {
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                result => result?,
            }
        }
        Ok(())
    }

    async fn stream_copy(source: &Path, target: &Path) -> io::Result<u64> {
        let mut reader = File::open(source).await?;
        let mut writer = File::create(target).await?;
        let copied = tokio::io::copy(&mut reader, &mut writer).await?;
        writer.flush().await?;
        Ok(copied)
    }
}

fn item_error(action: &str, path: &Path, error: io::Error) -> RestoreError {
    RestoreError::Transport(format!("{} {}: {}", action, path.display(), error))
}

#[async_trait]
impl TransportAdapter for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn health_check(&mut self) -> bool {
        true
    }

    async fn ensure_directory(
        &mut self,
        rel: &str,
        _known: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let target = self.resolve(rel);
        if fs::metadata(&target).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(ancestors_inclusive(rel));
        }

        if let Err(first) = fs::create_dir_all(&target).await {
            log::debug!(
                "create_dir_all {} failed ({}), trying component by component",
                target.display(),
                first
            );
            self.mkdir_incremental(rel)
                .await
                .map_err(|e| item_error("Failed to create directory", &target, e))?;
        }
        Ok(ancestors_inclusive(rel))
    }

    async fn put_file(&mut self, source: &Path, rel: &str) -> Result<u64> {
        let target = self.resolve(rel);
        match fs::copy(source, &target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                log::warn!(
                    "Direct copy to {} failed ({}), falling back to stream copy",
                    target.display(),
                    e
                );
                Self::stream_copy(source, &target)
                    .await
                    .map_err(|e| item_error("Failed to copy file to", &target, e))
            }
        }
    }

    async fn list_entries(&mut self, rel: &str) -> Result<Vec<String>> {
        let dir = self.resolve(rel);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| item_error("Failed to list", &dir, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn remove_file(&mut self, rel: &str) -> Result<()> {
        let path = self.resolve(rel);
        fs::remove_file(&path)
            .await
            .map_err(|e| item_error("Failed to remove file", &path, e))
    }

    async fn remove_dir(&mut self, rel: &str) -> Result<()> {
        let path = self.resolve(rel);
        fs::remove_dir(&path)
            .await
            .map_err(|e| item_error("Failed to remove directory", &path, e))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
