//! Uniform access to the installation target over the local filesystem, FTP
//! or SFTP. The backend is picked once, from the configured method.

#[cfg(test)]
pub(crate) mod fake;
pub mod ftp;
pub mod local;
pub mod sftp;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use crate::config::{ConnectionConfig, TransportMethod};
use crate::errors::{RestoreError, Result};

pub use ftp::FtpTransport;
pub use local::LocalTransport;

/// Bytes read per chunk when streaming a file to a remote target.
pub const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Read the whole file and send it in one transfer.
    Whole,
    /// Stream fixed-size chunks to bound memory.
    Chunked,
}

impl UploadMode {
    pub fn for_size(size: u64, threshold: u64) -> Self {
        if size > threshold {
            UploadMode::Chunked
        } else {
            UploadMode::Whole
        }
    }
}

/// Offsets and lengths of the chunks a chunked upload sends.
pub fn chunk_plan(size: u64, chunk_size: usize) -> Vec<(u64, usize)> {
    let chunk = chunk_size.max(1) as u64;
    let mut plan = Vec::with_capacity(size.div_ceil(chunk) as usize);
    let mut offset = 0;
    while offset < size {
        let len = chunk.min(size - offset);
        plan.push((offset, len as usize));
        offset += len;
    }
    plan
}

/// Joins a target root and a `/`-separated relative path for remote servers.
pub fn remote_join(root: &str, rel: &str) -> String {
    let rel = rel.trim_matches('/');
    let root = root.trim_end_matches('/');
    match (root.is_empty(), rel.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", rel),
        (false, true) => root.to_string(),
        (false, false) => format!("{}/{}", root, rel),
    }
}

pub(crate) fn resolve_addr(config: &ConnectionConfig) -> Result<SocketAddr> {
    config
        .address()
        .to_socket_addrs()
        .map_err(|e| RestoreError::Network(format!("cannot resolve {}: {}", config.address(), e)))?
        .next()
        .ok_or_else(|| RestoreError::Config(format!("no address found for {}", config.address())))
}

/// Operations the file restore engine needs from an installation target.
///
/// Relative paths are `/`-separated and resolved against the configured root.
#[async_trait]
pub trait TransportAdapter: Send {
    fn name(&self) -> &'static str;

    /// Cheap round-trip confirming the connection is still usable.
    async fn health_check(&mut self) -> bool;

    /// Recursively creates `rel`. Already-existing directories are success.
    ///
    /// `known` holds directories the caller has already materialized; they are
    /// not checked again. Returns the directories (`rel` and ancestors) that are
    /// now known to exist.
    async fn ensure_directory(&mut self, rel: &str, known: &BTreeSet<String>)
    -> Result<Vec<String>>;

    /// Uploads `source` to `rel`, overwriting. Returns the bytes written.
    async fn put_file(&mut self, source: &Path, rel: &str) -> Result<u64>;

    async fn list_entries(&mut self, rel: &str) -> Result<Vec<String>>;

    async fn remove_file(&mut self, rel: &str) -> Result<()>;

    async fn remove_dir(&mut self, rel: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

pub type BoxedTransport = Box<dyn TransportAdapter>;

/// Opens fresh transport connections; used for the initial connect and for
/// every reconnect.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<BoxedTransport>;
}

/// Connector backed by the installation settings from `config.json`.
#[derive(Debug, Clone)]
pub struct ConfiguredConnector {
    config: ConnectionConfig,
}

impl ConfiguredConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        ConfiguredConnector { config }
    }
}

#[async_trait]
impl TransportConnector for ConfiguredConnector {
    async fn connect(&self) -> Result<BoxedTransport> {
        match self.config.method {
            TransportMethod::Local => Ok(Box::new(LocalTransport::connect(&self.config).await?)),
            TransportMethod::Ftp => Ok(Box::new(FtpTransport::connect(&self.config)?)),
            TransportMethod::Sftp => sftp::connect(&self.config).await,
        }
    }
}

const PROBE_CONTENT: &[u8] = b"siterestore connectivity probe\n";

/// Confirms the target is reachable and writable by creating, listing and
/// deleting a throwaway directory and file.
pub async fn probe_target(connector: &dyn TransportConnector, probe_id: &str) -> Result<()> {
    log::info!("🔍 Testing installation target connectivity and write permission...");
    let mut transport = connector.connect().await?;

    let probe_dir = format!(".restore-probe-{}", probe_id);
    let probe_file = format!("{}/probe.txt", probe_dir);

    let local_probe = tempfile::NamedTempFile::new()?;
    std::fs::write(local_probe.path(), PROBE_CONTENT)?;

    let outcome = async {
        transport
            .ensure_directory(&probe_dir, &BTreeSet::new())
            .await
            .map_err(as_permission_error)?;
        transport
            .put_file(local_probe.path(), &probe_file)
            .await
            .map_err(as_permission_error)?;
        let listed = transport.list_entries(&probe_dir).await?;
        if !listed.iter().any(|name| name == "probe.txt") {
            return Err(RestoreError::Permission(format!(
                "probe file {} was not visible after upload",
                probe_file
            )));
        }
        transport.remove_file(&probe_file).await?;
        transport.remove_dir(&probe_dir).await?;
        Ok(())
    }
    .await;

    if let Err(e) = transport.close().await {
        log::warn!("Failed to close probe connection cleanly: {}", e);
    }

    match &outcome {
        Ok(()) => log::info!("✓ Installation target ({}) is reachable and writable", transport.name()),
        Err(e) => log::error!("Installation target probe failed: {}", e),
    }
    outcome
}

fn as_permission_error(error: RestoreError) -> RestoreError {
    match error {
        RestoreError::Transport(msg) => RestoreError::Permission(msg),
        other => other,
    }
}
