// siterestore/src/transport/sftp/library.rs
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::HashAlg;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;

use super::{SFTP_CHUNK_THRESHOLD, host_key_accepted, send_async};
use crate::config::ConnectionConfig;
use crate::errors::{RestoreError, Result};
use crate::transport::{TransportAdapter, UploadMode, remote_join, resolve_addr};
use crate::utils::ancestors_inclusive;

/// Checks the server key against `installation.host_key_sha256`.
struct HostKeyCheck {
    config: ConnectionConfig,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
        Ok(host_key_accepted(fingerprint.as_bytes(), &self.config))
    }
}

/// SFTP over the pure-Rust SSH client. Password authentication only.
pub struct LibrarySftp {
    handle: Handle<HostKeyCheck>,
    sftp: SftpSession,
    root: String,
}

fn classify(error: SftpError, context: &str) -> RestoreError {
    match error {
        SftpError::Status(status) => {
            RestoreError::Transport(format!("{}: {:?}", context, status.status_code))
        }
        other => RestoreError::Network(format!("{}: {}", context, other)),
    }
}

impl LibrarySftp {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let password = config.password.as_deref().ok_or_else(|| {
            RestoreError::Config("the library sftp client needs installation.password".to_string())
        })?;
        let addr = resolve_addr(config)?;
        log::info!("Connecting to SFTP server {} (library client)...", config.address());

        let ssh_config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            config.connect_timeout,
            client::connect(
                ssh_config,
                addr,
                HostKeyCheck {
                    config: config.clone(),
                },
            ),
        )
        .await
        .map_err(|_| {
            RestoreError::Network(format!(
                "SSH connect to {} timed out after {:?}",
                config.address(),
                config.connect_timeout
            ))
        })?
        .map_err(|e| match e {
            russh::Error::UnknownKey => RestoreError::Auth(format!(
                "host key of {} does not match installation.host_key_sha256",
                config.address()
            )),
            e => RestoreError::Network(format!("SSH handshake failed: {}", e)),
        })?;

        let auth = handle
            .authenticate_password(config.username.as_str(), password)
            .await
            .map_err(|e| RestoreError::Network(format!("SSH authentication exchange failed: {}", e)))?;
        if !auth.success() {
            return Err(RestoreError::Auth(format!(
                "SSH server {} rejected the password for {}",
                config.address(),
                config.username
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| RestoreError::Network(format!("Failed to open SSH channel: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| RestoreError::Transport(format!("SFTP subsystem unavailable: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| RestoreError::Transport(format!("SFTP session failed to start: {}", e)))?;

        let root = sftp
            .canonicalize(config.root_path.as_str())
            .await
            .map_err(|e| {
                RestoreError::Config(format!(
                    "SFTP installation path {} is not accessible: {}",
                    config.root_path, e
                ))
            })?;
        log::info!("✓ SFTP connected (library client), installation root is {}", root);

        Ok(LibrarySftp { handle, sftp, root })
    }

    fn absolute(&self, rel: &str) -> String {
        remote_join(&self.root, rel)
    }

    async fn is_dir(&self, path: &str) -> bool {
        match self.sftp.metadata(path).await {
            Ok(meta) => meta.is_dir(),
            Err(_) => false,
        }
    }

    async fn mkdir_incremental(&self, rel: &str, known: &BTreeSet<String>) -> Result<()> {
        for prefix in ancestors_inclusive(rel) {
            if known.contains(&prefix) {
                continue;
            }
            let path = self.absolute(&prefix);
            if self.is_dir(&path).await {
                continue;
            }
            if let Err(e) = self.sftp.create_dir(path.as_str()).await {
                if !self.is_dir(&path).await {
                    return Err(classify(e, &format!("mkdir {}", path)));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for LibrarySftp {
    fn name(&self) -> &'static str {
        "sftp (library)"
    }

    async fn health_check(&mut self) -> bool {
        if self.handle.is_closed() {
            return false;
        }
        match self.sftp.try_exists(self.root.as_str()).await {
            Ok(exists) => exists,
            Err(e) => {
                log::warn!("SFTP health check failed: {}", e);
                false
            }
        }
    }

    async fn ensure_directory(
        &mut self,
        rel: &str,
        known: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let path = self.absolute(rel);
        if self.is_dir(&path).await {
            return Ok(ancestors_inclusive(rel));
        }
        match self.sftp.create_dir(path.as_str()).await {
            Ok(()) => return Ok(ancestors_inclusive(rel)),
            Err(e) => {
                let e = classify(e, &format!("mkdir {}", path));
                if e.is_connection_loss() {
                    return Err(e);
                }
                if self.is_dir(&path).await {
                    return Ok(ancestors_inclusive(rel));
                }
                log::debug!("Direct mkdir failed, trying component by component: {}", e);
            }
        }
        self.mkdir_incremental(rel, known).await?;
        Ok(ancestors_inclusive(rel))
    }

    async fn put_file(&mut self, source: &Path, rel: &str) -> Result<u64> {
        let target = self.absolute(rel);
        let mut local = File::open(source).await?;
        let mode = UploadMode::for_size(local.metadata().await?.len(), SFTP_CHUNK_THRESHOLD);
        let sent = match self.sftp.create(target.as_str()).await {
            Ok(mut remote) => send_async(&mut local, &mut remote, mode, &target).await,
            Err(e) => Err(classify(e, &format!("open {}", target))),
        };
        match sent {
            Err(RestoreError::Transport(detail)) if !self.health_check().await => {
                Err(RestoreError::Network(detail))
            }
            other => other,
        }
    }

    async fn list_entries(&mut self, rel: &str) -> Result<Vec<String>> {
        let path = self.absolute(rel);
        let mut names: Vec<String> = self
            .sftp
            .read_dir(path.as_str())
            .await
            .map_err(|e| classify(e, &format!("readdir {}", path)))?
            .map(|entry| entry.file_name())
            .filter(|name| name != "." && name != "..")
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove_file(&mut self, rel: &str) -> Result<()> {
        let path = self.absolute(rel);
        self.sftp
            .remove_file(path.as_str())
            .await
            .map_err(|e| classify(e, &format!("unlink {}", path)))
    }

    async fn remove_dir(&mut self, rel: &str) -> Result<()> {
        let path = self.absolute(rel);
        self.sftp
            .remove_dir(path.as_str())
            .await
            .map_err(|e| classify(e, &format!("rmdir {}", path)))
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.sftp.close().await {
            log::debug!("SFTP session close: {}", e);
        }
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "restore finished", "en")
            .await
            .map_err(|e| RestoreError::Network(format!("SSH disconnect: {}", e)))
    }
}
