// siterestore/src/transport/sftp/native.rs
use async_trait::async_trait;
use ssh2::{ErrorCode, HashType, Session, Sftp};
use std::collections::BTreeSet;
use std::fs::File;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use super::{DIR_MODE, SFTP_CHUNK_THRESHOLD, host_key_accepted, send_blocking};
use crate::config::ConnectionConfig;
use crate::errors::{RestoreError, Result};
use crate::transport::{TransportAdapter, UploadMode, remote_join, resolve_addr};
use crate::utils::ancestors_inclusive;

// libssh2 session error codes.
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

/// SFTP over the libssh2 binding.
pub struct NativeSftp {
    session: Session,
    sftp: Sftp,
    root: String,
}

fn classify(error: ssh2::Error, context: &str) -> RestoreError {
    let detail = format!("{}: {}", context, error);
    match error.code() {
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => RestoreError::Auth(detail),
        ErrorCode::Session(_) => RestoreError::Network(detail),
        ErrorCode::SFTP(_) => RestoreError::Transport(detail),
    }
}

impl NativeSftp {
    pub fn connect(config: &ConnectionConfig) -> Result<Self> {
        let addr = resolve_addr(config)?;
        log::info!("Connecting to SFTP server {} (libssh2)...", config.address());

        let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|e| {
            RestoreError::Network(format!("TCP connect to {} failed: {}", config.address(), e))
        })?;
        let mut session = Session::new()
            .map_err(|e| classify(e, "Failed to create SSH session"))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(config.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| RestoreError::Network(format!("SSH handshake failed: {}", e)))?;
        let digest = session
            .host_key_hash(HashType::Sha256)
            .ok_or_else(|| RestoreError::Network("SSH server sent no host key".to_string()))?;
        if !host_key_accepted(digest, config) {
            return Err(RestoreError::Auth(format!(
                "host key of {} does not match installation.host_key_sha256",
                config.address()
            )));
        }

        match (&config.private_key_path, &config.password) {
            (Some(key), passphrase) => session
                .userauth_pubkey_file(&config.username, None, key, passphrase.as_deref())
                .map_err(|e| RestoreError::Auth(format!("public key authentication failed: {}", e)))?,
            (None, Some(password)) => session
                .userauth_password(&config.username, password)
                .map_err(|e| RestoreError::Auth(format!("password authentication failed: {}", e)))?,
            (None, None) => {
                return Err(RestoreError::Config(
                    "sftp needs a password or a private key".to_string(),
                ));
            }
        }
        if !session.authenticated() {
            return Err(RestoreError::Auth(format!(
                "SSH server {} did not accept the credentials",
                config.address()
            )));
        }
        // Only the connect phase is time-limited.
        session.set_timeout(0);

        let sftp = session
            .sftp()
            .map_err(|e| RestoreError::Transport(format!("SFTP subsystem unavailable: {}", e)))?;
        let root = sftp
            .realpath(Path::new(&config.root_path))
            .map_err(|e| {
                RestoreError::Config(format!(
                    "SFTP installation path {} is not accessible: {}",
                    config.root_path, e
                ))
            })?
            .to_string_lossy()
            .to_string();
        log::info!("✓ SFTP connected (libssh2), installation root is {}", root);

        Ok(NativeSftp {
            session,
            sftp,
            root,
        })
    }

    fn absolute(&self, rel: &str) -> PathBuf {
        PathBuf::from(remote_join(&self.root, rel))
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.sftp.stat(path).map(|st| st.is_dir()).unwrap_or(false)
    }

    fn mkdir_incremental(&self, rel: &str, known: &BTreeSet<String>) -> Result<()> {
        for prefix in ancestors_inclusive(rel) {
            if known.contains(&prefix) {
                continue;
            }
            let path = self.absolute(&prefix);
            if self.is_dir(&path) {
                continue;
            }
            if let Err(e) = self.sftp.mkdir(&path, DIR_MODE) {
                if !self.is_dir(&path) {
                    return Err(classify(e, &format!("mkdir {}", path.display())));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for NativeSftp {
    fn name(&self) -> &'static str {
        "sftp (libssh2)"
    }

    async fn health_check(&mut self) -> bool {
        match self.sftp.stat(Path::new(&self.root)) {
            Ok(_) => true,
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
        if self.is_dir(&path) {
            return Ok(ancestors_inclusive(rel));
        }
        match self.sftp.mkdir(&path, DIR_MODE) {
            Ok(()) => return Ok(ancestors_inclusive(rel)),
            Err(e) => {
                let e = classify(e, &format!("mkdir {}", path.display()));
                if e.is_connection_loss() {
                    return Err(e);
                }
                if self.is_dir(&path) {
                    return Ok(ancestors_inclusive(rel));
                }
                log::debug!("Direct mkdir failed, trying component by component: {}", e);
            }
        }
        self.mkdir_incremental(rel, known)?;
        Ok(ancestors_inclusive(rel))
    }

    async fn put_file(&mut self, source: &Path, rel: &str) -> Result<u64> {
        let target = self.absolute(rel);
        let mut local = File::open(source)?;
        let mode = UploadMode::for_size(local.metadata()?.len(), SFTP_CHUNK_THRESHOLD);
        let sent = self
            .sftp
            .create(&target)
            .map_err(|e| classify(e, &format!("open {}", target.display())))
            .and_then(|mut remote| {
                send_blocking(&mut local, &mut remote, mode, &target.to_string_lossy())
            });
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
            .readdir(&path)
            .map_err(|e| classify(e, &format!("readdir {}", path.display())))?
            .into_iter()
            .filter_map(|(entry, _)| entry.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove_file(&mut self, rel: &str) -> Result<()> {
        let path = self.absolute(rel);
        self.sftp
            .unlink(&path)
            .map_err(|e| classify(e, &format!("unlink {}", path.display())))
    }

    async fn remove_dir(&mut self, rel: &str) -> Result<()> {
        let path = self.absolute(rel);
        self.sftp
            .rmdir(&path)
            .map_err(|e| classify(e, &format!("rmdir {}", path.display())))
    }

    async fn close(&mut self) -> Result<()> {
        self.session
            .disconnect(None, "restore finished", None)
            .map_err(|e| classify(e, "SSH disconnect"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let auth = ssh2::Error::new(
            ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED),
            "denied",
        );
        assert!(matches!(classify(auth, "auth"), RestoreError::Auth(_)));

        let socket = ssh2::Error::new(ErrorCode::Session(-43), "recv");
        assert!(classify(socket, "write").is_connection_loss());

        let missing = ssh2::Error::new(ErrorCode::SFTP(2), "no such file");
        let err = classify(missing, "open");
        assert!(matches!(err, RestoreError::Transport(_)));
        assert!(!err.is_fatal());
    }
}
