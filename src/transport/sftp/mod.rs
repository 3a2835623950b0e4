//! SFTP targets. Two clients are available: the native libssh2 binding and a
//! pure-Rust client. With `sftp_backend = auto` the native one is tried first and
//! the library client takes over when the native handshake cannot complete.

mod library;
mod native;

pub use library::LibrarySftp;
pub use native::NativeSftp;

use std::io::{ErrorKind, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{BoxedTransport, CHUNK_SIZE, UploadMode};
use crate::config::{ConnectionConfig, SftpBackend};
use crate::errors::{RestoreError, Result};

/// Files above this size are streamed in chunks instead of read whole.
pub const SFTP_CHUNK_THRESHOLD: u64 = 5 * 1024 * 1024;

const DIR_MODE: i32 = 0o755;

pub async fn connect(config: &ConnectionConfig) -> Result<BoxedTransport> {
    match config.sftp_backend {
        SftpBackend::Native => Ok(Box::new(NativeSftp::connect(config)?)),
        SftpBackend::Library => Ok(Box::new(LibrarySftp::connect(config).await?)),
        SftpBackend::Auto => match NativeSftp::connect(config) {
            Ok(native) => Ok(Box::new(native)),
            Err(e) if should_fall_back(&e) => {
                log::warn!(
                    "Native SFTP client unavailable for {} ({}), using library client",
                    config.address(),
                    e
                );
                Ok(Box::new(LibrarySftp::connect(config).await?))
            }
            Err(e) => Err(e),
        },
    }
}

/// Credentials and configuration problems are the same whichever client is
/// used, so only handshake/transport failures justify the second client.
fn should_fall_back(error: &RestoreError) -> bool {
    !matches!(
        error,
        RestoreError::Auth(_) | RestoreError::Config(_) | RestoreError::Permission(_)
    )
}

/// Checks a host key digest against the pinned one. Without a pin the digest
/// is logged so it can be added to the configuration.
fn host_key_accepted(digest: &[u8], config: &ConnectionConfig) -> bool {
    let seen = hex::encode(digest);
    match &config.host_key_sha256 {
        Some(expected) if *expected == seen => true,
        Some(expected) => {
            log::error!(
                "Host key of {} has SHA-256 {} but {} is pinned",
                config.address(),
                seen,
                expected
            );
            false
        }
        None => {
            log::warn!(
                "Accepting unpinned host key of {} (SHA-256 {}); set installation.host_key_sha256 to pin it",
                config.address(),
                seen
            );
            true
        }
    }
}

/// A failed write on an open remote file is an item failure unless the I/O
/// error says the channel itself is gone.
fn write_failure(error: std::io::Error, context: &str) -> RestoreError {
    let detail = format!("{}: {}", context, error);
    match error.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::TimedOut
        | ErrorKind::UnexpectedEof => RestoreError::Network(detail),
        _ => RestoreError::Transport(detail),
    }
}

/// Copies `local` into an open remote file. `Whole` sends a single buffer,
/// `Chunked` streams [`CHUNK_SIZE`] pieces.
fn send_blocking<R: Read, W: Write>(
    local: &mut R,
    remote: &mut W,
    mode: UploadMode,
    target: &str,
) -> Result<u64> {
    let context = format!("write {}", target);
    match mode {
        UploadMode::Whole => {
            let mut buffer = Vec::new();
            Read::read_to_end(local, &mut buffer)?;
            Write::write_all(remote, &buffer).map_err(|e| write_failure(e, &context))?;
            Ok(buffer.len() as u64)
        }
        UploadMode::Chunked => {
            let mut buffer = vec![0u8; CHUNK_SIZE];
            let mut sent = 0u64;
            loop {
                let read = Read::read(local, &mut buffer)?;
                if read == 0 {
                    break;
                }
                Write::write_all(remote, &buffer[..read]).map_err(|e| write_failure(e, &context))?;
                sent += read as u64;
            }
            Ok(sent)
        }
    }
}

/// Async counterpart of [`send_blocking`]; also closes the remote file.
async fn send_async<R, W>(local: &mut R, remote: &mut W, mode: UploadMode, target: &str) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let context = format!("write {}", target);
    let sent = match mode {
        UploadMode::Whole => {
            let mut buffer = Vec::new();
            local.read_to_end(&mut buffer).await?;
            remote
                .write_all(&buffer)
                .await
                .map_err(|e| write_failure(e, &context))?;
            buffer.len() as u64
        }
        UploadMode::Chunked => {
            let mut buffer = vec![0u8; CHUNK_SIZE];
            let mut sent = 0u64;
            loop {
                let read = local.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                remote
                    .write_all(&buffer[..read])
                    .await
                    .map_err(|e| write_failure(e, &context))?;
                sent += read as u64;
            }
            sent
        }
    };
    remote
        .shutdown()
        .await
        .map_err(|e| write_failure(e, &format!("close {}", target)))?;
    Ok(sent)
}
