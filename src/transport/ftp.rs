// siterestore/src/transport/ftp.rs
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};

use super::{CHUNK_SIZE, TransportAdapter, UploadMode, chunk_plan, remote_join, resolve_addr};
use crate::config::ConnectionConfig;
use crate::errors::{RestoreError, Result};
use crate::utils::{ancestors_inclusive, parent_of, path_components};

/// Files above this size are sent in chunks with `REST` offsets.
pub const FTP_CHUNK_THRESHOLD: u64 = 1024 * 1024;

// Reply codes that mean something other than "this one item failed".
const SERVICE_NOT_AVAILABLE: u32 = 421;
const INVALID_CREDENTIALS: u32 = 430;
const NOT_LOGGED_IN: u32 = 530;

/// The FTP commands the adapter issues, already mapped to restore errors.
trait FtpCommands: Send {
    fn cwd(&mut self, path: &str) -> Result<()>;
    fn pwd(&mut self) -> Result<String>;
    fn mkdir(&mut self, path: &str) -> Result<()>;
    fn stor(&mut self, name: &str, data: &[u8]) -> Result<u64>;
    fn appe(&mut self, name: &str, data: &[u8]) -> Result<u64>;
    /// Sets the offset of the next `STOR`.
    fn rest(&mut self, offset: u64) -> Result<()>;
    fn size(&mut self, name: &str) -> Result<u64>;
    fn nlst(&mut self) -> Result<Vec<String>>;
    fn rm(&mut self, path: &str) -> Result<()>;
    fn rmdir(&mut self, path: &str) -> Result<()>;
    fn quit(&mut self) -> Result<()>;
}

impl FtpCommands for FtpStream {
    fn cwd(&mut self, path: &str) -> Result<()> {
        FtpStream::cwd(self, path).map_err(|e| classify(e, &format!("CWD {}", path)))
    }

    fn pwd(&mut self) -> Result<String> {
        FtpStream::pwd(self).map_err(|e| classify(e, "PWD"))
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        FtpStream::mkdir(self, path).map_err(|e| classify(e, &format!("MKD {}", path)))
    }

    fn stor(&mut self, name: &str, data: &[u8]) -> Result<u64> {
        self.put_file(name, &mut Cursor::new(data))
            .map_err(|e| classify(e, &format!("STOR {}", name)))
    }

    fn appe(&mut self, name: &str, data: &[u8]) -> Result<u64> {
        self.append_file(name, &mut Cursor::new(data))
            .map_err(|e| classify(e, &format!("APPE {}", name)))
    }

    fn rest(&mut self, offset: u64) -> Result<()> {
        self.resume_transfer(offset as usize)
            .map_err(|e| classify(e, &format!("REST {}", offset)))
    }

    fn size(&mut self, name: &str) -> Result<u64> {
        FtpStream::size(self, name)
            .map(|size| size as u64)
            .map_err(|e| classify(e, &format!("SIZE {}", name)))
    }

    fn nlst(&mut self) -> Result<Vec<String>> {
        FtpStream::nlst(self, None).map_err(|e| classify(e, "NLST"))
    }

    fn rm(&mut self, path: &str) -> Result<()> {
        FtpStream::rm(self, path).map_err(|e| classify(e, &format!("DELE {}", path)))
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        FtpStream::rmdir(self, path).map_err(|e| classify(e, &format!("RMD {}", path)))
    }

    fn quit(&mut self) -> Result<()> {
        FtpStream::quit(self).map_err(|e| classify(e, "QUIT"))
    }
}

/// FTP target in passive binary mode.
///
/// Many servers have no usable absolute-path operations, so the adapter moves
/// around with `CWD` and tracks where it is. `known_root` drops to false when a
/// directory change leaves it unsure of the working directory.
pub struct FtpTransport {
    stream: Box<dyn FtpCommands>,
    root: String,
    cwd: String,
    known_root: bool,
}

fn classify(error: FtpError, context: &str) -> RestoreError {
    match error {
        FtpError::ConnectionError(e) => RestoreError::Network(format!("{}: {}", context, e)),
        FtpError::UnexpectedResponse(response) => {
            let detail = format!(
                "{}: {:?} {}",
                context,
                response.status,
                String::from_utf8_lossy(&response.body).trim()
            );
            match response.status.code() {
                NOT_LOGGED_IN | INVALID_CREDENTIALS => RestoreError::Auth(detail),
                SERVICE_NOT_AVAILABLE => RestoreError::Network(detail),
                _ => RestoreError::Transport(detail),
            }
        }
        other => RestoreError::Transport(format!("{}: {}", context, other)),
    }
}

impl FtpTransport {
    pub fn connect(config: &ConnectionConfig) -> Result<Self> {
        let addr = resolve_addr(config)?;
        log::info!("Connecting to FTP server {} ...", config.address());

        let mut stream = FtpStream::connect_timeout(addr, config.connect_timeout)
            .map_err(|e| classify(e, "FTP connect failed"))?;
        let password = config.password.as_deref().unwrap_or_default();
        stream
            .login(config.username.as_str(), password)
            .map_err(|e| match classify(e, "FTP login failed") {
                RestoreError::Transport(msg) => RestoreError::Auth(msg),
                other => other,
            })?;
        stream.set_mode(Mode::Passive);
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| classify(e, "FTP binary mode failed"))?;

        let transport = Self::open(Box::new(stream), &config.root_path)?;
        log::info!("✓ FTP connected, installation root is {}", transport.root);
        Ok(transport)
    }

    /// Moves a logged-in session to the installation root.
    fn open(mut stream: Box<dyn FtpCommands>, root_path: &str) -> Result<Self> {
        stream.cwd(root_path).map_err(|e| {
            RestoreError::Config(format!(
                "FTP installation path {} is not accessible: {}",
                root_path, e
            ))
        })?;
        let root = stream
            .pwd()
            .unwrap_or_else(|_| root_path.trim_end_matches('/').to_string());
        Ok(FtpTransport {
            stream,
            cwd: root.clone(),
            root,
            known_root: true,
        })
    }

    fn absolute(&self, rel: &str) -> String {
        remote_join(&self.root, rel)
    }

    fn change_dir(&mut self, absolute: &str) -> Result<()> {
        match self.stream.cwd(absolute) {
            Ok(()) => {
                self.cwd = absolute.to_string();
                self.known_root = true;
                Ok(())
            }
            Err(e) => {
                self.known_root = false;
                Err(e)
            }
        }
    }

    /// Returns to the installation root, recovering through `/` when the
    /// server rejects the direct change.
    fn goto_root(&mut self) -> Result<()> {
        if self.known_root && self.cwd == self.root {
            return Ok(());
        }
        let root = self.root.clone();
        if self.change_dir(&root).is_ok() {
            return Ok(());
        }
        log::debug!("CWD to root failed, recovering via /");
        self.change_dir("/")?;
        self.change_dir(&root)
    }

    fn directory_exists(&mut self, absolute: &str) -> bool {
        self.change_dir(absolute).is_ok()
    }

    fn mkdir_incremental(&mut self, rel: &str, known: &BTreeSet<String>) -> Result<()> {
        self.goto_root()?;
        let mut walked = Vec::new();
        for component in path_components(rel) {
            walked.push(component);
            let rel_so_far = walked.join("/");
            let absolute = self.absolute(&rel_so_far);
            if known.contains(&rel_so_far) && self.change_dir(&absolute).is_ok() {
                continue;
            }
            if self.stream.cwd(component).is_ok() {
                self.cwd = absolute;
                continue;
            }
            if let Err(e) = self.stream.mkdir(component) {
                // Another writer may have created it in between.
                if !self.directory_exists(&absolute) {
                    return Err(e);
                }
                continue;
            }
            self.change_dir(&absolute)?;
        }
        Ok(())
    }

    fn upload_whole(&mut self, source: &Path, rel: &str) -> Result<u64> {
        let mut buffer = Vec::new();
        File::open(source)?.read_to_end(&mut buffer)?;
        let name = file_name(rel)?;
        let absolute = self.absolute(rel);

        // Relative to the parent directory first.
        let parent = parent_of(rel).unwrap_or_default();
        let parent_abs = self.absolute(&parent);
        let relative_attempt = self
            .change_dir(&parent_abs)
            .and_then(|_| self.stream.stor(name, &buffer));
        match relative_attempt {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_connection_loss() => return Err(e),
            Err(e) => log::debug!("Relative upload of {} failed: {}", rel, e),
        }

        // Absolute path from the root.
        self.goto_root()?;
        match self.stream.stor(&absolute, &buffer) {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_connection_loss() => return Err(e),
            Err(e) => log::debug!("Absolute upload of {} failed: {}", rel, e),
        }

        // Create an empty file, then append the content.
        log::warn!("Falling back to create-then-append upload for {}", absolute);
        self.change_dir(&parent_abs)?;
        self.stream.stor(name, &[])?;
        self.stream.appe(name, &buffer)
    }

    /// Sends the file chunk by chunk, resuming each at its offset with `REST`.
    fn upload_chunked(&mut self, source: &Path, rel: &str, size: u64) -> Result<u64> {
        let name = file_name(rel)?;
        let parent = parent_of(rel).unwrap_or_default();
        let parent_abs = self.absolute(&parent);
        self.change_dir(&parent_abs)?;

        let mut file = File::open(source)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        for (offset, len) in chunk_plan(size, CHUNK_SIZE) {
            file.read_exact(&mut buffer[..len])?;
            if offset > 0 {
                self.stream.rest(offset)?;
            }
            sent += self.stream.stor(name, &buffer[..len])?;
            log::debug!("FTP chunk {}..{} of {} sent", offset, offset + len as u64, rel);
        }

        if let Ok(remote_size) = self.stream.size(name) {
            if remote_size != size {
                return Err(RestoreError::Transport(format!(
                    "chunked upload of {} ended with {} of {} bytes on server",
                    rel, remote_size, size
                )));
            }
        }
        Ok(sent)
    }
}

fn file_name(rel: &str) -> Result<&str> {
    path_components(rel)
        .last()
        .copied()
        .ok_or_else(|| RestoreError::Transport(format!("'{}' has no file name", rel)))
}

#[async_trait]
impl TransportAdapter for FtpTransport {
    fn name(&self) -> &'static str {
        "ftp"
    }

    async fn health_check(&mut self) -> bool {
        match self.stream.pwd() {
            Ok(dir) => {
                self.cwd = dir;
                true
            }
            Err(e) => {
                log::warn!("FTP health check failed: {}", e);
                false
            }
        }
    }

    async fn ensure_directory(
        &mut self,
        rel: &str,
        known: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let absolute = self.absolute(rel);
        if self.directory_exists(&absolute) {
            return Ok(ancestors_inclusive(rel));
        }

        match self.stream.mkdir(&absolute) {
            Ok(()) if self.directory_exists(&absolute) => return Ok(ancestors_inclusive(rel)),
            Ok(()) => log::debug!("MKD {} reported success but CWD fails", absolute),
            Err(e) => {
                if e.is_connection_loss() {
                    return Err(e);
                }
                if self.directory_exists(&absolute) {
                    return Ok(ancestors_inclusive(rel));
                }
                log::debug!("Absolute MKD failed, trying incremental: {}", e);
            }
        }

        self.mkdir_incremental(rel, known)?;
        Ok(ancestors_inclusive(rel))
    }

    async fn put_file(&mut self, source: &Path, rel: &str) -> Result<u64> {
        let size = std::fs::metadata(source)?.len();
        match UploadMode::for_size(size, FTP_CHUNK_THRESHOLD) {
            UploadMode::Whole => self.upload_whole(source, rel),
            UploadMode::Chunked => self.upload_chunked(source, rel, size),
        }
    }

    async fn list_entries(&mut self, rel: &str) -> Result<Vec<String>> {
        let absolute = self.absolute(rel);
        self.change_dir(&absolute)?;
        let mut names: Vec<String> = self
            .stream
            .nlst()?
            .into_iter()
            .map(|entry| entry.rsplit('/').next().unwrap_or_default().to_string())
            .filter(|name| !name.is_empty() && name != "." && name != "..")
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove_file(&mut self, rel: &str) -> Result<()> {
        let absolute = self.absolute(rel);
        self.goto_root()?;
        self.stream.rm(&absolute)
    }

    async fn remove_dir(&mut self, rel: &str) -> Result<()> {
        let absolute = self.absolute(rel);
        self.goto_root()?;
        self.stream.rmdir(&absolute)
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.quit()
    }
}
