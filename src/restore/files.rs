//! File restore: mirrors the extracted `files/` tree onto the installation
//! target in bounded batches, parents before children.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::archive::FILES_DIR;
use super::batch::rebalance;
use super::scanner::{SCAN_ATTEMPTS, SCAN_RETRY_DELAY, scan_with_retry};
use super::{MAX_RECONNECT_ATTEMPTS, MEMORY_LIMIT_RATIO, reconnect_backoff};
use crate::errors::{RestoreError, Result};
use crate::state::{EntryKind, FailedItem, FsEntry, Phase, RestoreStatus, RetryItem};
use crate::transport::{BoxedTransport, TransportConnector};
use crate::utils::memory::MemoryProbe;
use crate::utils::{parent_of, path_components};

/// Failed items get this many extra attempts before they are given up on.
pub const MAX_RETRIES: u32 = 1;

/// Operations between two connection health checks.
pub const HEALTH_CHECK_INTERVAL: usize = 10;

/// File uploads between two memory checks.
pub const MEMORY_CHECK_INTERVAL: usize = 10;

/// Where an item goes back to when it has to be attempted again.
#[derive(Debug, Clone)]
enum Origin {
    Queue,
    Backlog { retry_count: u32, last_error: String },
}

enum Attempt {
    Done(u64),
    /// The parent was missing and has now been created.
    ParentCreated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Processed,
    Failed,
    Requeued,
    Reconnected,
}

impl Step {
    fn consumed_share(self) -> bool {
        matches!(self, Step::Processed | Step::Failed)
    }
}

pub struct FileRestore<'a> {
    connector: &'a dyn TransportConnector,
    memory: &'a mut dyn MemoryProbe,
    reconnect_delay: Duration,
    transport: Option<BoxedTransport>,
    operations: usize,
    file_operations: usize,
}

/// Local path of a `files/`-relative entry.
fn source_path(status: &RestoreStatus, rel: &str) -> PathBuf {
    path_components(rel)
        .into_iter()
        .fold(status.extract_dir.join(FILES_DIR), |path, part| path.join(part))
}

impl<'a> FileRestore<'a> {
    pub fn new(
        connector: &'a dyn TransportConnector,
        memory: &'a mut dyn MemoryProbe,
        reconnect_delay: Duration,
    ) -> Self {
        FileRestore {
            connector,
            memory,
            reconnect_delay,
            transport: None,
            operations: 0,
            file_operations: 0,
        }
    }

    pub fn memory_ratio(&mut self) -> f64 {
        self.memory.usage_ratio()
    }

    /// Scans the extracted tree and fills the directory and file queues.
    pub async fn initialize(&mut self, status: &mut RestoreStatus) -> Result<()> {
        self.ensure_connected(status).await?;

        let root = status.extract_dir.join(FILES_DIR);
        let scanned = scan_with_retry(&root, SCAN_ATTEMPTS, SCAN_RETRY_DELAY).await?;
        status.progress.dirs_total = scanned.directories.len();
        status.progress.files_total = scanned.files.len();
        status.progress.files_total_size = scanned.total_size;
        status.dir_queue = scanned.directories.into();
        status.file_queue = scanned.files.into();

        let (dirs_share, files_share) = rebalance(
            status.batch.files_batch_size,
            status.dir_queue.len(),
            status.progress.dirs_total,
            status.file_queue.len(),
        );
        status.batch.dirs_share = dirs_share;
        status.batch.files_share = files_share;
        status.files_initialized = true;
        log::info!(
            "📦 File restore initialized: {} directories, {} files, {} bytes",
            status.progress.dirs_total,
            status.progress.files_total,
            status.progress.files_total_size
        );
        Ok(())
    }

    /// Runs one batch: the retry backlog first, then up to `dirs_share`
    /// directories, then up to `files_share` files.
    pub async fn process_batch(&mut self, status: &mut RestoreStatus) -> Result<()> {
        if !status.files_initialized {
            self.initialize(status).await?;
        }
        self.ensure_connected(status).await?;

        let started = Instant::now();
        let bytes_before = status.progress.files_processed_size;
        let (dirs_share, files_share) = rebalance(
            status.batch.files_batch_size,
            status.dir_queue.len(),
            status.progress.dirs_total,
            status.file_queue.len(),
        );
        status.batch.dirs_share = dirs_share;
        status.batch.files_share = files_share;

        let mut items = 0;
        let mut stop = false;

        for item in std::mem::take(&mut status.retry_items) {
            if stop {
                status.retry_items.push(item);
                continue;
            }
            let origin = Origin::Backlog {
                retry_count: item.retry_count,
                last_error: item.last_error,
            };
            let kind = item.entry.kind;
            if self.run_item(status, item.entry, origin).await?.consumed_share() {
                items += 1;
            }
            stop = self.under_pressure(kind);
        }

        let mut dirs_done = 0;
        while !stop && dirs_done < dirs_share {
            let Some(entry) = status.dir_queue.pop_front() else {
                break;
            };
            if self.run_item(status, entry, Origin::Queue).await?.consumed_share() {
                dirs_done += 1;
            }
        }

        let mut files_done = 0;
        while !stop && files_done < files_share {
            let Some(entry) = status.file_queue.pop_front() else {
                break;
            };
            if self.run_item(status, entry, Origin::Queue).await?.consumed_share() {
                files_done += 1;
            }
            stop = self.under_pressure(EntryKind::File);
        }
        items += dirs_done + files_done;

        let seconds = started.elapsed().as_secs_f64();
        let bytes = status.progress.files_processed_size - bytes_before;
        status.record_batch(Phase::Files, items, bytes, seconds);
        log::debug!(
            "File batch: {} items, {} bytes in {:.2}s ({} dirs / {} files share)",
            items,
            bytes,
            seconds,
            dirs_share,
            files_share
        );

        if status.dir_queue.is_empty() && status.file_queue.is_empty() && status.retry_items.is_empty() {
            self.finish().await;
            log::info!(
                "✅ File phase finished: {} directories, {} files restored, {} failed",
                status.progress.dirs_processed,
                status.progress.actual_files_processed,
                status.failed_files.len()
            );
            status.transition(Phase::Cleanup);
        }
        status.touch();
        Ok(())
    }

    /// Closes the target connection, if one is open.
    pub async fn finish(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                log::warn!("Failed to close {} connection cleanly: {}", transport.name(), e);
            }
        }
    }

    fn under_pressure(&mut self, kind: EntryKind) -> bool {
        if kind != EntryKind::File {
            return false;
        }
        self.file_operations += 1;
        if self.file_operations % MEMORY_CHECK_INTERVAL != 0 {
            return false;
        }
        let ratio = self.memory.usage_ratio();
        if ratio > MEMORY_LIMIT_RATIO {
            log::warn!(
                "Memory use at {:.0}% of budget, ending file batch early",
                ratio * 100.0
            );
            return true;
        }
        false
    }

    async fn run_item(&mut self, status: &mut RestoreStatus, entry: FsEntry, origin: Origin) -> Result<Step> {
        if self.operations > 0 && self.operations % HEALTH_CHECK_INTERVAL == 0 {
            self.check_health(status).await?;
        }
        self.operations += 1;

        match self.attempt(status, &entry).await {
            Ok(Attempt::Done(bytes)) => {
                status.connection_attempts = 0;
                match entry.kind {
                    EntryKind::Directory => status.progress.dirs_processed += 1,
                    EntryKind::File => {
                        status.progress.actual_files_processed += 1;
                        status.add_file_bytes(bytes);
                    }
                }
                Ok(Step::Processed)
            }
            Ok(Attempt::ParentCreated) => {
                put_back(status, entry, origin);
                Ok(Step::Requeued)
            }
            Err(e) if e.is_connection_loss() => {
                // Counted as a retry, so an item that keeps breaking a healthy
                // connection ends up in `failed_files`.
                log::warn!("Connection lost while restoring {}: {}", entry.path, e);
                let message = e.to_string();
                self.reconnect(status, e).await?;
                record_failure(status, entry, origin, RestoreError::Network(message));
                Ok(Step::Reconnected)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                record_failure(status, entry, origin, e);
                Ok(Step::Failed)
            }
        }
    }

    async fn attempt(&mut self, status: &mut RestoreStatus, entry: &FsEntry) -> Result<Attempt> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| RestoreError::Network("no open connection to the target".into()))?;

        if let Some(parent) = parent_of(&entry.path) {
            if !status.path_cache.contains(&parent) && !status.created_directories.contains(&parent) {
                log::debug!("Creating missing parent {} before {}", parent, entry.path);
                let made = transport
                    .ensure_directory(&parent, &status.created_directories)
                    .await?;
                status.path_cache.extend(made.iter().cloned());
                status.created_directories.extend(made);
                return Ok(Attempt::ParentCreated);
            }
        }

        match entry.kind {
            EntryKind::Directory => {
                if !status.created_directories.contains(&entry.path) {
                    let made = transport
                        .ensure_directory(&entry.path, &status.created_directories)
                        .await?;
                    status.path_cache.extend(made.iter().cloned());
                    status.created_directories.extend(made);
                }
                Ok(Attempt::Done(0))
            }
            EntryKind::File => {
                let source = source_path(status, &entry.path);
                let bytes = transport.put_file(&source, &entry.path).await?;
                Ok(Attempt::Done(bytes))
            }
        }
    }

    async fn ensure_connected(&mut self, status: &mut RestoreStatus) -> Result<()> {
        match self.transport.as_mut() {
            Some(transport) => {
                if !transport.health_check().await {
                    self.reconnect(status, RestoreError::Network("health check failed".into()))
                        .await?;
                }
                Ok(())
            }
            None => match self.connector.connect().await {
                Ok(transport) => {
                    log::debug!("Connected to {} target", transport.name());
                    self.transport = Some(transport);
                    Ok(())
                }
                Err(e) if e.is_connection_loss() => self.reconnect(status, e).await,
                Err(e) => Err(e),
            },
        }
    }

    async fn check_health(&mut self, status: &mut RestoreStatus) -> Result<()> {
        let healthy = match self.transport.as_mut() {
            Some(transport) => transport.health_check().await,
            None => false,
        };
        if !healthy {
            log::warn!("Target connection failed its health check");
            self.reconnect(status, RestoreError::Network("health check failed".into()))
                .await?;
        }
        Ok(())
    }

    /// Drops the current connection and opens a new one with exponential
    /// backoff. Fails after [`MAX_RECONNECT_ATTEMPTS`] consecutive attempts.
    async fn reconnect(&mut self, status: &mut RestoreStatus, mut reason: RestoreError) -> Result<()> {
        if let Some(mut stale) = self.transport.take() {
            if let Err(e) = stale.close().await {
                log::debug!("Ignoring close error on stale connection: {}", e);
            }
        }
        loop {
            status.connection_attempts += 1;
            if status.connection_attempts > MAX_RECONNECT_ATTEMPTS {
                return Err(RestoreError::Network(format!(
                    "target unreachable after {} reconnect attempts: {}",
                    MAX_RECONNECT_ATTEMPTS, reason
                )));
            }
            let delay = reconnect_backoff(self.reconnect_delay, status.connection_attempts);
            log::warn!(
                "🔌 Reconnecting (attempt {}/{}) in {:?}: {}",
                status.connection_attempts,
                MAX_RECONNECT_ATTEMPTS,
                delay,
                reason
            );
            tokio::time::sleep(delay).await;

            match self.connector.connect().await {
                Ok(transport) => {
                    log::info!("✓ Reconnected to {} target", transport.name());
                    self.transport = Some(transport);
                    self.operations = 0;
                    status.touch();
                    return Ok(());
                }
                Err(e) if e.is_connection_loss() => reason = e,
                Err(e) => return Err(e),
            }
        }
    }
}

fn put_back(status: &mut RestoreStatus, entry: FsEntry, origin: Origin) {
    match origin {
        Origin::Queue => match entry.kind {
            EntryKind::Directory => status.dir_queue.push_front(entry),
            EntryKind::File => status.file_queue.push_front(entry),
        },
        Origin::Backlog {
            retry_count,
            last_error,
        } => status.retry_items.push(RetryItem {
            entry,
            retry_count,
            last_error,
        }),
    }
}

fn record_failure(status: &mut RestoreStatus, entry: FsEntry, origin: Origin, error: RestoreError) {
    let previous = match origin {
        Origin::Queue => 0,
        Origin::Backlog { retry_count, .. } => retry_count,
    };
    let retry_count = previous + 1;
    let message = error.to_string();

    if retry_count > MAX_RETRIES {
        log::error!(
            "Giving up on {} after {} attempts: {}",
            entry.path,
            retry_count,
            message
        );
        status.failed_files.push(FailedItem {
            path: entry.path,
            kind: entry.kind,
            error: message,
            attempts: retry_count,
        });
    } else {
        log::warn!("{} failed, will retry: {}", entry.path, message);
        status.retry_items.push(RetryItem {
            entry,
            retry_count,
            last_error: message,
        });
    }
}
