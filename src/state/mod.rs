//! The restore status document: the single persisted source of truth for a
//! running restore, plus the history entries written when one finishes.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;

use crate::utils::format_bytes;

pub use store::{FileStatusStore, HISTORY_LIMIT, StatusStore};

/// Smoothing weight of the previous throughput sample.
const SPEED_SMOOTHING_OLD: f64 = 0.7;
const SPEED_SMOOTHING_NEW: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extracting,
    Database,
    Files,
    Cleanup,
    Completed,
    Error,
    Canceled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Error | Phase::Canceled)
    }

    /// Position in the forward-only phase order.
    fn rank(self) -> u8 {
        match self {
            Phase::Extracting => 0,
            Phase::Database => 1,
            Phase::Files => 2,
            Phase::Cleanup => 3,
            Phase::Completed | Phase::Error | Phase::Canceled => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Processing,
    Completed,
    Partial,
    Error,
    Canceled,
}

/// Where the SQL of a queued table lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableItem {
    pub name: String,
    pub sql_path: PathBuf,
    /// Estimated bytes, used for progress only.
    pub size: u64,
    /// False for pseudo-tables (a dump with no recognizable table boundaries).
    pub verify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Directory,
    File,
}

/// A filesystem entry of the extracted `files/` tree, relative to that tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEntry {
    pub path: String,
    pub kind: EntryKind,
    pub depth: usize,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryItem {
    pub entry: FsEntry,
    pub retry_count: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub path: String,
    pub kind: EntryKind,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub tables_total: usize,
    pub tables_processed: usize,
    pub tables_failed: usize,
    pub dirs_total: usize,
    pub dirs_processed: usize,
    pub files_total: usize,
    pub actual_files_processed: usize,
    pub extracted_entries: usize,
    pub extract_total_entries: usize,
    pub db_total_size: u64,
    pub files_total_size: u64,
    pub db_processed_size: u64,
    pub files_processed_size: u64,
    pub processed_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    /// Exponentially smoothed bytes per second across all phases.
    pub bytes_per_second: f64,
    pub db_bytes_per_second: f64,
    pub files_bytes_per_second: f64,
    pub last_batch_seconds: f64,
    pub last_batch_items: usize,
    pub last_batch_bytes: u64,
    pub steps: u64,
    pub total_seconds: f64,
    pub average_bytes_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSettings {
    pub speed: u32,
    pub files_batch_size: usize,
    pub dirs_share: usize,
    pub files_share: usize,
    pub db_batch_size: usize,
    pub max_steps: usize,
}

/// State the database phase keeps between invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseCursor {
    pub initialized: bool,
    /// Statements preceding the first table of a combined dump.
    pub preamble: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreStatus {
    pub restore_id: String,
    pub backup_id: String,
    pub temp_dir: PathBuf,
    pub extract_dir: PathBuf,

    pub has_db: bool,
    pub has_files: bool,

    pub phase: Phase,
    pub status: StatusKind,
    pub message: String,

    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    pub progress: Progress,
    pub performance: Performance,
    pub batch: BatchSettings,

    pub database: DatabaseCursor,
    pub files_initialized: bool,

    pub db_queue: VecDeque<TableItem>,
    pub dir_queue: VecDeque<FsEntry>,
    pub file_queue: VecDeque<FsEntry>,
    pub retry_items: Vec<RetryItem>,

    pub errors: Vec<String>,
    pub failed_files: Vec<FailedItem>,
    pub critical_errors: Vec<String>,

    /// Directories this restore has materialized on the target.
    pub created_directories: BTreeSet<String>,
    /// Parents already verified as present before creating a child.
    pub path_cache: BTreeSet<String>,
    pub connection_attempts: u32,
    pub recovery_mode: bool,
    pub recovery_attempts: u32,
    pub cancel_requested: bool,
    pub summary: Option<String>,
}

impl RestoreStatus {
    pub fn new(
        restore_id: String,
        backup_id: String,
        temp_dir: PathBuf,
        extract_dir: PathBuf,
        batch: BatchSettings,
    ) -> Self {
        let now = Utc::now();
        let mut status = RestoreStatus {
            restore_id,
            backup_id,
            temp_dir,
            extract_dir,
            has_db: false,
            has_files: false,
            phase: Phase::Extracting,
            status: StatusKind::Processing,
            message: String::new(),
            started_at: now,
            last_update: now,
            finished_at: None,
            progress: Progress::default(),
            performance: Performance::default(),
            batch,
            database: DatabaseCursor::default(),
            files_initialized: false,
            db_queue: VecDeque::new(),
            dir_queue: VecDeque::new(),
            file_queue: VecDeque::new(),
            retry_items: Vec::new(),
            errors: Vec::new(),
            failed_files: Vec::new(),
            critical_errors: Vec::new(),
            created_directories: BTreeSet::new(),
            path_cache: BTreeSet::new(),
            connection_attempts: 0,
            recovery_mode: false,
            recovery_attempts: 0,
            cancel_requested: false,
            summary: None,
        };
        status.refresh_message();
        status
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Moves to `next`. Backward moves are refused and logged.
    pub fn transition(&mut self, next: Phase) {
        if next.rank() < self.phase.rank() {
            log::warn!(
                "Ignoring backward phase transition {:?} -> {:?}",
                self.phase,
                next
            );
            return;
        }
        if next != self.phase {
            log::info!("Restore {}: phase {:?} -> {:?}", self.restore_id, self.phase, next);
        }
        self.phase = next;
        self.refresh_message();
    }

    /// Records a fatal error and makes the status terminal.
    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        log::error!("Restore {} failed: {}", self.restore_id, error);
        self.critical_errors.push(error);
        self.status = StatusKind::Error;
        self.phase = Phase::Error;
        self.finished_at = Some(Utc::now());
        self.refresh_message();
    }

    pub fn add_db_bytes(&mut self, bytes: u64) {
        self.progress.db_processed_size += bytes;
        self.sync_processed_size();
    }

    pub fn add_file_bytes(&mut self, bytes: u64) {
        self.progress.files_processed_size += bytes;
        self.sync_processed_size();
    }

    fn sync_processed_size(&mut self) {
        self.progress.processed_size =
            self.progress.db_processed_size + self.progress.files_processed_size;
    }

    /// Folds one batch's throughput into the rolling average.
    pub fn record_batch(&mut self, phase: Phase, items: usize, bytes: u64, seconds: f64) {
        self.performance.last_batch_seconds = seconds;
        self.performance.last_batch_items = items;
        self.performance.last_batch_bytes = bytes;
        if seconds <= 0.0 {
            return;
        }
        let sample = bytes as f64 / seconds;
        self.performance.bytes_per_second = smooth(self.performance.bytes_per_second, sample);
        match phase {
            Phase::Database => {
                self.performance.db_bytes_per_second =
                    smooth(self.performance.db_bytes_per_second, sample)
            }
            Phase::Files => {
                self.performance.files_bytes_per_second =
                    smooth(self.performance.files_bytes_per_second, sample)
            }
            _ => {}
        }
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
        self.refresh_message();
    }

    /// Rebuilds the one-sentence summary shown to pollers.
    pub fn refresh_message(&mut self) {
        let p = &self.progress;
        let speed = format_bytes(self.performance.bytes_per_second);
        self.message = match self.phase {
            Phase::Extracting => format!(
                "Extracting backup archive: {} of {} entries unpacked.",
                p.extracted_entries, p.extract_total_entries
            ),
            Phase::Database => format!(
                "Restoring database: {} of {} tables restored ({}/s).",
                p.tables_processed, p.tables_total, speed
            ),
            Phase::Files => format!(
                "Restoring files: {} of {} directories and {} of {} files restored ({}/s).",
                p.dirs_processed, p.dirs_total, p.actual_files_processed, p.files_total, speed
            ),
            Phase::Cleanup => "Cleaning up temporary restore files.".to_string(),
            Phase::Completed => match &self.summary {
                Some(summary) => summary.clone(),
                None => "Restore completed.".to_string(),
            },
            Phase::Error => format!(
                "Restore failed: {}",
                self.critical_errors
                    .last()
                    .map(String::as_str)
                    .unwrap_or("unknown error")
            ),
            Phase::Canceled => "Restore was canceled.".to_string(),
        };
    }
}

fn smooth(previous: f64, sample: f64) -> f64 {
    if previous <= 0.0 {
        sample
    } else {
        previous * SPEED_SMOOTHING_OLD + sample * SPEED_SMOOTHING_NEW
    }
}

/// One finished restore, kept in the capped history list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub restore_id: String,
    pub backup_id: String,
    pub status: StatusKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: String,
    pub tables_restored: usize,
    pub dirs_restored: usize,
    pub files_restored: usize,
    pub failed_items: usize,
    pub errors: usize,
}

impl HistoryEntry {
    pub fn from_status(status: &RestoreStatus, summary: String) -> Self {
        HistoryEntry {
            restore_id: status.restore_id.clone(),
            backup_id: status.backup_id.clone(),
            status: status.status,
            started_at: status.started_at,
            finished_at: status.finished_at.unwrap_or_else(Utc::now),
            summary,
            tables_restored: status
                .progress
                .tables_processed
                .saturating_sub(status.progress.tables_failed),
            dirs_restored: status.progress.dirs_processed,
            files_restored: status.progress.actual_files_processed,
            failed_items: status.failed_files.len() + status.progress.tables_failed,
            errors: status.errors.len() + status.critical_errors.len(),
        }
    }
}
