// siterestore/src/state/store.rs
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{HistoryEntry, RestoreStatus};
use crate::errors::Result;

pub const HISTORY_LIMIT: usize = 50;

const STATUS_FILE: &str = "restore_status.json";
const HISTORY_FILE: &str = "restore_history.json";
const CANCEL_FILE: &str = "restore_cancel";

/// Persistence for the live status document and the restore history.
///
/// Every save rewrites the whole document; callers treat the status as a value.
pub trait StatusStore: Send + Sync {
    fn load_status(&self) -> Result<Option<RestoreStatus>>;
    fn save_status(&self, status: &RestoreStatus) -> Result<()>;
    /// Also drops any cancellation marker.
    fn clear_status(&self) -> Result<()>;
    /// Records a cancellation request apart from the status document, so a
    /// concurrent status save cannot erase it.
    fn mark_canceled(&self, restore_id: &str) -> Result<()>;
    fn cancel_marked(&self, restore_id: &str) -> Result<bool>;
    fn load_history(&self) -> Result<Vec<HistoryEntry>>;
    /// Prepends `entry`, keeping at most [`HISTORY_LIMIT`] entries.
    fn append_history(&self, entry: HistoryEntry) -> Result<()>;
}

/// JSON files in a state directory, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    dir: PathBuf,
}

impl FileStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileStatusStore { dir })
    }

    fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    fn cancel_path(&self) -> PathBuf {
        self.dir.join(CANCEL_FILE)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl StatusStore for FileStatusStore {
    fn load_status(&self) -> Result<Option<RestoreStatus>> {
        let path = self.status_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save_status(&self, status: &RestoreStatus) -> Result<()> {
        let json = serde_json::to_vec_pretty(status)?;
        self.write_atomic(&self.status_path(), &json)
    }

    fn clear_status(&self) -> Result<()> {
        for path in [self.status_path(), self.cancel_path()] {
            match fs::remove_file(path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                result => result?,
            }
        }
        Ok(())
    }

    fn mark_canceled(&self, restore_id: &str) -> Result<()> {
        self.write_atomic(&self.cancel_path(), restore_id.as_bytes())
    }

    fn cancel_marked(&self, restore_id: &str) -> Result<bool> {
        match fs::read_to_string(self.cancel_path()) {
            Ok(marked) => Ok(marked.trim() == restore_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn load_history(&self) -> Result<Vec<HistoryEntry>> {
        let path = self.history_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn append_history(&self, entry: HistoryEntry) -> Result<()> {
        let mut history = self.load_history()?;
        history.insert(0, entry);
        history.truncate(HISTORY_LIMIT);
        let json = serde_json::to_vec_pretty(&history)?;
        self.write_atomic(&self.history_path(), &json)
    }
}
