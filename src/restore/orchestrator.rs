// siterestore/src/restore/orchestrator.rs
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::MEMORY_LIMIT_RATIO;
use super::archive::{ExtractProgress, extract_archive, inspect_layout};
use super::batch::{recovery_settings, settings_for_speed};
use super::db::{DatabaseRestore, SqlConnector};
use super::download::{ArchiveDownloader, BackupSource};
use super::files::FileRestore;
use crate::config::AppConfig;
use crate::errors::{RestoreError, Result};
use crate::state::{HistoryEntry, Phase, RestoreStatus, StatusKind, StatusStore};
use crate::transport::{TransportConnector, probe_target};
use crate::utils::format_bytes;
use crate::utils::memory::MemoryProbe;

/// A restore whose status has not moved for this long is considered stalled.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Stalls tolerated before the restore is failed for good.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// A step slower than this ends the invocation.
pub const MAX_STEP_DURATION: Duration = Duration::from_secs(30);

const EXTRACT_DIR: &str = "extract";

/// Settings the orchestrator takes from `config.json`.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub speed: u32,
    pub temp_root: PathBuf,
    pub invocation_budget: Duration,
    pub reconnect_delay: Duration,
}

impl From<&AppConfig> for RestoreOptions {
    fn from(config: &AppConfig) -> Self {
        RestoreOptions {
            speed: config.speed,
            temp_root: config.temp_root.clone(),
            invocation_budget: config.invocation_budget,
            reconnect_delay: config.reconnect_delay,
        }
    }
}

/// Limits of one invocation of [`RestoreOrchestrator::process_next_step`].
struct StepBudget {
    started: Instant,
    budget: Duration,
    max_steps: usize,
    steps: usize,
}

impl StepBudget {
    fn new(max_steps: usize, budget: Duration) -> Self {
        StepBudget {
            started: Instant::now(),
            budget,
            max_steps: max_steps.max(1),
            steps: 0,
        }
    }

    /// Counts a finished step. Returns why the invocation must yield, if it must.
    fn after_step(&mut self, step_time: Duration, memory_ratio: f64) -> Option<String> {
        self.steps += 1;
        if self.steps >= self.max_steps {
            Some(format!("{} steps done", self.steps))
        } else if step_time > MAX_STEP_DURATION {
            Some(format!("last step took {:.1}s", step_time.as_secs_f64()))
        } else if memory_ratio > MEMORY_LIMIT_RATIO {
            Some(format!("memory at {:.0}% of budget", memory_ratio * 100.0))
        } else if self.started.elapsed() >= self.budget {
            Some("invocation time budget spent".to_string())
        } else {
            None
        }
    }
}

/// Saves the status after picking up a cancellation another process may
/// have marked since it was loaded.
fn persist(store: &dyn StatusStore, status: &mut RestoreStatus) -> Result<()> {
    match store.cancel_marked(&status.restore_id) {
        Ok(marked) => status.cancel_requested |= marked,
        Err(e) => log::warn!("Could not check for a cancellation request: {}", e),
    }
    store.save_status(status)
}

fn remove_temp_dir(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_dir_all(path) {
        Ok(()) => log::info!("🧹 Removed temporary directory {}", path.display()),
        Err(e) => log::warn!("Failed to remove temporary directory {}: {}", path.display(), e),
    }
}

/// Drives a restore through its phases, one bounded invocation at a time.
///
/// All collaborators are injected; the orchestrator itself keeps no state
/// between invocations beyond what the [`StatusStore`] holds.
pub struct RestoreOrchestrator {
    options: RestoreOptions,
    store: Box<dyn StatusStore>,
    transport: Box<dyn TransportConnector>,
    database: Option<Box<dyn SqlConnector>>,
    downloader: Box<dyn ArchiveDownloader>,
    memory: Box<dyn MemoryProbe>,
}

impl RestoreOrchestrator {
    pub fn new(
        options: RestoreOptions,
        store: Box<dyn StatusStore>,
        transport: Box<dyn TransportConnector>,
        database: Option<Box<dyn SqlConnector>>,
        downloader: Box<dyn ArchiveDownloader>,
        memory: Box<dyn MemoryProbe>,
    ) -> Self {
        RestoreOrchestrator {
            options,
            store,
            transport,
            database,
            downloader,
            memory,
        }
    }

    /// The live status document, if a restore is running or has failed.
    pub fn status(&self) -> Result<Option<RestoreStatus>> {
        match self.store.load_status()? {
            Some(mut status) => {
                status.cancel_requested |= self.store.cancel_marked(&status.restore_id)?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.store.load_history()
    }

    /// Starts a restore of `source`.
    ///
    /// # Arguments
    /// * `source` - Archive to restore, a local path or `s3://bucket/key`.
    /// * `backup_id` - Id recorded in history; defaults to the archive file name.
    ///
    /// # Returns
    /// The new status document. Failures after the status exists (staging,
    /// extraction, layout) are recorded in it with phase `error` rather than
    /// returned as `Err`.
    pub async fn start_restore(
        &mut self,
        source: &BackupSource,
        backup_id: Option<String>,
    ) -> Result<RestoreStatus> {
        if let Some(existing) = self.store.load_status()? {
            if !existing.is_terminal() {
                return Err(RestoreError::Config(format!(
                    "restore {} is still in progress ({:?}); cancel it first",
                    existing.restore_id, existing.phase
                )));
            }
        }

        let restore_id = format!("restore_{}", Uuid::new_v4().simple());
        probe_target(self.transport.as_ref(), &restore_id).await?;

        let backup_id = backup_id
            .or_else(|| source.file_name())
            .unwrap_or_else(|| restore_id.clone());
        let temp_dir = self.options.temp_root.join(&restore_id);
        let extract_dir = temp_dir.join(EXTRACT_DIR);
        let mut status = RestoreStatus::new(
            restore_id,
            backup_id,
            temp_dir,
            extract_dir,
            settings_for_speed(self.options.speed),
        );
        log::info!(
            "🚀 Starting restore {} of {} (speed {})",
            status.restore_id,
            status.backup_id,
            status.batch.speed
        );
        self.store.save_status(&status)?;

        if let Err(e) = self.stage_and_extract(source, &mut status).await {
            self.fail(&mut status, e);
        }
        Ok(status)
    }

    async fn stage_and_extract(&mut self, source: &BackupSource, status: &mut RestoreStatus) -> Result<()> {
        tokio::fs::create_dir_all(&status.temp_dir).await?;
        let archive_name = source.file_name().unwrap_or_else(|| "backup.zip".to_string());
        let staged = status.temp_dir.join(&archive_name);

        let bytes = self
            .downloader
            .download(source, &staged)
            .await
            .map_err(|e| RestoreError::Extraction(format!("could not stage archive: {:#}", e)))?;
        log::info!("⬇️ Staged {} ({})", archive_name, format_bytes(bytes as f64));

        let extract_dir = status.extract_dir.clone();
        let store = self.store.as_ref();
        let mut report = |progress: ExtractProgress| {
            status.progress.extracted_entries = progress.done;
            status.progress.extract_total_entries = progress.total;
            status.touch();
            if let Err(e) = persist(store, status) {
                log::warn!("Could not persist extraction progress: {}", e);
            }
        };
        extract_archive(&staged, &extract_dir, &mut report)
            .map_err(|e| RestoreError::Extraction(format!("{:#}", e)))?;
        if let Err(e) = std::fs::remove_file(&staged) {
            log::debug!("Could not remove staged archive {}: {}", staged.display(), e);
        }

        let layout =
            inspect_layout(&extract_dir).map_err(|e| RestoreError::Extraction(format!("{:#}", e)))?;
        if let Some(kind) = &layout.manifest.backup_type {
            log::info!(
                "Backup type: {} (created {})",
                kind,
                layout.manifest.created.as_deref().unwrap_or("unknown")
            );
        }
        status.has_db = layout.has_db();
        status.has_files = layout.has_files();
        if status.has_db && self.database.is_none() {
            return Err(RestoreError::Config(
                "archive contains a database dump but database_url is not configured".into(),
            ));
        }

        status.transition(if status.has_db {
            Phase::Database
        } else {
            Phase::Files
        });
        status.touch();
        persist(self.store.as_ref(), status)?;
        Ok(())
    }

    /// Runs up to `max_steps` batches of the active phase and persists after
    /// each. Returns the status as it stands when the invocation yields, or
    /// `None` when no restore exists.
    pub async fn process_next_step(&mut self) -> Result<Option<RestoreStatus>> {
        let Some(mut status) = self.store.load_status()? else {
            return Ok(None);
        };
        if status.is_terminal() {
            return Ok(Some(status));
        }
        status.cancel_requested |= self.store.cancel_marked(&status.restore_id)?;
        if status.cancel_requested {
            self.teardown_canceled(&mut status)?;
            return Ok(Some(status));
        }

        let outcome = match self.check_stall(&mut status) {
            Ok(()) => self.drive(&mut status).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) if status.is_terminal() => {}
            Ok(()) => {
                status.touch();
                persist(self.store.as_ref(), &mut status)?;
                if status.cancel_requested {
                    self.teardown_canceled(&mut status)?;
                }
            }
            Err(e) => self.fail(&mut status, e),
        }
        Ok(Some(status))
    }

    /// Enters recovery mode when the status has not moved for
    /// [`STALL_TIMEOUT`]; fails after [`MAX_RECOVERY_ATTEMPTS`] stalls.
    fn check_stall(&mut self, status: &mut RestoreStatus) -> Result<()> {
        let idle = Utc::now()
            .signed_duration_since(status.last_update)
            .to_std()
            .unwrap_or_default();
        if idle <= STALL_TIMEOUT {
            return Ok(());
        }
        if status.recovery_attempts >= MAX_RECOVERY_ATTEMPTS {
            return Err(RestoreError::Stalled(format!(
                "no progress for {}s after {} recovery attempts",
                idle.as_secs(),
                status.recovery_attempts
            )));
        }
        status.recovery_attempts += 1;
        status.recovery_mode = true;
        status.batch = recovery_settings(&status.batch);
        status.path_cache.clear();
        status.connection_attempts = 0;
        log::warn!(
            "⚠️ Restore idle for {}s, entering recovery mode (attempt {}/{}) with {} files and {} tables per batch",
            idle.as_secs(),
            status.recovery_attempts,
            MAX_RECOVERY_ATTEMPTS,
            status.batch.files_batch_size,
            status.batch.db_batch_size
        );
        status.touch();
        persist(self.store.as_ref(), status)?;
        Ok(())
    }

    async fn drive(&mut self, status: &mut RestoreStatus) -> Result<()> {
        let mut budget = StepBudget::new(status.batch.max_steps, self.options.invocation_budget);
        let delay = self.options.reconnect_delay;
        let store = self.store.as_ref();

        loop {
            match status.phase {
                Phase::Extracting => {
                    return Err(RestoreError::Extraction(
                        "restore was interrupted while extracting; start it again".into(),
                    ));
                }
                Phase::Database => {
                    let connector = self.database.as_deref().ok_or_else(|| {
                        RestoreError::Config("database phase reached without database_url".into())
                    })?;
                    let mut engine = DatabaseRestore::new(connector, self.memory.as_mut(), delay);
                    while status.phase == Phase::Database {
                        let step_started = Instant::now();
                        engine.process_batch(status).await?;
                        persist(store, status)?;
                        if status.cancel_requested {
                            return Ok(());
                        }
                        if let Some(reason) = budget.after_step(step_started.elapsed(), engine.memory_ratio()) {
                            log::info!("⏸️ Yielding: {}", reason);
                            return Ok(());
                        }
                    }
                }
                Phase::Files => {
                    let mut engine = FileRestore::new(self.transport.as_ref(), self.memory.as_mut(), delay);
                    let outcome = run_file_steps(&mut engine, status, store, &mut budget).await;
                    engine.finish().await;
                    if outcome? {
                        return Ok(());
                    }
                }
                Phase::Cleanup => return self.process_cleanup(status),
                Phase::Completed | Phase::Error | Phase::Canceled => return Ok(()),
            }
        }
    }

    /// Removes temporary files, classifies the outcome, writes history and
    /// discards the live status.
    pub fn process_cleanup(&self, status: &mut RestoreStatus) -> Result<()> {
        remove_temp_dir(&status.temp_dir);

        let finished = Utc::now();
        let seconds = (finished - status.started_at).num_milliseconds().max(1) as f64 / 1000.0;
        status.performance.total_seconds = seconds;
        status.performance.average_bytes_per_second = status.progress.processed_size as f64 / seconds;

        let p = &status.progress;
        let failed = status.failed_files.len() + p.tables_failed;
        let summary = format!(
            "Restore finished in {:.0}s: {} tables, {} directories and {} files restored ({} at {}/s); {} items failed.",
            seconds,
            p.tables_processed.saturating_sub(p.tables_failed),
            p.dirs_processed,
            p.actual_files_processed,
            format_bytes(p.processed_size as f64),
            format_bytes(status.performance.average_bytes_per_second),
            failed
        );
        status.status = if status.errors.is_empty() && failed == 0 {
            StatusKind::Completed
        } else {
            StatusKind::Partial
        };
        status.finished_at = Some(finished);
        status.summary = Some(summary.clone());
        status.transition(Phase::Completed);
        log::info!("✅ {}", summary);

        self.store
            .append_history(HistoryEntry::from_status(status, summary))?;
        self.store.clear_status()
    }

    /// Marks the stored restore for cancellation; the next step tears it down.
    /// Returns false when there is nothing to cancel.
    pub fn request_cancel(&self) -> Result<bool> {
        match self.store.load_status()? {
            Some(status) if !status.is_terminal() => {
                self.store.mark_canceled(&status.restore_id)?;
                log::info!("Cancellation requested for restore {}", status.restore_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Cancels the stored restore immediately.
    pub fn cancel_restore(&self) -> Result<Option<RestoreStatus>> {
        match self.store.load_status()? {
            Some(mut status) if !status.is_terminal() => {
                self.teardown_canceled(&mut status)?;
                Ok(Some(status))
            }
            _ => Ok(None),
        }
    }

    fn teardown_canceled(&self, status: &mut RestoreStatus) -> Result<()> {
        remove_temp_dir(&status.temp_dir);
        status.status = StatusKind::Canceled;
        status.finished_at = Some(Utc::now());
        status.transition(Phase::Canceled);
        log::warn!("🛑 Restore {} canceled", status.restore_id);
        self.store
            .append_history(HistoryEntry::from_status(status, "Restore canceled by user".into()))?;
        self.store.clear_status()
    }

    /// Records a fatal error. The failed status stays readable until the next
    /// restore starts.
    fn fail(&self, status: &mut RestoreStatus, error: RestoreError) {
        status.fail(error.to_string());
        if let Err(e) = self.store.save_status(status) {
            log::error!("Could not persist failed status: {}", e);
        }
        let entry = HistoryEntry::from_status(status, status.message.clone());
        if let Err(e) = self.store.append_history(entry) {
            log::error!("Could not record failed restore in history: {}", e);
        }
        remove_temp_dir(&status.temp_dir);
    }
}

/// Runs file batches until the phase ends or the budget is spent. Returns
/// true when the invocation must yield.
async fn run_file_steps(
    engine: &mut FileRestore<'_>,
    status: &mut RestoreStatus,
    store: &dyn StatusStore,
    budget: &mut StepBudget,
) -> Result<bool> {
    while status.phase == Phase::Files {
        let step_started = Instant::now();
        engine.process_batch(status).await?;
        persist(store, status)?;
        if status.cancel_requested {
            return Ok(true);
        }
        if let Some(reason) = budget.after_step(step_started.elapsed(), engine.memory_ratio()) {
            log::info!("⏸️ Yielding: {}", reason);
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{SqlErrorKind, SqlFailure};
    use crate::restore::archive::fixtures::write_zip;
    use crate::restore::db::fakes::FakeSqlConnector;
    use crate::restore::download::StorageDownloader;
    use crate::state::FileStatusStore;
    use crate::transport::fake::FakeConnector;
    use crate::utils::memory::FixedMemory;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const MANIFEST: &str = "Backup Type: full\nCreated: 2026-10-01 12:00:00\nTables: 2\nFiles: 1\n";

    struct Harness {
        dir: TempDir,
        speed: u32,
        transport: FakeConnector,
        database: FakeSqlConnector,
    }

    impl Harness {
        fn new() -> anyhow::Result<Self> {
            Ok(Harness {
                dir: tempfile::tempdir()?,
                speed: 10,
                transport: FakeConnector::default(),
                database: FakeSqlConnector::default(),
            })
        }

        fn orchestrator(&self) -> anyhow::Result<RestoreOrchestrator> {
            let store = FileStatusStore::new(self.dir.path().join("state"))?;
            Ok(self.orchestrator_with_store(Box::new(store)))
        }

        fn orchestrator_with_store(&self, store: Box<dyn StatusStore>) -> RestoreOrchestrator {
            let options = RestoreOptions {
                speed: self.speed,
                temp_root: self.dir.path().join("tmp"),
                invocation_budget: Duration::from_secs(60),
                reconnect_delay: Duration::ZERO,
            };
            RestoreOrchestrator::new(
                options,
                store,
                Box::new(self.transport.clone()),
                Some(Box::new(self.database.clone())),
                Box::new(StorageDownloader::new(None)),
                Box::new(FixedMemory(0.2)),
            )
        }

        fn archive(&self, entries: &[(&str, &str)]) -> anyhow::Result<BackupSource> {
            let path = self.dir.path().join("site-backup.zip");
            write_zip(&path, entries)?;
            Ok(BackupSource::Local(path))
        }
    }

    /// Marks the restore canceled in the middle of the next status save, as a
    /// `cancel` command from another process would.
    struct CancelDuringSave {
        inner: FileStatusStore,
        armed: Arc<AtomicBool>,
    }

    impl StatusStore for CancelDuringSave {
        fn load_status(&self) -> Result<Option<RestoreStatus>> {
            self.inner.load_status()
        }

        fn save_status(&self, status: &RestoreStatus) -> Result<()> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner.mark_canceled(&status.restore_id)?;
            }
            self.inner.save_status(status)
        }

        fn clear_status(&self) -> Result<()> {
            self.inner.clear_status()
        }

        fn mark_canceled(&self, restore_id: &str) -> Result<()> {
            self.inner.mark_canceled(restore_id)
        }

        fn cancel_marked(&self, restore_id: &str) -> Result<bool> {
            self.inner.cancel_marked(restore_id)
        }

        fn load_history(&self) -> Result<Vec<HistoryEntry>> {
            self.inner.load_history()
        }

        fn append_history(&self, entry: HistoryEntry) -> Result<()> {
            self.inner.append_history(entry)
        }
    }

    fn table_sql(name: &str) -> String {
        format!(
            "DROP TABLE IF EXISTS `{0}`;\nCREATE TABLE `{0}` (id INT);\nINSERT INTO `{0}` VALUES (1),(2),(3);\n",
            name
        )
    }

    async fn run_until_terminal(orchestrator: &mut RestoreOrchestrator) -> anyhow::Result<RestoreStatus> {
        for _ in 0..100 {
            let status = orchestrator.process_next_step().await?.expect("status");
            if status.is_terminal() {
                return Ok(status);
            }
        }
        anyhow::bail!("restore did not finish")
    }

    #[tokio::test]
    async fn test_full_restore_completes() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let t1 = table_sql("t1");
        let t2 = table_sql("t2");
        let source = harness.archive(&[
            ("backup-info.txt", MANIFEST),
            ("database/t1.sql", &t1),
            ("database/t2.sql", &t2),
            ("files/a/", ""),
            ("files/a/b/", ""),
            ("files/a/b/f.txt", "hello"),
        ])?;

        let mut orchestrator = harness.orchestrator()?;
        let started = orchestrator.start_restore(&source, None).await?;
        assert_eq!(started.phase, Phase::Database);
        assert_eq!(started.backup_id, "site-backup.zip");
        assert!(started.has_db && started.has_files);

        let finished = run_until_terminal(&mut orchestrator).await?;
        assert_eq!(finished.phase, Phase::Completed);
        assert_eq!(finished.status, StatusKind::Completed);
        assert_eq!(finished.progress.tables_processed, 2);
        assert_eq!(finished.progress.dirs_processed, 2);
        assert_eq!(finished.progress.actual_files_processed, 1);
        assert!(!finished.temp_dir.exists());

        assert!(orchestrator.status()?.is_none());
        let history = orchestrator.history()?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, StatusKind::Completed);
        assert_eq!(history[0].tables_restored, 2);

        let target = harness.transport.target();
        assert_eq!(target.files.get("a/b/f.txt").map(Vec::as_slice), Some(&b"hello"[..]));
        assert!(!target.dirs.iter().any(|d| d.starts_with(".restore-probe")));
        Ok(())
    }

    #[tokio::test]
    async fn test_critical_sql_error_fails_restore() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let t1 = table_sql("t1");
        let t3 = table_sql("t3");
        let source = harness.archive(&[
            ("backup-info.txt", MANIFEST),
            ("database/t1.sql", &t1),
            ("database/t2.sql", "CREATE TABLE `t2` (id INT;\n"),
            ("database/t3.sql", &t3),
        ])?;
        harness.database.fail_on(
            "`t2` (id INT",
            SqlFailure::new(SqlErrorKind::Syntax, Some("42000".into()), "syntax error"),
        );

        let mut orchestrator = harness.orchestrator()?;
        orchestrator.start_restore(&source, Some("nightly".into())).await?;
        let failed = run_until_terminal(&mut orchestrator).await?;

        assert_eq!(failed.phase, Phase::Error);
        assert_eq!(failed.status, StatusKind::Error);
        assert_eq!(failed.progress.tables_processed, 1);
        assert!(failed.message.contains("t2"));

        let stored = orchestrator.status()?.expect("failed status stays readable");
        assert_eq!(stored.status, StatusKind::Error);
        assert_eq!(orchestrator.history()?[0].backup_id, "nightly");
        Ok(())
    }

    #[tokio::test]
    async fn test_restart_between_steps_reaches_same_outcome() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        harness.speed = 2;
        let tables: Vec<(String, String)> = (0..4)
            .map(|i| (format!("database/t{}.sql", i), table_sql(&format!("t{}", i))))
            .collect();
        let files: Vec<(String, String)> = (0..40)
            .map(|i| (format!("files/d{}/f{}.txt", i % 4, i), format!("content {}", i)))
            .collect();
        let mut entries: Vec<(&str, &str)> = vec![("backup-info.txt", MANIFEST)];
        entries.extend(tables.iter().map(|(p, c)| (p.as_str(), c.as_str())));
        entries.extend(files.iter().map(|(p, c)| (p.as_str(), c.as_str())));
        let source = harness.archive(&entries)?;

        harness.orchestrator()?.start_restore(&source, None).await?;
        let mut invocations = 0;
        let finished = loop {
            // A fresh orchestrator per invocation, as a new process would build.
            let status = harness
                .orchestrator()?
                .process_next_step()
                .await?
                .expect("status");
            invocations += 1;
            if status.is_terminal() {
                break status;
            }
            assert!(invocations < 100);
        };
        assert!(invocations > 1);

        assert_eq!(finished.status, StatusKind::Completed);
        assert_eq!(finished.progress.tables_processed, 4);
        assert_eq!(finished.progress.actual_files_processed, 40);
        let target = harness.transport.target();
        assert_eq!(target.files.len(), 40);
        assert!(target.uploads.values().all(|count| *count == 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_requested_cancel_tears_down_on_next_step() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let source = harness.archive(&[("backup-info.txt", MANIFEST), ("files/x.txt", "x")])?;

        let mut orchestrator = harness.orchestrator()?;
        let started = orchestrator.start_restore(&source, None).await?;
        assert_eq!(started.phase, Phase::Files);
        assert!(orchestrator.request_cancel()?);

        let canceled = orchestrator.process_next_step().await?.expect("status");
        assert_eq!(canceled.phase, Phase::Canceled);
        assert_eq!(canceled.status, StatusKind::Canceled);
        assert!(!canceled.temp_dir.exists());
        assert!(orchestrator.status()?.is_none());
        assert_eq!(orchestrator.history()?[0].status, StatusKind::Canceled);
        assert!(harness.transport.target().files.is_empty());
        assert!(!orchestrator.request_cancel()?);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_landing_during_a_save_is_not_lost() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        harness.speed = 2;
        let files: Vec<(String, String)> = (0..60)
            .map(|i| (format!("files/f{}.txt", i), format!("content {}", i)))
            .collect();
        let mut entries: Vec<(&str, &str)> = vec![("backup-info.txt", MANIFEST)];
        entries.extend(files.iter().map(|(p, c)| (p.as_str(), c.as_str())));
        let source = harness.archive(&entries)?;

        let armed = Arc::new(AtomicBool::new(false));
        let store = CancelDuringSave {
            inner: FileStatusStore::new(harness.dir.path().join("state"))?,
            armed: armed.clone(),
        };
        let mut orchestrator = harness.orchestrator_with_store(Box::new(store));
        orchestrator.start_restore(&source, None).await?;

        armed.store(true, Ordering::SeqCst);
        let status = orchestrator.process_next_step().await?.expect("status");

        assert!(!armed.load(Ordering::SeqCst));
        assert_eq!(status.phase, Phase::Canceled);
        assert!(status.progress.actual_files_processed < 60);
        assert!(orchestrator.status()?.is_none());
        assert_eq!(orchestrator.history()?[0].status, StatusKind::Canceled);
        Ok(())
    }

    #[tokio::test]
    async fn test_stalled_restore_enters_recovery_then_fails() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let source = harness.archive(&[("backup-info.txt", MANIFEST), ("files/x.txt", "x")])?;
        let mut orchestrator = harness.orchestrator()?;
        let started = orchestrator.start_restore(&source, None).await?;
        let store = FileStatusStore::new(harness.dir.path().join("state"))?;

        let mut stale = started.clone();
        stale.last_update = Utc::now() - chrono::Duration::minutes(10);
        store.save_status(&stale)?;
        let recovered = orchestrator.process_next_step().await?.expect("status");
        assert!(recovered.recovery_mode);
        assert_eq!(recovered.recovery_attempts, 1);
        assert_eq!(
            recovered.batch.files_batch_size,
            started.batch.files_batch_size / 2
        );

        let mut hopeless = started.clone();
        hopeless.last_update = Utc::now() - chrono::Duration::minutes(10);
        hopeless.recovery_attempts = MAX_RECOVERY_ATTEMPTS;
        store.save_status(&hopeless)?;
        let failed = orchestrator.process_next_step().await?.expect("status");
        assert_eq!(failed.status, StatusKind::Error);
        assert!(failed.message.contains("stalled"));
        Ok(())
    }

    #[tokio::test]
    async fn test_archive_without_manifest_fails_before_restoring() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let source = harness.archive(&[("files/x.txt", "x")])?;
        let mut orchestrator = harness.orchestrator()?;

        let status = orchestrator.start_restore(&source, None).await?;
        assert_eq!(status.phase, Phase::Error);
        assert!(status.message.contains("manifest"));
        assert!(harness.transport.target().files.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_second_start_is_refused_while_running() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let source = harness.archive(&[("backup-info.txt", MANIFEST), ("files/x.txt", "x")])?;
        let mut orchestrator = harness.orchestrator()?;
        orchestrator.start_restore(&source, None).await?;

        let err = orchestrator.start_restore(&source, None).await.expect_err("busy");
        assert!(matches!(err, RestoreError::Config(_)));
        Ok(())
    }
}
