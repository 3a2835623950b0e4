//! Database restore: replays the backup's SQL table by table, each inside a
//! transaction, and verifies every table afterwards.

pub mod dump;
pub mod session;
pub mod splitter;
pub mod verification;

use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};

use self::session::SqlSession;
use self::splitter::StatementSplitter;
use super::batch::{DB_TARGET_SECONDS, adapt_db_batch};
use super::{MAX_RECONNECT_ATTEMPTS, reconnect_backoff};
use crate::errors::{RestoreError, Result, SqlErrorKind, SqlFailure};
use crate::state::{Phase, RestoreStatus, TableItem};
use crate::utils::memory::MemoryProbe;

pub use session::{BoxedSqlSession, MySqlConnector, SqlConnector};

/// SQL files above this size are read line by line instead of whole.
pub const STREAM_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Directory under the restore temp dir holding split table files.
pub const SQL_WORK_DIR: &str = "sql";

pub struct DatabaseRestore<'a> {
    connector: &'a dyn SqlConnector,
    memory: &'a mut dyn MemoryProbe,
    reconnect_delay: Duration,
}

fn read_failure(path: &Path, error: std::io::Error) -> SqlFailure {
    SqlFailure::new(
        SqlErrorKind::Other,
        None,
        format!("cannot read {}: {}", path.display(), error),
    )
}

/// Executes every statement in `path` and returns how many ran.
async fn replay_file(
    session: &mut dyn SqlSession,
    path: &Path,
) -> std::result::Result<usize, SqlFailure> {
    let size = tokio::fs::metadata(path)
        .await
        .map_err(|e| read_failure(path, e))?
        .len();
    let mut splitter = StatementSplitter::new();
    let mut executed = 0;

    if size > STREAM_THRESHOLD {
        log::debug!("Streaming {} ({} bytes)", path.display(), size);
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| read_failure(path, e))?;
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await.map_err(|e| read_failure(path, e))? {
            for statement in splitter.push_line(&line) {
                session.execute(&statement).await?;
                executed += 1;
            }
        }
    } else {
        let sql = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| read_failure(path, e))?;
        for line in sql.lines() {
            for statement in splitter.push_line(line) {
                session.execute(&statement).await?;
                executed += 1;
            }
        }
    }
    if let Some(statement) = splitter.finish() {
        session.execute(&statement).await?;
        executed += 1;
    }
    Ok(executed)
}

impl<'a> DatabaseRestore<'a> {
    pub fn new(
        connector: &'a dyn SqlConnector,
        memory: &'a mut dyn MemoryProbe,
        reconnect_delay: Duration,
    ) -> Self {
        DatabaseRestore {
            connector,
            memory,
            reconnect_delay,
        }
    }

    pub fn memory_ratio(&mut self) -> f64 {
        self.memory.usage_ratio()
    }

    /// Builds the table queue and checks that the target accepts DDL.
    pub async fn initialize(&mut self, status: &mut RestoreStatus) -> Result<()> {
        let work_dir = status.temp_dir.join(SQL_WORK_DIR);
        let queue = dump::discover_tables(&status.extract_dir, &work_dir)?;

        let mut session = self.connector.connect().await?;
        let probe = verification::probe_write_access(session.as_mut(), &status.restore_id).await;
        session.close().await;
        probe?;

        status.progress.tables_total = queue.tables.len();
        status.progress.db_total_size = queue.total_size;
        status.db_queue = queue.tables.into();
        status.database.preamble = queue.preamble;
        status.database.initialized = true;
        log::info!(
            "🗄️ Database restore initialized: {} tables queued",
            status.progress.tables_total
        );
        Ok(())
    }

    /// Restores up to `db_batch_size` tables, stopping early once the batch
    /// has run for the target duration.
    pub async fn process_batch(&mut self, status: &mut RestoreStatus) -> Result<()> {
        if !status.database.initialized {
            self.initialize(status).await?;
        }

        let started = Instant::now();
        let mut session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) if e.is_connection_loss() => return self.connection_lost(status, e).await,
            Err(e) => return Err(e),
        };

        if let Some(preamble) = status.database.preamble.clone() {
            match replay_file(session.as_mut(), &preamble).await {
                Ok(_) => {}
                Err(failure) if failure.kind == SqlErrorKind::Connection => {
                    session.close().await;
                    return self.connection_lost(status, failure.into()).await;
                }
                Err(failure) => log::warn!("Dump preamble statement failed: {}", failure),
            }
        }

        let limit = status.batch.db_batch_size.max(1);
        let mut items = 0;
        let mut bytes = 0;
        while items < limit {
            let Some(table) = status.db_queue.pop_front() else {
                break;
            };
            match restore_table(session.as_mut(), &table).await {
                Ok(rows) => {
                    status.connection_attempts = 0;
                    status.progress.tables_processed += 1;
                    status.add_db_bytes(table.size);
                    bytes += table.size;
                    match rows {
                        Some(rows) => log::debug!("Table `{}` restored ({} rows)", table.name, rows),
                        None => log::debug!("SQL unit `{}` restored", table.name),
                    }
                }
                Err(failure) if failure.kind == SqlErrorKind::Connection => {
                    log::warn!("Lost database connection while restoring `{}`", table.name);
                    status.db_queue.push_front(table);
                    session.close().await;
                    return self.connection_lost(status, failure.into()).await;
                }
                Err(failure) if failure.kind.is_critical() => {
                    status.progress.tables_failed += 1;
                    session.close().await;
                    return Err(RestoreError::Critical {
                        table: table.name,
                        failure,
                    });
                }
                Err(failure) => {
                    log::warn!("Table `{}` failed, continuing: {}", table.name, failure);
                    status
                        .errors
                        .push(format!("Table `{}`: {}", table.name, failure));
                    status.progress.tables_processed += 1;
                    status.progress.tables_failed += 1;
                    status.add_db_bytes(table.size);
                    bytes += table.size;
                }
            }
            items += 1;
            if started.elapsed().as_secs_f64() >= DB_TARGET_SECONDS {
                log::debug!("Database batch reached its time target after {} tables", items);
                break;
            }
        }
        session.close().await;

        let seconds = started.elapsed().as_secs_f64();
        status.record_batch(Phase::Database, items, bytes, seconds);
        status.batch.db_batch_size = adapt_db_batch(limit, seconds, self.memory.usage_ratio());

        if status.db_queue.is_empty() {
            log::info!(
                "✅ Database phase finished: {} restored, {} failed",
                status.progress.tables_processed,
                status.progress.tables_failed
            );
            status.transition(if status.has_files {
                Phase::Files
            } else {
                Phase::Cleanup
            });
        }
        status.touch();
        Ok(())
    }

    /// Counts a failed connection and backs off; gives up after
    /// [`MAX_RECONNECT_ATTEMPTS`] in a row.
    async fn connection_lost(&mut self, status: &mut RestoreStatus, error: RestoreError) -> Result<()> {
        status.connection_attempts += 1;
        if status.connection_attempts >= MAX_RECONNECT_ATTEMPTS {
            return Err(RestoreError::Network(format!(
                "database unreachable after {} attempts: {}",
                status.connection_attempts, error
            )));
        }
        let delay = reconnect_backoff(self.reconnect_delay, status.connection_attempts);
        log::warn!(
            "Database connection problem (attempt {}/{}), retrying in {:?}: {}",
            status.connection_attempts,
            MAX_RECONNECT_ATTEMPTS,
            delay,
            error
        );
        tokio::time::sleep(delay).await;
        status.touch();
        Ok(())
    }
}

/// Replays one table in a transaction with foreign-key checks off. Returns the
/// verified row count, or `None` for units that are not a single table.
async fn restore_table(
    session: &mut dyn SqlSession,
    table: &TableItem,
) -> std::result::Result<Option<i64>, SqlFailure> {
    log::info!("Restoring table `{}`", table.name);
    session.execute("SET FOREIGN_KEY_CHECKS = 0").await?;
    session.execute("START TRANSACTION").await?;

    let outcome = async {
        let statements = replay_file(&mut *session, &table.sql_path).await?;
        log::debug!("`{}`: {} statements executed", table.name, statements);
        if table.verify {
            verification::verify_table(&mut *session, &table.name)
                .await
                .map(Some)
        } else {
            Ok(None)
        }
    }
    .await;

    match outcome {
        Ok(rows) => {
            session.execute("COMMIT").await?;
            session.execute("SET FOREIGN_KEY_CHECKS = 1").await?;
            Ok(rows)
        }
        Err(failure) => {
            if failure.kind != SqlErrorKind::Connection {
                if let Err(e) = session.execute("ROLLBACK").await {
                    log::warn!("Rollback of `{}` failed: {}", table.name, e);
                }
                if let Err(e) = session.execute("SET FOREIGN_KEY_CHECKS = 1").await {
                    log::warn!("Could not re-enable foreign key checks: {}", e);
                }
            }
            Err(failure)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeSqlConnector;
    use super::*;
    use crate::state::fixtures::status_at;
    use crate::utils::memory::FixedMemory;
    use std::fs;

    fn write_tables(extract: &Path, tables: &[(&str, &str)]) -> anyhow::Result<()> {
        let db = extract.join("database");
        fs::create_dir_all(&db)?;
        for (name, sql) in tables {
            fs::write(db.join(format!("{}.sql", name)), sql)?;
        }
        Ok(())
    }

    fn table_sql(name: &str) -> String {
        format!(
            "DROP TABLE IF EXISTS `{0}`;\nCREATE TABLE `{0}` (id INT);\nINSERT INTO `{0}` VALUES (1),(2);\n",
            name
        )
    }

    #[tokio::test]
    async fn test_all_tables_restored_then_files_phase() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut status = status_at(dir.path());
        status.phase = Phase::Database;
        status.has_db = true;
        status.has_files = true;
        write_tables(&status.extract_dir, &[("t1", &table_sql("t1")), ("t2", &table_sql("t2"))])?;

        let connector = FakeSqlConnector::default();
        let mut memory = FixedMemory(0.5);
        let mut engine = DatabaseRestore::new(&connector, &mut memory, Duration::ZERO);
        engine.process_batch(&mut status).await?;

        assert_eq!(status.progress.tables_total, 2);
        assert_eq!(status.progress.tables_processed, 2);
        assert_eq!(status.phase, Phase::Files);
        assert_eq!(status.progress.db_processed_size, status.progress.db_total_size);

        let db = connector.db.lock().unwrap();
        assert_eq!(db.tables.get("t1"), Some(&2));
        assert!(!db.tables.keys().any(|t| t.starts_with("_restore_probe_")));
        assert!(db.executed.iter().any(|s| s == "SET FOREIGN_KEY_CHECKS = 0"));
        assert_eq!(db.executed.iter().filter(|s| *s == "COMMIT").count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_syntax_error_is_critical_and_stops_the_queue() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut status = status_at(dir.path());
        status.phase = Phase::Database;
        write_tables(
            &status.extract_dir,
            &[
                ("t1", &table_sql("t1")),
                ("t2", "CREATE TABLE `t2` (id INT;\n"),
                ("t3", &table_sql("t3")),
            ],
        )?;

        let connector = FakeSqlConnector::default();
        connector.fail_on(
            "`t2` (id INT",
            SqlFailure::new(SqlErrorKind::Syntax, Some("42000".into()), "You have an error in your SQL syntax"),
        );
        let mut memory = FixedMemory(0.5);
        let mut engine = DatabaseRestore::new(&connector, &mut memory, Duration::ZERO);
        let err = engine.process_batch(&mut status).await.expect_err("critical");

        assert!(matches!(&err, RestoreError::Critical { table, .. } if table == "t2"));
        assert!(err.is_fatal());
        assert_eq!(status.progress.tables_processed, 1);
        assert_eq!(status.db_queue.len(), 1);
        let db = connector.db.lock().unwrap();
        assert!(db.executed.iter().any(|s| s == "ROLLBACK"));
        assert!(!db.tables.contains_key("t3"));
        Ok(())
    }

    #[tokio::test]
    async fn test_constraint_failure_is_recorded_and_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut status = status_at(dir.path());
        status.phase = Phase::Database;
        write_tables(
            &status.extract_dir,
            &[("t1", &table_sql("t1")), ("t2", &table_sql("t2"))],
        )?;

        let connector = FakeSqlConnector::default();
        connector.fail_on(
            "INSERT INTO `t1`",
            SqlFailure::new(SqlErrorKind::Constraint, Some("23000".into()), "Duplicate entry"),
        );
        let mut memory = FixedMemory(0.5);
        let mut engine = DatabaseRestore::new(&connector, &mut memory, Duration::ZERO);
        engine.process_batch(&mut status).await?;

        assert_eq!(status.progress.tables_processed, 2);
        assert_eq!(status.progress.tables_total, 2);
        assert_eq!(status.progress.tables_failed, 1);
        assert_eq!(status.errors.len(), 1);
        assert!(status.errors[0].contains("Duplicate entry"));
        assert_eq!(status.phase, Phase::Cleanup);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_size_limits_tables_per_step() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut status = status_at(dir.path());
        status.phase = Phase::Database;
        status.batch.db_batch_size = 1;
        write_tables(
            &status.extract_dir,
            &[("a", &table_sql("a")), ("b", &table_sql("b")), ("c", &table_sql("c"))],
        )?;

        let connector = FakeSqlConnector::default();
        let mut memory = FixedMemory(0.9);
        let mut engine = DatabaseRestore::new(&connector, &mut memory, Duration::ZERO);
        engine.process_batch(&mut status).await?;

        assert_eq!(status.progress.tables_processed, 1);
        assert_eq!(status.db_queue.len(), 2);
        assert_eq!(status.phase, Phase::Database);
        assert_eq!(status.batch.db_batch_size, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_write_probe_is_permission_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut status = status_at(dir.path());
        write_tables(&status.extract_dir, &[("t1", &table_sql("t1"))])?;

        let connector = FakeSqlConnector::default();
        connector.fail_on(
            "_restore_probe_",
            SqlFailure::new(SqlErrorKind::Other, Some("42000".into()), "command denied"),
        );
        let mut memory = FixedMemory(0.5);
        let mut engine = DatabaseRestore::new(&connector, &mut memory, Duration::ZERO);
        let err = engine.initialize(&mut status).await.expect_err("denied");
        assert!(matches!(err, RestoreError::Permission(_)));
        assert!(!status.database.initialized);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_database_gives_up_after_five_attempts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut status = status_at(dir.path());
        status.database.initialized = true;
        status.db_queue.push_back(TableItem {
            name: "t1".into(),
            sql_path: dir.path().join("t1.sql"),
            size: 1,
            verify: true,
        });

        let connector = FakeSqlConnector::default();
        connector.db.lock().unwrap().refuse_connections = true;
        let mut memory = FixedMemory(0.5);
        let mut engine = DatabaseRestore::new(&connector, &mut memory, Duration::ZERO);
        for _ in 1..MAX_RECONNECT_ATTEMPTS {
            engine.process_batch(&mut status).await?;
        }
        let err = engine.process_batch(&mut status).await.expect_err("gave up");
        assert!(matches!(err, RestoreError::Network(_)));
        assert_eq!(status.db_queue.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_streamed_and_whole_reads_run_the_same_statements() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("big.sql");
        let mut sql = String::from("CREATE TABLE `big` (v TEXT);\n");
        let row = format!("INSERT INTO `big` VALUES ('{}');\n", "x;".repeat(1000));
        while (sql.len() as u64) <= STREAM_THRESHOLD {
            sql.push_str(&row);
        }
        fs::write(&path, &sql)?;

        let connector = FakeSqlConnector::default();
        let mut session = connector.connect().await?;
        let executed = replay_file(session.as_mut(), &path).await?;
        let expected = sql.lines().count();
        assert_eq!(executed, expected);
        assert_eq!(
            connector.db.lock().unwrap().tables.get("big"),
            Some(&((expected - 1) as i64))
        );
        Ok(())
    }
}
