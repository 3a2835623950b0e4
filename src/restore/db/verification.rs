// siterestore/src/restore/db/verification.rs
use super::session::{SqlSession, quote_identifier};
use crate::errors::{RestoreError, Result, SqlErrorKind, SqlFailure};

/// Post-restore check of a single table.
///
/// # Arguments
/// * `session` - The session the table was restored on.
/// * `table` - Table name as found in the dump.
///
/// # Returns
/// The row count, or a failure when the table is missing after its SQL ran.
pub async fn verify_table(
    session: &mut dyn SqlSession,
    table: &str,
) -> std::result::Result<i64, SqlFailure> {
    if !session.table_exists(table).await? {
        return Err(SqlFailure::new(
            SqlErrorKind::Other,
            None,
            format!("table `{}` does not exist after restore", table),
        ));
    }
    let rows = session.row_count(table).await?;
    log::info!("✓ Table `{}` verified: {} rows", table, rows);
    Ok(rows)
}

/// Creates and drops a throwaway table to confirm the restore user may write.
pub async fn probe_write_access(session: &mut dyn SqlSession, probe_id: &str) -> Result<()> {
    let suffix: String = probe_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(16)
        .collect();
    let table = quote_identifier(&format!("_restore_probe_{}", suffix));

    session
        .execute(&format!("CREATE TABLE {} (id INT)", table))
        .await
        .map_err(|failure| {
            RestoreError::Permission(format!(
                "cannot create tables in the target database: {}",
                failure
            ))
        })?;
    session
        .execute(&format!("DROP TABLE {}", table))
        .await
        .map_err(|failure| {
            RestoreError::Permission(format!(
                "cannot drop tables in the target database: {}",
                failure
            ))
        })?;
    log::info!("✓ Target database accepts CREATE/DROP TABLE");
    Ok(())
}
