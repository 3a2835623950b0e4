// siterestore/src/restore/db/session.rs
use async_trait::async_trait;
use sqlx::mysql::MySqlConnection;
use sqlx::{Connection, Executor, Row};

use crate::errors::{RestoreError, Result, SqlErrorKind, SqlFailure};

/// One database connection. Statements run in order on the same session, so
/// session variables and transactions behave as in the mysql client.
#[async_trait]
pub trait SqlSession: Send {
    /// Runs one statement and returns the affected row count.
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, SqlFailure>;

    async fn table_exists(&mut self, table: &str) -> std::result::Result<bool, SqlFailure>;

    async fn row_count(&mut self, table: &str) -> std::result::Result<i64, SqlFailure>;

    async fn close(self: Box<Self>);
}

pub type BoxedSqlSession = Box<dyn SqlSession>;

#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(&self) -> Result<BoxedSqlSession>;
}

/// Classifies a driver error by SQLSTATE; transport-level failures become
/// connection errors.
pub fn classify_sqlx_error(error: &sqlx::Error) -> SqlFailure {
    match error {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string());
            let kind = code
                .as_deref()
                .map(SqlErrorKind::from_sqlstate)
                .unwrap_or(SqlErrorKind::Other);
            SqlFailure::new(kind, code, db_err.message())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            SqlFailure::new(SqlErrorKind::Connection, None, error.to_string())
        }
        other => SqlFailure::new(SqlErrorKind::Other, None, other.to_string()),
    }
}

/// Quotes an identifier with backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Escapes a value for use inside a single-quoted `LIKE` pattern.
fn like_literal(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '\\' => escaped.push_str("\\\\\\\\"),
            '\'' => escaped.push_str("''"),
            '_' | '%' => {
                escaped.push_str("\\\\");
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

pub struct MySqlSession {
    conn: MySqlConnection,
}

#[async_trait]
impl SqlSession for MySqlSession {
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, SqlFailure> {
        // Plain text queries go over the text protocol, which accepts every
        // statement a dump can contain.
        (&mut self.conn)
            .execute(sql)
            .await
            .map(|done| done.rows_affected())
            .map_err(|e| classify_sqlx_error(&e))
    }

    async fn table_exists(&mut self, table: &str) -> std::result::Result<bool, SqlFailure> {
        let sql = format!("SHOW TABLES LIKE '{}'", like_literal(table));
        (&mut self.conn)
            .fetch_optional(sql.as_str())
            .await
            .map(|row| row.is_some())
            .map_err(|e| classify_sqlx_error(&e))
    }

    async fn row_count(&mut self, table: &str) -> std::result::Result<i64, SqlFailure> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        let row = (&mut self.conn)
            .fetch_one(sql.as_str())
            .await
            .map_err(|e| classify_sqlx_error(&e))?;
        row.try_get::<i64, _>(0).map_err(|e| classify_sqlx_error(&e))
    }

    async fn close(self: Box<Self>) {
        let MySqlSession { conn } = *self;
        if let Err(e) = conn.close().await {
            log::debug!("Closing database connection: {}", e);
        }
    }
}

/// Opens sessions against the configured MySQL URL.
pub struct MySqlConnector {
    database_url: String,
}

impl MySqlConnector {
    pub fn new(database_url: impl Into<String>) -> Self {
        MySqlConnector {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl SqlConnector for MySqlConnector {
    async fn connect(&self) -> Result<BoxedSqlSession> {
        let conn = MySqlConnection::connect(&self.database_url)
            .await
            .map_err(|e| {
                let failure = classify_sqlx_error(&e);
                match failure.kind {
                    SqlErrorKind::Connection => RestoreError::Network(format!(
                        "Failed to connect to the target database: {}",
                        failure
                    )),
                    _ => RestoreError::Config(format!(
                        "Target database rejected the connection: {}",
                        failure
                    )),
                }
            })?;
        Ok(Box::new(MySqlSession { conn }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_identifier("wp_posts"), "`wp_posts`");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_like_literal_escapes_wildcards() {
        assert_eq!(like_literal("wp_posts"), "wp\\\\_posts");
        assert_eq!(like_literal("100%"), "100\\\\%");
        assert_eq!(like_literal("o'neil"), "o''neil");
    }

    #[test]
    fn test_io_errors_classify_as_connection() {
        let error = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "server gone",
        ));
        let failure = classify_sqlx_error(&error);
        assert_eq!(failure.kind, SqlErrorKind::Connection);
        assert!(RestoreError::Sql(failure).is_connection_loss());
    }
}
