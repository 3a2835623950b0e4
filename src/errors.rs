use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural classification of a failed SQL statement.
///
/// Assigned by the statement executor from the server's SQLSTATE, so callers
/// never have to inspect error text to decide how bad a failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlErrorKind {
    Syntax,
    MissingObject,
    Schema,
    Constraint,
    Data,
    Connection,
    Other,
}

impl SqlErrorKind {
    /// Maps a five character SQLSTATE onto a kind.
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "42000" => SqlErrorKind::Syntax,
            "42S02" | "42S22" | "42S12" => SqlErrorKind::MissingObject,
            "3D000" => SqlErrorKind::Schema,
            _ => match code.get(..2) {
                Some("42") => SqlErrorKind::Schema,
                Some("23") => SqlErrorKind::Constraint,
                Some("22") => SqlErrorKind::Data,
                Some("08") => SqlErrorKind::Connection,
                _ => SqlErrorKind::Other,
            },
        }
    }

    /// Critical failures abort the whole restore: applying half a schema is unsafe.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            SqlErrorKind::Syntax | SqlErrorKind::MissingObject | SqlErrorKind::Schema
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlFailure {
    pub kind: SqlErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl SqlFailure {
    pub fn new(kind: SqlErrorKind, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for SqlFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for SqlFailure {}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection error: {0}")]
    Network(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Transfer failed: {0}")]
    Transport(String),

    #[error("SQL error: {0}")]
    Sql(SqlFailure),

    #[error("Critical database error in table `{table}`: {failure}")]
    Critical { table: String, failure: SqlFailure },

    #[error("Archive error: {0}")]
    Extraction(String),

    #[error("Restore stalled: {0}")]
    Stalled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl RestoreError {
    /// Fatal errors stop the restore; everything else is item-level and retried
    /// or recorded.
    pub fn is_fatal(&self) -> bool {
        match self {
            RestoreError::Config(_)
            | RestoreError::Auth(_)
            | RestoreError::Permission(_)
            | RestoreError::Critical { .. }
            | RestoreError::Extraction(_)
            | RestoreError::Stalled(_) => true,
            RestoreError::Sql(failure) => failure.kind.is_critical(),
            RestoreError::Network(_)
            | RestoreError::Transport(_)
            | RestoreError::Io(_)
            | RestoreError::SerdeJson(_)
            | RestoreError::Anyhow(_) => false,
        }
    }

    /// True when the underlying connection should be considered gone.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            RestoreError::Network(_) => true,
            RestoreError::Sql(failure) => failure.kind == SqlErrorKind::Connection,
            _ => false,
        }
    }
}

impl From<SqlFailure> for RestoreError {
    fn from(failure: SqlFailure) -> Self {
        RestoreError::Sql(failure)
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;
