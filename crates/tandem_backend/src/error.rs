use thiserror::Error;

/// Errors surfaced by session stores. Nothing here is retried or silently
/// degraded; callers decide the user-facing behavior.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session {0} already exists")]
    SessionExists(String),
    #[error("operation not supported by this session store: {0}")]
    NotSupported(&'static str),
    #[error("session store worker is not running")]
    WorkerGone,
    #[error("failed to open session database: {0}")]
    Open(String),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("schema version {0} is out of range")]
    InvalidVersion(u32),
    #[error("migration to version {version} failed")]
    MigrationFailed {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },
    #[error("migration to version {version} has no reverse action")]
    RollbackNotSupported { version: u32 },
    #[error("database integrity check failed: {detail}")]
    DatabaseCorrupted { detail: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Load/save failures of the preference document file. The variants are
/// deliberately distinct: a missing file seeds first-run defaults, while
/// any of these locks all tool approvals down until the user resets or
/// restores.
#[derive(Debug, Error)]
pub enum PreferenceFileError {
    #[error("preference file is empty")]
    EmptyFile,
    #[error("preference file is not valid JSON: {detail}")]
    InvalidJson { detail: String },
    #[error("preference file has an unexpected shape: {detail}")]
    InvalidFormat { detail: String },
    #[error("preference file is corrupted: {detail}")]
    Unknown { detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
