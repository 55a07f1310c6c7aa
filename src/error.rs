use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("could not open database: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("record encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("not a usable data directory: {0}")]
    DataDir(PathBuf),

    #[error(
        "index schema version {found} is newer than supported version {supported}"
    )]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("an auth token is required to sync")]
    MissingToken,

    #[error("session expired")]
    SessionExpired,

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("clustering failed: {0}")]
    Clustering(String),

    #[error("worker failed: {0}")]
    Worker(String),
}

impl Error {
    /// Errors that are not about a single file and must stop the whole
    /// batch: an expired session or an unreachable backend.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::SessionExpired | Error::Network(_))
    }
}

/// A cloneable summary of an [`Error`], carried on sync results.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SyncFailure {
    pub fatal: bool,
    pub message: String,
}

impl From<&Error> for SyncFailure {
    fn from(err: &Error) -> Self {
        Self {
            fatal: err.is_fatal(),
            message: err.to_string(),
        }
    }
}
