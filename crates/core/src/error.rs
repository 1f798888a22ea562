use std::path::PathBuf;

use crate::secrets::SecretsStoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("the provided password is invalid")]
    InvalidPassword,

    #[error("user id in the backup does not match the current user")]
    InvalidUserId,

    #[error("incompatible backup: {reason}")]
    IncompatibleBackup { reason: String },

    #[error("backup io failure: {reason}")]
    BackupIo { reason: String },

    #[error("decryption failure: {reason}")]
    Decryption { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("secrets store error: {0}")]
    Secrets(#[from] SecretsStoreError),

    #[error("remote backup error: {message}")]
    Remote { message: String },

    #[error("precondition failed: {message}")]
    Precondition { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },

    #[error("unknown failure: {message}")]
    Unknown { message: String },
}

impl Error {
    pub(crate) fn backup_io(reason: impl Into<String>) -> Self {
        Self::BackupIo {
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible(reason: impl Into<String>) -> Self {
        Self::IncompatibleBackup {
            reason: reason.into(),
        }
    }

    pub(crate) fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub(crate) fn join(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            return Self::Cancelled;
        }
        Self::Unknown {
            message: format!("background task failed: {e}"),
        }
    }
}

/// Closed failure taxonomy handed to callers of the restore entry points.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestoreFailure {
    #[error("the provided password is invalid")]
    InvalidPassword,

    #[error("user id in the backup does not match the current user")]
    InvalidUserId,

    #[error("incompatible backup: {0}")]
    IncompatibleBackup(String),

    #[error("backup io failure: {0}")]
    IoFailure(String),

    #[error("decryption failure: {0}")]
    DecryptionFailure(String),

    #[error("unknown failure: {0}")]
    Unknown(String),
}

pub type RestoreOutcome<T = ()> = std::result::Result<T, RestoreFailure>;

impl From<Error> for RestoreFailure {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidPassword => Self::InvalidPassword,
            Error::InvalidUserId => Self::InvalidUserId,
            Error::IncompatibleBackup { reason } => Self::IncompatibleBackup(reason),
            Error::BackupIo { reason } => Self::IoFailure(reason),
            Error::Decryption { reason } => Self::DecryptionFailure(reason),
            Error::Io(e) => Self::IoFailure(e.to_string()),
            Error::Zip(e) => Self::IoFailure(e.to_string()),
            Error::Walkdir(e) => Self::IoFailure(e.to_string()),
            Error::Sqlite(e) => Self::IoFailure(e.to_string()),
            Error::SqliteMigrate(e) => Self::IoFailure(e.to_string()),
            Error::Json(e) => Self::IncompatibleBackup(e.to_string()),
            other => Self::Unknown(other.to_string()),
        }
    }
}
