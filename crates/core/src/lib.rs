pub mod archive;
pub mod client;
pub mod config;
pub mod crypto;
pub mod crypto_state;
pub mod detect;
mod error;
pub mod json_records;
pub mod legacy;
pub mod message_restore;
pub mod metadata;
pub mod model;
pub mod mp_export;
pub mod mp_import;
pub mod persistence;
pub mod progress;
pub mod remote;
pub mod run_log;
pub mod secrets;
pub mod user_db;
pub mod web_import;

pub const APP_NAME: &str = "Keepsake";

pub use crypto::PassphraseCipher;
pub use crypto_state::{
    CryptoStateBackup, CryptoStateRestore, CryptoStateSync, backup_crypto_state,
    restore_crypto_state,
};
pub use detect::{ArchiveClass, classify, detect_format};
pub use error::{Error, RestoreFailure, RestoreOutcome, Result};
pub use legacy::{LegacyExportOptions, RestoreContext, RestoreReport, export_legacy, restore_backup};
pub use message_restore::restore_remote_messages;
pub use metadata::{BackupFormat, BackupMetadata, ExportArtifact};
pub use mp_export::{
    BackupTask, ExportOptions, ExportStats, ExportUploadJob, MultiplatformExporter,
    export_multiplatform, spawn_export_upload,
};
pub use mp_import::{MultiplatformImport, MultiplatformImporter, Pager, restore_multiplatform};
pub use persistence::{DatabaseExporter, DatabaseImporter, ImportStats, UserDatabase};
pub use remote::{
    HttpRemoteBackupConfig, HttpRemoteBackupService, InMemoryRemoteBackup, RemoteBackupService,
};
pub use user_db::SqliteUserDb;
pub use web_import::{WebImportReport, import_web_backup};
