use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::model::QualifiedId;
use crate::{Error, Result};

pub const METADATA_FILE_NAME: &str = "export.json";
pub const BACKUP_DB_FILE_NAME: &str = "user-backup-database.db";
pub const ENCRYPTED_ENTRY_NAME: &str = "user-backup.cc20";
pub const ENCRYPTED_EXTENSION: &str = "cc20";
pub const DB_EXTENSION: &str = "db";
pub const PAGE_EXTENSION: &str = "jsonl";

pub const WEB_EVENTS_FILE_NAME: &str = "events.json";
pub const WEB_CONVERSATIONS_FILE_NAME: &str = "conversations.json";

pub const CRYPTO_STATE_METADATA_FILE_NAME: &str = "metadata.json";
pub const PROTEUS_PREFIX: &str = "proteus/";
pub const MLS_PREFIX: &str = "mls/";

pub const LEGACY_PLATFORM: &str = "Android";
pub const MULTIPLATFORM_PLATFORM: &str = "Multiplatform";
pub const WEB_PLATFORM: &str = "Web";

/// Format version written by the legacy exporter.
pub const LEGACY_FORMAT_VERSION: &str = "24";
pub const MULTIPLATFORM_FORMAT_VERSION: &str = "1";
pub const CRYPTO_STATE_FORMAT_VERSION: u32 = 1;

pub const WEB_MIN_FORMAT_VERSION: u32 = 19;
pub const WEB_MAX_FORMAT_VERSION: u32 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFormat {
    LegacySingleDb,
    MultiplatformPaged,
    WebCompatible,
    CryptoState,
}

impl BackupFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LegacySingleDb => "legacy_single_db",
            Self::MultiplatformPaged => "multiplatform_paged",
            Self::WebCompatible => "web_compatible",
            Self::CryptoState => "crypto_state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub platform: String,
    pub version: String,
    pub user_id: String,
    pub creation_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_db_passphrase: Option<String>,
    #[serde(default)]
    pub is_db_encrypted: bool,
}

impl BackupMetadata {
    pub fn new(
        platform: &str,
        version: &str,
        user_id: &QualifiedId,
        client_id: Option<&str>,
    ) -> Self {
        Self {
            platform: platform.to_string(),
            version: version.to_string(),
            user_id: user_id.to_string(),
            creation_time: chrono::Utc::now().to_rfc3339(),
            client_id: client_id.map(str::to_string),
            user_db_passphrase: None,
            is_db_encrypted: false,
        }
    }

    pub fn is_web(&self) -> bool {
        self.platform.eq_ignore_ascii_case(WEB_PLATFORM)
    }

    pub fn format_version(&self) -> Option<u32> {
        self.version.trim().parse().ok()
    }

    /// Web exports carry a bare user id; native exports carry the qualified form.
    pub fn belongs_to(&self, account: &QualifiedId) -> bool {
        self.user_id == account.to_string() || (self.is_web() && self.user_id == account.id)
    }

    pub fn verify_owner(&self, account: &QualifiedId) -> Result<()> {
        if self.belongs_to(account) {
            return Ok(());
        }
        error!(
            event = "backup.user_id_mismatch",
            backup_user_id = %self.user_id,
            account = %account,
            "backup.user_id_mismatch"
        );
        Err(Error::InvalidUserId)
    }

    pub fn is_from_other_client(&self, current_client_id: Option<&str>) -> bool {
        self.client_id.as_deref() != current_client_id
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            error!(
                event = "io.metadata.read_failed",
                path = %path.display(),
                error = %e,
                "io.metadata.read_failed"
            );
            Error::backup_io(format!("metadata not readable: {e}"))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::incompatible(format!("metadata is not valid: {e}")))
    }
}

/// A finished backup file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoStateBackupMetadata {
    pub version: u32,
    pub client_id: String,
    pub mls_db_passphrase: String,
    pub proteus_db_passphrase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
}
