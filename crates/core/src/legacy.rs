use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::archive::{self, ArchiveEntry, EntrySelector};
use crate::client::SlowSyncRecovery;
use crate::crypto::PassphraseCipher;
use crate::detect::{self, ArchiveClass};
use crate::error::{RestoreFailure, RestoreOutcome};
use crate::metadata::{
    BACKUP_DB_FILE_NAME, BackupMetadata, DB_EXTENSION, ENCRYPTED_ENTRY_NAME, ExportArtifact,
    LEGACY_FORMAT_VERSION, LEGACY_PLATFORM, METADATA_FILE_NAME, MULTIPLATFORM_PLATFORM,
};
use crate::model::QualifiedId;
use crate::persistence::{DatabaseExporter, DatabaseImporter, ImportStats, UserDatabase};
use crate::web_import::{self, WEB_BATCH_SIZE, WebImportReport};
use crate::{Error, Result};

pub struct LegacyExportOptions<'a> {
    pub account: &'a QualifiedId,
    pub client_id: Option<&'a str>,
    pub work_root: &'a Path,
    pub output: &'a Path,
    pub password: Option<&'a str>,
    pub cipher: PassphraseCipher,
}

/// Writes the metadata plus a plain copy of the database into one archive. With a
/// password the archive is encrypted and the ciphertext wrapped in a second archive.
pub async fn export_legacy(
    db: &dyn DatabaseExporter,
    opts: LegacyExportOptions<'_>,
) -> Result<ExportArtifact> {
    debug!(event = "phase.start", phase = "legacy_export", "phase.start");
    std::fs::create_dir_all(opts.work_root)?;
    let work_dir = tempfile::Builder::new()
        .prefix("legacy-export-")
        .tempdir_in(opts.work_root)?;

    let db_copy = work_dir.path().join(BACKUP_DB_FILE_NAME);
    let db_bytes = db.export_to_file(&db_copy).await?;

    let metadata = BackupMetadata::new(
        LEGACY_PLATFORM,
        LEGACY_FORMAT_VERSION,
        opts.account,
        opts.client_id,
    );
    let metadata_path = work_dir.path().join(METADATA_FILE_NAME);

    let password = opts.password.filter(|p| !p.is_empty()).map(str::to_string);
    let encrypted = password.is_some();
    let account = opts.account.to_string();
    let cipher = opts.cipher;
    let output = opts.output.to_path_buf();
    let work = work_dir.path().to_path_buf();

    let size = tokio::task::spawn_blocking(move || -> Result<u64> {
        metadata.write_to(&metadata_path)?;
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries = [
            ArchiveEntry::file(METADATA_FILE_NAME, &metadata_path),
            ArchiveEntry::file(BACKUP_DB_FILE_NAME, &db_copy),
        ];
        match password {
            None => archive::compress_to_file(&entries, &output),
            Some(password) => {
                let plain = work.join("plain.zip");
                archive::compress_to_file(&entries, &plain)?;
                let envelope = work.join(ENCRYPTED_ENTRY_NAME);
                cipher
                    .encrypt_file(&plain, &envelope, &account, &password)
                    .map_err(|e| {
                        error!(
                            event = "legacy_export.encrypt_failed",
                            error = %e,
                            "legacy_export.encrypt_failed"
                        );
                        e
                    })?;
                archive::compress_to_file(
                    &[ArchiveEntry::file(ENCRYPTED_ENTRY_NAME, &envelope)],
                    &output,
                )
            }
        }
    })
    .await
    .map_err(Error::join)??;

    info!(
        event = "legacy_export.finished",
        path = %opts.output.display(),
        db_bytes,
        size,
        encrypted,
        "legacy_export.finished"
    );
    Ok(ExportArtifact {
        path: opts.output.to_path_buf(),
        size,
        encrypted,
    })
}

pub struct RestoreContext<'a> {
    pub account: &'a QualifiedId,
    pub current_client_id: Option<&'a str>,
    pub work_root: &'a Path,
    pub cipher: PassphraseCipher,
    pub recovery: &'a dyn SlowSyncRecovery,
    pub web_batch_size: usize,
}

impl<'a> RestoreContext<'a> {
    pub fn new(
        account: &'a QualifiedId,
        work_root: &'a Path,
        recovery: &'a dyn SlowSyncRecovery,
    ) -> Self {
        Self {
            account,
            current_client_id: None,
            work_root,
            cipher: PassphraseCipher::default(),
            recovery,
            web_batch_size: WEB_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestoreReport {
    Legacy(ImportStats),
    Web(WebImportReport),
}

/// Restores a legacy or web export into the live database.
pub async fn restore_backup<D>(
    db: &D,
    archive_path: &Path,
    password: Option<&str>,
    ctx: &RestoreContext<'_>,
) -> RestoreOutcome<RestoreReport>
where
    D: UserDatabase + DatabaseImporter,
{
    restore_backup_inner(db, archive_path, password, ctx)
        .await
        .map_err(|e| {
            let failure = RestoreFailure::from(e);
            error!(
                event = "restore.failed",
                archive = %archive_path.display(),
                failure = %failure,
                "restore.failed"
            );
            failure
        })
}

async fn restore_backup_inner<D>(
    db: &D,
    archive_path: &Path,
    password: Option<&str>,
    ctx: &RestoreContext<'_>,
) -> Result<RestoreReport>
where
    D: UserDatabase + DatabaseImporter,
{
    std::fs::create_dir_all(ctx.work_root)?;
    let work_dir = tempfile::Builder::new()
        .prefix("restore-")
        .tempdir_in(ctx.work_root)?;

    let Unpacked {
        content,
        metadata,
        db_file,
    } = {
        let source = archive_path.to_path_buf();
        let work = work_dir.path().to_path_buf();
        let password = password.map(str::to_string);
        let account = ctx.account.to_string();
        let cipher = ctx.cipher;
        tokio::task::spawn_blocking(move || {
            let content = unpack(&source, &work, password.as_deref(), &account, cipher)?;
            let metadata = BackupMetadata::read_from(&content.join(METADATA_FILE_NAME))?;
            let db_file = find_database_file(&content)?;
            Ok::<_, Error>(Unpacked {
                content,
                metadata,
                db_file,
            })
        })
        .await
        .map_err(Error::join)??
    };
    metadata.verify_owner(ctx.account)?;

    if metadata.is_web() {
        let report = web_import::import_web_backup(
            db,
            &content,
            &metadata,
            ctx.account,
            ctx.recovery,
            ctx.web_batch_size,
        )
        .await?;
        return Ok(RestoreReport::Web(report));
    }

    if metadata.platform == MULTIPLATFORM_PLATFORM {
        return Err(Error::incompatible(
            "multiplatform backups are restored with the paged importer",
        ));
    }

    let db_file = db_file.ok_or_else(|| {
        error!(
            event = "restore.db_missing",
            root = %content.display(),
            "restore.db_missing"
        );
        Error::backup_io("no valid content found")
    })?;

    let from_other_client = metadata.is_from_other_client(ctx.current_client_id);
    if from_other_client {
        warn!(
            event = "restore.other_client",
            backup_client_id = ?metadata.client_id,
            "restore.other_client"
        );
    }
    let stats = db.import_from_file(&db_file, from_other_client).await?;

    info!(
        event = "restore.finished",
        users = stats.users,
        conversations = stats.conversations,
        messages = stats.messages,
        calls = stats.calls,
        "restore.finished"
    );
    Ok(RestoreReport::Legacy(stats))
}

/// Extracted archive contents plus what the restore needs from them.
struct Unpacked {
    content: PathBuf,
    metadata: BackupMetadata,
    db_file: Option<PathBuf>,
}

/// Classifies the archive, decrypting the inner archive when needed, and extracts
/// its contents. Returns the directory holding the extracted entries.
fn unpack(
    source: &Path,
    work: &Path,
    password: Option<&str>,
    account: &str,
    cipher: PassphraseCipher,
) -> Result<PathBuf> {
    let class = detect::classify(source)?;
    debug!(
        event = "restore.classified",
        archive = %source.display(),
        class = class.as_str(),
        "restore.classified"
    );

    let content = work.join("content");
    match class {
        ArchiveClass::Invalid => {
            return Err(Error::incompatible("archive is not a recognised backup"));
        }
        ArchiveClass::Unencrypted => {
            archive::extract(source, &content, &EntrySelector::All)?;
        }
        ArchiveClass::Encrypted => {
            let Some(password) = password.filter(|p| !p.is_empty()) else {
                warn!(event = "restore.password_missing", "restore.password_missing");
                return Err(Error::InvalidPassword);
            };
            let envelope = detect::locate_envelope(source, &work.join("envelope"))?;
            let inner = work.join("inner.zip");
            cipher.decrypt_file(&envelope, &inner, account, password)?;
            archive::extract(&inner, &content, &EntrySelector::All)?;
        }
    }
    Ok(content)
}

fn find_database_file(root: &Path) -> Result<Option<PathBuf>> {
    let preferred = root.join(BACKUP_DB_FILE_NAME);
    if preferred.is_file() {
        return Ok(Some(preferred));
    }
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some(DB_EXTENSION)
        {
            return Ok(Some(entry.into_path()));
        }
    }
    Ok(None)
}
