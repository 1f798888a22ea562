use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::archive::{self, ArchiveEntry, EntrySelector};
use crate::client::ClientRegistry;
use crate::metadata::{
    CRYPTO_STATE_FORMAT_VERSION, CRYPTO_STATE_METADATA_FILE_NAME, CryptoStateBackupMetadata,
    MLS_PREFIX, PROTEUS_PREFIX,
};
use crate::model::QualifiedId;
use crate::remote::{CryptoStateDownload, RemoteBackupService};
use crate::secrets::{KeystoreKind, PassphraseStore, db_passphrase_key};
use crate::{Error, Result};

/// Collaborators and locations for one account's crypto-state sync.
pub struct CryptoStateSync<'a> {
    pub account: &'a QualifiedId,
    pub enabled: bool,
    pub proteus_dir: &'a Path,
    pub mls_dir: &'a Path,
    pub cache_dir: &'a Path,
    pub remote: &'a dyn RemoteBackupService,
    pub passphrases: &'a dyn PassphraseStore,
    pub registry: &'a dyn ClientRegistry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CryptoStateBackup {
    pub hash: String,
    pub uploaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CryptoStateRestore {
    Restored {
        client_id: String,
        proteus: bool,
        mls: bool,
    },
    NoBackupFound,
}

fn precondition(message: &str) -> Error {
    warn!(
        event = "crypto_state.precondition_failed",
        reason = message,
        "crypto_state.precondition_failed"
    );
    Error::Precondition {
        message: message.to_string(),
    }
}

/// A missing directory holds no files; any other walk failure is an error.
fn dir_has_files(dir: &Path) -> Result<bool> {
    for entry in WalkDir::new(dir) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => return Ok(true),
            Ok(_) => {}
            Err(e)
                if e.depth() == 0
                    && e.io_error().map(std::io::Error::kind) == Some(ErrorKind::NotFound) =>
            {
                return Ok(false);
            }
            Err(e) => {
                error!(
                    event = "io.crypto_state.keystore_unreadable",
                    dir = %dir.display(),
                    error = %e,
                    "io.crypto_state.keystore_unreadable"
                );
                return Err(e.into());
            }
        }
    }
    Ok(false)
}

fn passphrase_or_empty(sync: &CryptoStateSync<'_>, kind: KeystoreKind) -> Result<String> {
    let key = db_passphrase_key(sync.account, kind);
    match sync.passphrases.get(&key)? {
        Some(v) => Ok(v),
        None => {
            warn!(
                event = "crypto_state.passphrase_missing",
                keystore = kind.as_str(),
                "crypto_state.passphrase_missing"
            );
            Ok(String::new())
        }
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn build_archive(entries: Vec<ArchiveEntry>, cache_dir: &Path) -> Result<(NamedTempFile, u64, String)> {
    std::fs::create_dir_all(cache_dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix("crypto-state-")
        .suffix(".zip")
        .tempfile_in(cache_dir)?;
    let size = {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        let size = archive::compress(&entries, &mut writer)?;
        writer.flush()?;
        size
    };
    let hash = sha256_file(tmp.path())?;
    Ok((tmp, size, hash))
}

/// Packs both keystores with their passphrases and uploads the archive unless its
/// digest equals `last_hash`. Returns the digest of the current material.
pub async fn backup_crypto_state(
    sync: &CryptoStateSync<'_>,
    last_hash: Option<&str>,
) -> Result<CryptoStateBackup> {
    if !sync.enabled {
        return Err(precondition("crypto-state backup is disabled"));
    }
    let Some(client_id) = sync.registry.current_client_id()? else {
        return Err(precondition("no registered client"));
    };
    if !dir_has_files(sync.proteus_dir)? && !dir_has_files(sync.mls_dir)? {
        return Err(precondition("keystore directories are empty"));
    }

    debug!(event = "phase.start", phase = "crypto_state_zip", "phase.start");
    let metadata = CryptoStateBackupMetadata {
        version: CRYPTO_STATE_FORMAT_VERSION,
        client_id,
        mls_db_passphrase: passphrase_or_empty(sync, KeystoreKind::Mls)?,
        proteus_db_passphrase: passphrase_or_empty(sync, KeystoreKind::Proteus)?,
        last_event_id: None,
    };

    let mut entries = archive::directory_entries(sync.proteus_dir, PROTEUS_PREFIX)?;
    entries.extend(archive::directory_entries(sync.mls_dir, MLS_PREFIX)?);
    entries.push(ArchiveEntry::bytes(
        CRYPTO_STATE_METADATA_FILE_NAME,
        serde_json::to_vec(&metadata)?,
    ));

    let cache_dir = sync.cache_dir.to_path_buf();
    let (tmp, size, hash) = tokio::task::spawn_blocking(move || build_archive(entries, &cache_dir))
        .await
        .map_err(Error::join)??;
    debug!(
        event = "phase.finish",
        phase = "crypto_state_zip",
        bytes = size,
        hash = %hash,
        "phase.finish"
    );

    if last_hash == Some(hash.as_str()) {
        info!(event = "crypto_state.unchanged", hash = %hash, "crypto_state.unchanged");
        return Ok(CryptoStateBackup {
            hash,
            uploaded: false,
        });
    }

    sync.remote
        .upload_crypto_state(sync.account, tmp.path(), size)
        .await
        .map_err(|e| {
            error!(
                event = "crypto_state.upload_failed",
                provider = sync.remote.provider(),
                error = %e,
                "crypto_state.upload_failed"
            );
            e
        })?;
    info!(
        event = "crypto_state.uploaded",
        provider = sync.remote.provider(),
        bytes = size,
        hash = %hash,
        "crypto_state.uploaded"
    );
    Ok(CryptoStateBackup {
        hash,
        uploaded: true,
    })
}

/// Copies every file under `from` into `to`, keeping relative paths.
fn copy_tree(from: &Path, to: &Path) -> Result<u64> {
    if !from.is_dir() {
        return Ok(0);
    }
    let mut copied = 0u64;
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::backup_io(e.to_string()))?;
        let target = to.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &target)?;
        copied += 1;
    }
    Ok(copied)
}

struct Unpacked {
    metadata: CryptoStateBackupMetadata,
    proteus_files: u64,
    mls_files: u64,
}

fn unpack_and_install(archive_path: &Path, work: &Path, proteus_dir: &Path, mls_dir: &Path) -> Result<Unpacked> {
    let content = work.join("content");
    archive::extract(archive_path, &content, &EntrySelector::All)?;

    let metadata_path = content.join(CRYPTO_STATE_METADATA_FILE_NAME);
    let bytes = std::fs::read(&metadata_path).map_err(|e| {
        error!(
            event = "io.crypto_state.metadata_missing",
            error = %e,
            "io.crypto_state.metadata_missing"
        );
        Error::backup_io(format!("crypto-state metadata not readable: {e}"))
    })?;
    let metadata: CryptoStateBackupMetadata = serde_json::from_slice(&bytes)
        .map_err(|e| Error::incompatible(format!("crypto-state metadata is not valid: {e}")))?;
    if metadata.version != CRYPTO_STATE_FORMAT_VERSION {
        return Err(Error::incompatible(format!(
            "crypto-state version {} is not supported",
            metadata.version
        )));
    }

    let proteus_files = copy_tree(&content.join(PROTEUS_PREFIX.trim_end_matches('/')), proteus_dir)?;
    let mls_files = copy_tree(&content.join(MLS_PREFIX.trim_end_matches('/')), mls_dir)?;
    Ok(Unpacked {
        metadata,
        proteus_files,
        mls_files,
    })
}

/// Downloads the stored crypto state and installs it into the local keystores.
pub async fn restore_crypto_state(sync: &CryptoStateSync<'_>) -> Result<CryptoStateRestore> {
    std::fs::create_dir_all(sync.cache_dir)?;
    let work_dir = tempfile::Builder::new()
        .prefix("crypto-state-restore-")
        .tempdir_in(sync.cache_dir)?;
    let download = work_dir.path().join("state.zip");

    match sync.remote.download_crypto_state(sync.account, &download).await? {
        CryptoStateDownload::NotFound => {
            info!(event = "crypto_state.not_found", "crypto_state.not_found");
            return Ok(CryptoStateRestore::NoBackupFound);
        }
        CryptoStateDownload::Downloaded { bytes } => {
            debug!(event = "crypto_state.downloaded", bytes, "crypto_state.downloaded");
        }
    }

    let work: PathBuf = work_dir.path().to_path_buf();
    let proteus_dir = sync.proteus_dir.to_path_buf();
    let mls_dir = sync.mls_dir.to_path_buf();
    let unpacked = tokio::task::spawn_blocking(move || {
        unpack_and_install(&download, &work, &proteus_dir, &mls_dir)
    })
    .await
    .map_err(Error::join)??;

    let Unpacked {
        metadata,
        proteus_files,
        mls_files,
    } = unpacked;

    sync.passphrases.set(
        &db_passphrase_key(sync.account, KeystoreKind::Proteus),
        &metadata.proteus_db_passphrase,
    )?;
    sync.passphrases.set(
        &db_passphrase_key(sync.account, KeystoreKind::Mls),
        &metadata.mls_db_passphrase,
    )?;

    let mls = mls_files > 0;
    if mls {
        sync.registry.mark_mls_client_registered()?;
    }

    info!(
        event = "crypto_state.restored",
        client_id = %metadata.client_id,
        proteus_files,
        mls_files,
        "crypto_state.restored"
    );
    Ok(CryptoStateRestore::Restored {
        client_id: metadata.client_id,
        proteus: proteus_files > 0,
        mls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("x");
        std::fs::write(&p, b"abc").unwrap();
        assert_eq!(
            sha256_file(&p).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn copy_tree_keeps_relative_layout() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        std::fs::create_dir_all(from.join("a/b")).unwrap();
        std::fs::write(from.join("a/b/key"), b"k").unwrap();
        std::fs::write(from.join("top"), b"t").unwrap();

        let to = dir.path().join("to");
        assert_eq!(copy_tree(&from, &to).unwrap(), 2);
        assert_eq!(std::fs::read(to.join("a/b/key")).unwrap(), b"k");
        assert_eq!(copy_tree(&dir.path().join("missing"), &to).unwrap(), 0);
    }

    #[test]
    fn empty_dirs_have_no_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();
        assert!(!dir_has_files(dir.path()).unwrap());
        assert!(!dir_has_files(&dir.path().join("absent")).unwrap());
        std::fs::write(dir.path().join("nested/deeper/f"), b"x").unwrap();
        assert!(dir_has_files(dir.path()).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_keystore_dir_is_an_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir_all(&locked).unwrap();
        std::fs::write(locked.join("key"), b"k").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Root reads through the mode bits; nothing to check then.
        let readable = std::fs::read_dir(&locked).is_ok();
        let result = dir_has_files(&locked);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        if readable {
            assert!(result.unwrap());
        } else {
            assert!(matches!(result, Err(Error::Walkdir(_))));
        }
    }
}
