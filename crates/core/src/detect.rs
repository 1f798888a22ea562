use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::archive::{self, EntrySelector, Marker};
use crate::crypto;
use crate::metadata::{
    BackupFormat, CRYPTO_STATE_METADATA_FILE_NAME, DB_EXTENSION, ENCRYPTED_EXTENSION,
    METADATA_FILE_NAME, MLS_PREFIX, PAGE_EXTENSION, PROTEUS_PREFIX, WEB_EVENTS_FILE_NAME,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveClass {
    Encrypted,
    Unencrypted,
    Invalid,
}

impl ArchiveClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Encrypted => "encrypted",
            Self::Unencrypted => "unencrypted",
            Self::Invalid => "invalid",
        }
    }
}

/// Entry names of a zip container, or `None` when the file is not a zip.
fn zip_entry_names(path: &Path) -> Result<Option<Vec<String>>> {
    match archive::entry_names(path) {
        Ok(names) => Ok(Some(names)),
        Err(Error::Zip(e)) => {
            debug!(
                event = "detect.not_a_zip",
                path = %path.display(),
                error = %e,
                "detect.not_a_zip"
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn any_match(names: &[String], marker: &Marker) -> bool {
    names.iter().any(|n| marker.matches(n))
}

fn has_content_marker(names: &[String]) -> bool {
    [
        Marker::Extension(DB_EXTENSION.to_string()),
        Marker::Extension(PAGE_EXTENSION.to_string()),
        Marker::Name(WEB_EVENTS_FILE_NAME.to_string()),
    ]
    .iter()
    .any(|m| any_match(names, m))
}

/// Classifies an archive by its leading magic and entry names only.
pub fn classify(path: &Path) -> Result<ArchiveClass> {
    if crypto::is_envelope(path)? {
        return Ok(ArchiveClass::Encrypted);
    }
    let Some(names) = zip_entry_names(path)? else {
        return Ok(ArchiveClass::Invalid);
    };

    let class = if any_match(&names, &Marker::Extension(ENCRYPTED_EXTENSION.to_string())) {
        ArchiveClass::Encrypted
    } else if any_match(&names, &Marker::Name(METADATA_FILE_NAME.to_string()))
        && has_content_marker(&names)
    {
        ArchiveClass::Unencrypted
    } else {
        ArchiveClass::Invalid
    };
    debug!(
        event = "detect.classified",
        path = %path.display(),
        class = class.as_str(),
        "detect.classified"
    );
    Ok(class)
}

/// Resolves which backup family an archive belongs to, when it can be told from
/// the outside. A bare envelope is the single-wrapped multiplatform artifact.
pub fn detect_format(path: &Path) -> Result<Option<BackupFormat>> {
    if crypto::is_envelope(path)? {
        return Ok(Some(BackupFormat::MultiplatformPaged));
    }
    let Some(names) = zip_entry_names(path)? else {
        return Ok(None);
    };

    let has = |m: Marker| any_match(&names, &m);
    let format = if has(Marker::Extension(ENCRYPTED_EXTENSION.to_string())) {
        Some(BackupFormat::LegacySingleDb)
    } else if has(Marker::Name(CRYPTO_STATE_METADATA_FILE_NAME.to_string()))
        && (has(Marker::Prefix(PROTEUS_PREFIX.to_string()))
            || has(Marker::Prefix(MLS_PREFIX.to_string())))
    {
        Some(BackupFormat::CryptoState)
    } else if !has(Marker::Name(METADATA_FILE_NAME.to_string())) {
        None
    } else if has(Marker::Extension(PAGE_EXTENSION.to_string())) {
        Some(BackupFormat::MultiplatformPaged)
    } else if has(Marker::Name(WEB_EVENTS_FILE_NAME.to_string())) {
        Some(BackupFormat::WebCompatible)
    } else if has(Marker::Extension(DB_EXTENSION.to_string())) {
        Some(BackupFormat::LegacySingleDb)
    } else {
        None
    };
    Ok(format)
}

/// Returns the path of the encrypted envelope for an `Encrypted` archive: the file
/// itself when it is a bare envelope, otherwise its `.cc20` entry extracted into
/// `work_dir`.
pub(crate) fn locate_envelope(path: &Path, work_dir: &Path) -> Result<PathBuf> {
    if crypto::is_envelope(path)? {
        return Ok(path.to_path_buf());
    }
    let extracted = archive::extract(
        path,
        work_dir,
        &EntrySelector::extensions([ENCRYPTED_EXTENSION]),
    )?;
    match extracted.into_iter().next() {
        Some(p) => Ok(p),
        None => {
            warn!(
                event = "detect.envelope_missing",
                path = %path.display(),
                "detect.envelope_missing"
            );
            Err(Error::backup_io("encrypted entry not found in archive"))
        }
    }
}
