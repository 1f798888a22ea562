use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub enum EntrySource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// One named entry handed to [`compress`].
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub source: EntrySource,
}

impl ArchiveEntry {
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: EntrySource::File(path.into()),
        }
    }

    pub fn bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source: EntrySource::Bytes(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySelector {
    All,
    Names(BTreeSet<String>),
    Extensions(BTreeSet<String>),
}

impl EntrySelector {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Names(names.into_iter().map(Into::into).collect())
    }

    pub fn extensions<I, S>(exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Extensions(exts.into_iter().map(Into::into).collect())
    }

    fn matches(&self, entry_name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Names(names) => names.contains(entry_name),
            Self::Extensions(exts) => {
                entry_extension(entry_name).is_some_and(|ext| exts.contains(ext))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Marker {
    Extension(String),
    Name(String),
    Prefix(String),
}

impl Marker {
    pub fn matches(&self, entry_name: &str) -> bool {
        match self {
            Self::Extension(ext) => entry_extension(entry_name) == Some(ext.as_str()),
            Self::Name(name) => entry_name == name,
            Self::Prefix(prefix) => entry_name.starts_with(prefix.as_str()),
        }
    }
}

fn entry_extension(entry_name: &str) -> Option<&str> {
    Path::new(entry_name).extension().and_then(|e| e.to_str())
}

fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
}

/// Writes `entries` into a zip container on `sink` and returns the container size.
pub fn compress<W: Write + Seek>(entries: &[ArchiveEntry], sink: W) -> Result<u64> {
    let mut zip = ZipWriter::new(sink);
    let options = file_options();

    for entry in entries {
        zip.start_file(entry.name.as_str(), options)?;
        match &entry.source {
            EntrySource::File(path) => {
                let mut f = File::open(path).map_err(|e| {
                    error!(
                        event = "io.archive.source_open_failed",
                        entry = %entry.name,
                        path = %path.display(),
                        error = %e,
                        "io.archive.source_open_failed"
                    );
                    e
                })?;
                std::io::copy(&mut f, &mut zip)?;
            }
            EntrySource::Bytes(bytes) => zip.write_all(bytes)?,
        }
    }

    let mut sink = zip.finish()?;
    let total = sink.stream_position()?;
    debug!(
        event = "archive.compressed",
        entries = entries.len(),
        bytes = total,
        "archive.compressed"
    );
    Ok(total)
}

pub fn compress_to_file(entries: &[ArchiveEntry], path: &Path) -> Result<u64> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let total = compress(entries, &mut writer)?;
    writer.flush()?;
    Ok(total)
}

fn open_archive(source: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(source).map_err(|e| {
        error!(
            event = "io.archive.open_failed",
            path = %source.display(),
            error = %e,
            "io.archive.open_failed"
        );
        e
    })?;
    Ok(ZipArchive::new(BufReader::new(file))?)
}

/// Extracts the selected entries under `output_root`, returning the written paths.
pub fn extract(
    source: &Path,
    output_root: &Path,
    selector: &EntrySelector,
) -> Result<BTreeSet<PathBuf>> {
    let mut archive = open_archive(source)?;
    std::fs::create_dir_all(output_root)?;

    let mut written = BTreeSet::new();
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        if !selector.matches(entry.name()) {
            continue;
        }
        let Some(relative) = entry.enclosed_name() else {
            error!(
                event = "archive.entry_rejected",
                entry = %entry.name(),
                "archive.entry_rejected"
            );
            return Err(Error::backup_io(format!(
                "archive entry escapes the output directory: {}",
                entry.name()
            )));
        };

        let out_path = output_root.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&out_path)?);
        std::io::copy(&mut entry, &mut out)?;
        out.flush()?;
        written.insert(out_path);
    }

    debug!(
        event = "archive.extracted",
        source = %source.display(),
        files = written.len(),
        "archive.extracted"
    );
    Ok(written)
}

pub fn entry_names(source: &Path) -> Result<Vec<String>> {
    let archive = open_archive(source)?;
    Ok(archive.file_names().map(str::to_string).collect())
}

/// Answers marker presence from the central directory; no entry is decompressed.
pub fn probe(source: &Path, markers: &[Marker]) -> Result<BTreeMap<Marker, bool>> {
    let names = entry_names(source)?;
    Ok(markers
        .iter()
        .map(|m| (m.clone(), names.iter().any(|n| m.matches(n))))
        .collect())
}

/// Lists the files of `dir` as entries named `prefix` + relative path, in sorted order.
pub fn directory_entries(dir: &Path, prefix: &str) -> Result<Vec<ArchiveEntry>> {
    let mut entries = Vec::new();
    if !dir.is_dir() {
        return Ok(entries);
    }
    for item in WalkDir::new(dir).sort_by_file_name() {
        let item = item?;
        if !item.file_type().is_file() {
            continue;
        }
        let relative = item
            .path()
            .strip_prefix(dir)
            .map_err(|e| Error::backup_io(e.to_string()))?;
        let relative = relative.to_str().ok_or_else(|| Error::NonUtf8Path {
            path: item.path().to_path_buf(),
        })?;
        let name = format!("{prefix}{}", relative.replace('\\', "/"));
        entries.push(ArchiveEntry::file(name, item.path()));
    }
    Ok(entries)
}
