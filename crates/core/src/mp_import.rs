use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::archive::{self, EntrySelector};
use crate::crypto::PassphraseCipher;
use crate::detect::{self, ArchiveClass};
use crate::metadata::{BackupMetadata, METADATA_FILE_NAME, MULTIPLATFORM_PLATFORM, PAGE_EXTENSION};
use crate::model::{
    BackupConversation, BackupMessage, BackupUser, Conversation, Message, QualifiedId, User,
};
use crate::mp_export::{CONVERSATIONS_PAGE_PREFIX, MESSAGES_PAGE_PREFIX, USERS_PAGE_PREFIX};
use crate::persistence::{ImportStats, UserDatabase};
use crate::{Error, Result};

/// Materializes every entry of the archive at the first path under the second.
pub type UnzipFn = Box<dyn Fn(&Path, &Path) -> Result<()> + Send + Sync>;

fn default_unzip() -> UnzipFn {
    Box::new(|source, target| {
        archive::extract(source, target, &EntrySelector::All)?;
        Ok(())
    })
}

type DecodeFn<T> = Arc<dyn Fn(&str) -> Result<T> + Send + Sync>;

/// Pull-based reader over one entity kind's page files.
///
/// Each page file is removed once it has been read. Lines that do not decode are
/// logged and counted, not returned.
pub struct Pager<T> {
    kind: &'static str,
    pages: VecDeque<PathBuf>,
    decode: DecodeFn<T>,
    skipped: u64,
}

impl<T> Pager<T> {
    fn new(kind: &'static str, pages: Vec<PathBuf>, decode: DecodeFn<T>) -> Self {
        Self {
            kind,
            pages: pages.into(),
            decode,
            skipped: 0,
        }
    }

    pub fn has_more_pages(&self) -> bool {
        !self.pages.is_empty()
    }

    pub fn remaining_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Reads and removes the next page file. Blocking; async callers use
    /// [`next_page_async`](Self::next_page_async).
    pub fn next_page(&mut self) -> Result<Vec<T>> {
        let Some(path) = self.pages.pop_front() else {
            return Ok(Vec::new());
        };
        let (items, skipped) = read_page(self.kind, &path, self.decode.as_ref())?;
        self.skipped += skipped;
        Ok(items)
    }

    /// Same as [`next_page`](Self::next_page) with the file work moved to the
    /// blocking pool.
    pub async fn next_page_async(&mut self) -> Result<Vec<T>>
    where
        T: Send + 'static,
    {
        let Some(path) = self.pages.pop_front() else {
            return Ok(Vec::new());
        };
        let kind = self.kind;
        let decode = Arc::clone(&self.decode);
        let (items, skipped) =
            tokio::task::spawn_blocking(move || read_page(kind, &path, decode.as_ref()))
                .await
                .map_err(Error::join)??;
        self.skipped += skipped;
        Ok(items)
    }
}

/// Decodes one page file, then deletes it. Returns the items and the number of
/// skipped lines.
fn read_page<T>(
    kind: &'static str,
    path: &Path,
    decode: &(dyn Fn(&str) -> Result<T> + Send + Sync),
) -> Result<(Vec<T>, u64)> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        error!(
            event = "io.mp_import.page_read_failed",
            path = %path.display(),
            error = %e,
            "io.mp_import.page_read_failed"
        );
        Error::backup_io(format!("page not readable: {e}"))
    })?;

    let mut items = Vec::new();
    let mut skipped = 0u64;
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match decode(line) {
            Ok(item) => items.push(item),
            Err(e) => {
                skipped += 1;
                warn!(
                    event = "mp_import.record_skipped",
                    kind,
                    page = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "mp_import.record_skipped"
                );
            }
        }
    }
    std::fs::remove_file(path)?;
    Ok((items, skipped))
}

fn json_decoder<B, T>(convert: impl Fn(B) -> T + Send + Sync + 'static) -> DecodeFn<T>
where
    B: DeserializeOwned,
{
    Arc::new(move |line| Ok(convert(serde_json::from_str::<B>(line)?)))
}

/// An opened multiplatform archive. The working directory is removed on drop.
pub struct MultiplatformImport {
    pub metadata: BackupMetadata,
    pub users: Pager<User>,
    pub conversations: Pager<Conversation>,
    pub messages: Pager<Message>,
    work_dir: TempDir,
}

impl MultiplatformImport {
    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }
}

pub struct MultiplatformImporter {
    account: QualifiedId,
    work_root: PathBuf,
    cipher: PassphraseCipher,
    unzip: UnzipFn,
}

impl MultiplatformImporter {
    pub fn new(account: &QualifiedId, work_root: &Path) -> Self {
        Self {
            account: account.clone(),
            work_root: work_root.to_path_buf(),
            cipher: PassphraseCipher::default(),
            unzip: default_unzip(),
        }
    }

    pub fn with_unzip(mut self, unzip: UnzipFn) -> Self {
        self.unzip = unzip;
        self
    }

    pub fn with_cipher(mut self, cipher: PassphraseCipher) -> Self {
        self.cipher = cipher;
        self
    }

    /// Opens the archive at `path`, decrypting it first when it is encrypted.
    ///
    /// Blocking; call from `spawn_blocking` inside async code.
    pub fn import_from_file(&self, path: &Path, password: Option<&str>) -> Result<MultiplatformImport> {
        let class = detect::classify(path)?;
        debug!(
            event = "mp_import.classified",
            path = %path.display(),
            class = class.as_str(),
            "mp_import.classified"
        );

        std::fs::create_dir_all(&self.work_root)?;
        let work_dir = tempfile::Builder::new()
            .prefix("mp-import-")
            .tempdir_in(&self.work_root)?;

        let source = match class {
            ArchiveClass::Invalid => {
                return Err(Error::incompatible("not a multiplatform backup archive"));
            }
            ArchiveClass::Unencrypted => path.to_path_buf(),
            ArchiveClass::Encrypted => {
                let Some(password) = password.filter(|p| !p.is_empty()) else {
                    warn!(event = "mp_import.password_missing", "mp_import.password_missing");
                    return Err(Error::InvalidPassword);
                };
                let envelope = detect::locate_envelope(path, &work_dir.path().join("envelope"))?;
                let plain = work_dir.path().join("plain.zip");
                self.cipher
                    .decrypt_file(&envelope, &plain, &self.account.to_string(), password)
                    .map_err(|e| {
                        error!(
                            event = "mp_import.decrypt_failed",
                            error = %e,
                            "mp_import.decrypt_failed"
                        );
                        e
                    })?;
                plain
            }
        };

        let content = work_dir.path().join("content");
        std::fs::create_dir_all(&content)?;
        (self.unzip)(&source, &content)?;

        let metadata = BackupMetadata::read_from(&content.join(METADATA_FILE_NAME))?;
        if metadata.platform != MULTIPLATFORM_PLATFORM {
            return Err(Error::incompatible(format!(
                "unexpected backup platform: {}",
                metadata.platform
            )));
        }
        metadata.verify_owner(&self.account)?;

        let users = page_files(&content, USERS_PAGE_PREFIX)?;
        let conversations = page_files(&content, CONVERSATIONS_PAGE_PREFIX)?;
        let messages = page_files(&content, MESSAGES_PAGE_PREFIX)?;
        info!(
            event = "mp_import.opened",
            user_pages = users.len(),
            conversation_pages = conversations.len(),
            message_pages = messages.len(),
            "mp_import.opened"
        );

        let account = self.account.clone();
        Ok(MultiplatformImport {
            metadata,
            users: Pager::new(
                USERS_PAGE_PREFIX,
                users,
                json_decoder(|u: BackupUser| User::from(u)),
            ),
            conversations: Pager::new(
                CONVERSATIONS_PAGE_PREFIX,
                conversations,
                json_decoder(|c: BackupConversation| Conversation::from(c)),
            ),
            messages: Pager::new(
                MESSAGES_PAGE_PREFIX,
                messages,
                json_decoder(move |m: BackupMessage| m.into_message(&account)),
            ),
            work_dir,
        })
    }
}

fn page_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let head = format!("{prefix}_");
    let tail = format!(".{PAGE_EXTENSION}");
    let mut pages = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(&head) && name.ends_with(&tail) && entry.file_type()?.is_file() {
            pages.push(entry.path());
        }
    }
    pages.sort();
    Ok(pages)
}

/// Drains every pager of `import` into the live database.
pub async fn restore_multiplatform(
    import: &mut MultiplatformImport,
    db: &dyn UserDatabase,
) -> Result<ImportStats> {
    let mut stats = ImportStats::default();

    while import.users.has_more_pages() {
        let page = import.users.next_page_async().await?;
        if !page.is_empty() {
            stats.users += db.insert_users(&page).await?;
        }
    }
    while import.conversations.has_more_pages() {
        let page = import.conversations.next_page_async().await?;
        if !page.is_empty() {
            stats.conversations += db.insert_conversations(&page).await?;
        }
    }
    while import.messages.has_more_pages() {
        let page = import.messages.next_page_async().await?;
        if !page.is_empty() {
            stats.messages += db.insert_messages(&page).await?;
        }
    }

    info!(
        event = "mp_import.restored",
        users = stats.users,
        conversations = stats.conversations,
        messages = stats.messages,
        skipped = import.users.skipped() + import.conversations.skipped() + import.messages.skipped(),
        "mp_import.restored"
    );
    Ok(stats)
}
