use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::archive::{self, ArchiveEntry};
use crate::crypto::PassphraseCipher;
use crate::metadata::{
    BackupMetadata, ExportArtifact, METADATA_FILE_NAME, MULTIPLATFORM_FORMAT_VERSION,
    MULTIPLATFORM_PLATFORM, PAGE_EXTENSION,
};
use crate::model::{BackupConversation, BackupMessage, BackupUser, Conversation, Message, QualifiedId, User};
use crate::persistence::{DbFuture, UserDatabase};
use crate::progress::{ProgressSink, TaskProgress};
use crate::remote::RemoteBackupService;
use crate::{Error, Result};

pub const USERS_PAGE_PREFIX: &str = "users";
pub const CONVERSATIONS_PAGE_PREFIX: &str = "conversations";
pub const MESSAGES_PAGE_PREFIX: &str = "messages";

pub fn page_file_name(prefix: &str, index: u32) -> String {
    format!("{prefix}_{index:05}.{PAGE_EXTENSION}")
}

struct PageState<T> {
    items: Vec<T>,
    pages_written: u32,
    items_written: u64,
}

/// Append buffer that spills a JSONL page file each time it fills up.
struct PageBuffer<T> {
    prefix: &'static str,
    page_size: usize,
    dir: PathBuf,
    state: Mutex<PageState<T>>,
}

impl<T: Serialize> PageBuffer<T> {
    fn new(prefix: &'static str, page_size: usize, dir: &Path) -> Self {
        Self {
            prefix,
            page_size,
            dir: dir.to_path_buf(),
            state: Mutex::new(PageState {
                items: Vec::with_capacity(page_size),
                pages_written: 0,
                items_written: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PageState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, item: T) -> Result<()> {
        let mut state = self.lock();
        state.items.push(item);
        if state.items.len() >= self.page_size {
            self.write_page(&mut state)?;
        }
        Ok(())
    }

    /// Writes the partial page. A kind with no rows still gets one empty page so
    /// every archive carries page entries.
    fn flush(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.items.is_empty() || state.pages_written == 0 {
            self.write_page(&mut state)?;
        }
        Ok(())
    }

    fn items_written(&self) -> u64 {
        self.lock().items_written
    }

    fn write_page(&self, state: &mut PageState<T>) -> Result<()> {
        let name = page_file_name(self.prefix, state.pages_written);
        let path = self.dir.join(&name);
        let mut out = BufWriter::new(File::create(&path)?);
        for item in &state.items {
            serde_json::to_writer(&mut out, item)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;

        state.pages_written += 1;
        state.items_written += state.items.len() as u64;
        debug!(
            event = "mp_export.page_written",
            page = %name,
            items = state.items.len(),
            "mp_export.page_written"
        );
        state.items.clear();
        Ok(())
    }
}

/// Collects users, conversations and messages into paged JSONL files and packs
/// them into one archive on [`finalize`](Self::finalize).
///
/// The three `add_*` methods lock independent buffers and may be called from
/// concurrent producers.
pub struct MultiplatformExporter {
    account: QualifiedId,
    client_id: Option<String>,
    cipher: PassphraseCipher,
    work_dir: TempDir,
    pages_dir: PathBuf,
    users: PageBuffer<BackupUser>,
    conversations: PageBuffer<BackupConversation>,
    messages: PageBuffer<BackupMessage>,
}

impl MultiplatformExporter {
    pub fn new(
        account: &QualifiedId,
        client_id: Option<&str>,
        page_size: u32,
        work_root: &Path,
        cipher: PassphraseCipher,
    ) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::InvalidConfig {
                message: "page_size must be >= 1".to_string(),
            });
        }
        std::fs::create_dir_all(work_root)?;
        let work_dir = tempfile::Builder::new()
            .prefix("mp-export-")
            .tempdir_in(work_root)?;
        let pages_dir = work_dir.path().join("pages");
        std::fs::create_dir_all(&pages_dir)?;

        let page_size = page_size as usize;
        Ok(Self {
            account: account.clone(),
            client_id: client_id.map(str::to_string),
            cipher,
            users: PageBuffer::new(USERS_PAGE_PREFIX, page_size, &pages_dir),
            conversations: PageBuffer::new(CONVERSATIONS_PAGE_PREFIX, page_size, &pages_dir),
            messages: PageBuffer::new(MESSAGES_PAGE_PREFIX, page_size, &pages_dir),
            pages_dir,
            work_dir,
        })
    }

    pub fn account(&self) -> &QualifiedId {
        &self.account
    }

    pub fn page_size(&self) -> u32 {
        self.users.page_size as u32
    }

    pub fn add_user(&self, user: &User) -> Result<()> {
        self.users.push(BackupUser::from(user))
    }

    pub fn add_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conversations.push(BackupConversation::from(conversation))
    }

    pub fn add_message(&self, message: &Message) -> Result<()> {
        self.messages.push(BackupMessage::from(message))
    }

    /// Flushes partial pages, writes the metadata and packs everything into
    /// `output`. A non-empty password encrypts the packed archive in place of
    /// the plain one. `output` only appears once the artifact is complete.
    pub fn finalize(&self, password: Option<&str>, output: &Path) -> Result<ExportArtifact> {
        self.users.flush()?;
        self.conversations.flush()?;
        self.messages.flush()?;

        let metadata = BackupMetadata::new(
            MULTIPLATFORM_PLATFORM,
            MULTIPLATFORM_FORMAT_VERSION,
            &self.account,
            self.client_id.as_deref(),
        );
        let metadata_bytes = serde_json::to_vec_pretty(&metadata)?;

        let mut entries = vec![ArchiveEntry::bytes(METADATA_FILE_NAME, metadata_bytes)];
        entries.extend(archive::directory_entries(&self.pages_dir, "")?);

        let password = password.filter(|p| !p.is_empty());
        let encrypted = password.is_some();
        match password {
            Some(password) => {
                let plain = self.work_dir.path().join("plain.zip");
                archive::compress_to_file(&entries, &plain)?;
                self.seal_into(&plain, output, password)?;
            }
            None => {
                let staged = staging_file(output)?;
                archive::compress_to_file(&entries, staged.path())?;
                persist(staged, output)?;
            }
        }

        let size = std::fs::metadata(output)?.len();
        info!(
            event = "mp_export.finalized",
            path = %output.display(),
            size,
            encrypted,
            users = self.users.items_written(),
            conversations = self.conversations.items_written(),
            messages = self.messages.items_written(),
            "mp_export.finalized"
        );
        Ok(ExportArtifact {
            path: output.to_path_buf(),
            size,
            encrypted,
        })
    }

    /// Encrypts `plain` into a staging file next to `output`, then moves it into place.
    fn seal_into(&self, plain: &Path, output: &Path, password: &str) -> Result<()> {
        let staged = staging_file(output)?;
        self.cipher
            .encrypt_file(plain, staged.path(), &self.account.to_string(), password)
            .map_err(|e| {
                error!(
                    event = "mp_export.encrypt_failed",
                    error = %e,
                    "mp_export.encrypt_failed"
                );
                e
            })?;
        persist(staged, output)
    }
}

fn staging_file(output: &Path) -> Result<NamedTempFile> {
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    Ok(tempfile::Builder::new()
        .prefix(".keepsake-export-")
        .tempfile_in(parent)?)
}

fn persist(staged: NamedTempFile, output: &Path) -> Result<()> {
    staged.persist(output).map_err(|e| {
        error!(
            event = "io.mp_export.persist_failed",
            path = %output.display(),
            error = %e.error,
            "io.mp_export.persist_failed"
        );
        Error::Io(e.error)
    })?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportStats {
    pub users: u64,
    pub conversations: u64,
    pub messages: u64,
}

#[derive(Default)]
pub struct ExportOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a dyn ProgressSink>,
}

fn check_cancel(cancel: Option<&CancellationToken>) -> Result<()> {
    if let Some(cancel) = cancel
        && cancel.is_cancelled()
    {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn fetch_users(db: &dyn UserDatabase, offset: u64, limit: u32) -> DbFuture<'_, Vec<User>> {
    db.users_page(offset, limit)
}

fn fetch_conversations(
    db: &dyn UserDatabase,
    offset: u64,
    limit: u32,
) -> DbFuture<'_, Vec<Conversation>> {
    db.conversations_page(offset, limit)
}

fn fetch_messages(db: &dyn UserDatabase, offset: u64, limit: u32) -> DbFuture<'_, Vec<Message>> {
    db.messages_page(offset, limit)
}

/// Appends `batch` on the blocking pool, where page spills do their file I/O.
async fn append_batch<T, A>(exporter: &Arc<MultiplatformExporter>, batch: Vec<T>, append: A) -> Result<()>
where
    T: Send + 'static,
    A: Fn(&MultiplatformExporter, &T) -> Result<()> + Send + 'static,
{
    let exporter = Arc::clone(exporter);
    tokio::task::spawn_blocking(move || batch.iter().try_for_each(|row| append(&exporter, row)))
        .await
        .map_err(Error::join)?
}

/// One entity kind's producer: reads database pages and feeds the exporter until a
/// short page. Each non-empty page is reported on `pages` as the running row count.
async fn produce<T, F, A>(
    kind: &'static str,
    db: Arc<dyn UserDatabase>,
    exporter: Arc<MultiplatformExporter>,
    cancel: Option<CancellationToken>,
    pages: Option<mpsc::UnboundedSender<u64>>,
    fetch: F,
    append: A,
) -> Result<(&'static str, u64)>
where
    T: Send + 'static,
    F: for<'a> Fn(&'a dyn UserDatabase, u64, u32) -> DbFuture<'a, Vec<T>> + Send + 'static,
    A: Fn(&MultiplatformExporter, &T) -> Result<()> + Copy + Send + 'static,
{
    let page = exporter.page_size();
    let mut offset = 0u64;
    loop {
        check_cancel(cancel.as_ref())?;
        let batch = fetch(db.as_ref(), offset, page).await?;
        let rows = batch.len();
        append_batch(&exporter, batch, append).await?;
        offset += rows as u64;
        if rows > 0
            && let Some(pages) = &pages
        {
            let _ = pages.send(offset);
        }
        if rows < page as usize {
            break;
        }
    }
    debug!(
        event = "mp_export.producer_finished",
        kind,
        rows = offset,
        "mp_export.producer_finished"
    );
    Ok((kind, offset))
}

/// Streams the whole database into `exporter`. Each entity kind runs as its own
/// task; all of them have finished when this returns, so the exporter is ready
/// for [`finalize`](MultiplatformExporter::finalize). Dropping the returned
/// future aborts the producers.
pub async fn export_multiplatform(
    db: Arc<dyn UserDatabase>,
    exporter: Arc<MultiplatformExporter>,
    options: ExportOptions<'_>,
) -> Result<ExportStats> {
    let message_total = db.count_messages().await?;
    let pages_total = message_total.div_ceil(u64::from(exporter.page_size()));
    let cancel = options.cancel.cloned();
    let progress = options.progress;

    debug!(
        event = "phase.start",
        phase = "mp_export",
        messages = message_total,
        pages_total,
        "phase.start"
    );
    if let Some(sink) = progress {
        sink.on_progress(TaskProgress {
            pages_total: Some(pages_total),
            pages_done: Some(0),
            ..TaskProgress::phase("messages")
        });
    }

    let (pages_tx, mut pages_rx) = mpsc::unbounded_channel();
    let mut producers = JoinSet::new();
    producers.spawn(produce(
        USERS_PAGE_PREFIX,
        db.clone(),
        exporter.clone(),
        cancel.clone(),
        None,
        fetch_users,
        MultiplatformExporter::add_user,
    ));
    producers.spawn(produce(
        CONVERSATIONS_PAGE_PREFIX,
        db.clone(),
        exporter.clone(),
        cancel.clone(),
        None,
        fetch_conversations,
        MultiplatformExporter::add_conversation,
    ));
    producers.spawn(produce(
        MESSAGES_PAGE_PREFIX,
        db,
        exporter,
        cancel,
        Some(pages_tx),
        fetch_messages,
        MultiplatformExporter::add_message,
    ));

    let mut stats = ExportStats::default();
    let mut pages_done = 0u64;
    loop {
        tokio::select! {
            biased;
            Some(items_done) = pages_rx.recv() => {
                pages_done += 1;
                if let Some(sink) = progress {
                    sink.on_progress(TaskProgress {
                        pages_total: Some(pages_total),
                        pages_done: Some(pages_done),
                        items_done: Some(items_done),
                        ..TaskProgress::phase("messages")
                    });
                }
            }
            joined = producers.join_next() => {
                let Some(joined) = joined else {
                    break;
                };
                let (kind, rows) = joined.map_err(Error::join).and_then(|r| r).map_err(|e| {
                    error!(event = "mp_export.failed", error = %e, "mp_export.failed");
                    e
                })?;
                match kind {
                    USERS_PAGE_PREFIX => stats.users = rows,
                    CONVERSATIONS_PAGE_PREFIX => stats.conversations = rows,
                    _ => stats.messages = rows,
                }
            }
        }
    }

    debug!(
        event = "phase.finish",
        phase = "mp_export",
        users = stats.users,
        conversations = stats.conversations,
        messages = stats.messages,
        "phase.finish"
    );
    Ok(stats)
}

/// Everything a supervised export-and-upload run owns.
pub struct ExportUploadJob {
    pub db: Arc<dyn UserDatabase>,
    pub remote: Arc<dyn RemoteBackupService>,
    pub exporter: MultiplatformExporter,
    pub password: Option<String>,
    pub output: PathBuf,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

/// Handle to a running export-and-upload task.
pub struct BackupTask {
    cancel: CancellationToken,
    done: Option<oneshot::Receiver<Result<ExportArtifact>>>,
    task: Option<JoinHandle<()>>,
}

impl BackupTask {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the task; a task that went away without reporting counts as cancelled.
    pub async fn wait(mut self) -> Result<ExportArtifact> {
        let result = match self.done.take() {
            Some(rx) => rx.await.unwrap_or(Err(Error::Cancelled)),
            None => Err(Error::Cancelled),
        };
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        result
    }
}

impl Drop for BackupTask {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.cancel.cancel();
            task.abort();
        }
    }
}

pub fn spawn_export_upload(job: ExportUploadJob) -> BackupTask {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let (done_tx, done_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let result = tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            r = run_export_upload(job, &token) => r,
        };
        match &result {
            Ok(artifact) => info!(
                event = "mp_export.upload_finished",
                size = artifact.size,
                "mp_export.upload_finished"
            ),
            Err(e) => error!(
                event = "mp_export.upload_failed",
                error = %e,
                "mp_export.upload_failed"
            ),
        }
        let _ = done_tx.send(result);
    });

    BackupTask {
        cancel,
        done: Some(done_rx),
        task: Some(task),
    }
}

async fn run_export_upload(job: ExportUploadJob, cancel: &CancellationToken) -> Result<ExportArtifact> {
    let ExportUploadJob {
        db,
        remote,
        exporter,
        password,
        output,
        progress,
    } = job;

    let exporter = Arc::new(exporter);
    export_multiplatform(
        db,
        exporter.clone(),
        ExportOptions {
            cancel: Some(cancel),
            progress: progress.as_deref(),
        },
    )
    .await?;

    let account = exporter.account().clone();
    let artifact = tokio::task::spawn_blocking(move || exporter.finalize(password.as_deref(), &output))
        .await
        .map_err(Error::join)??;

    check_cancel(Some(cancel))?;
    remote
        .upload_backup_artifact(&account, &artifact.path, artifact.size)
        .await?;
    if let Some(sink) = progress.as_deref() {
        sink.on_progress(TaskProgress {
            bytes_uploaded: Some(artifact.size),
            ..TaskProgress::phase("upload")
        });
    }
    Ok(artifact)
}
