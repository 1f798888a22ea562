use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use keepsake_core::model::{
    Conversation, ConversationKind, Direction, Message, MessageContent, QualifiedId, User,
};
use keepsake_core::progress::{ProgressSink, TaskProgress};
use keepsake_core::{
    ArchiveClass, BackupFormat, Error, ExportOptions, ExportUploadJob, InMemoryRemoteBackup,
    MultiplatformExporter, MultiplatformImporter, PassphraseCipher, SqliteUserDb, UserDatabase,
    classify, detect_format, export_multiplatform, restore_multiplatform, spawn_export_upload,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn account() -> QualifiedId {
    QualifiedId::new("alice", "example.com")
}

fn cipher() -> PassphraseCipher {
    PassphraseCipher::new(10_000).unwrap()
}

#[derive(Default)]
struct RecordingProgress {
    seen: Mutex<Vec<TaskProgress>>,
}

impl ProgressSink for RecordingProgress {
    fn on_progress(&self, progress: TaskProgress) {
        self.seen.lock().unwrap().push(progress);
    }
}

async fn seeded_db(path: &Path, messages: usize) -> SqliteUserDb {
    let db = SqliteUserDb::open(path).await.unwrap();
    let me = account();
    let bob = QualifiedId::new("bob", "example.com");

    db.insert_users(&[
        User {
            id: me.clone(),
            name: Some("Alice".to_string()),
            handle: Some("alice".to_string()),
        },
        User {
            id: bob.clone(),
            name: None,
            handle: Some("bob".to_string()),
        },
        User {
            id: QualifiedId::new("carol", "other.org"),
            name: Some("Carol".to_string()),
            handle: None,
        },
    ])
    .await
    .unwrap();

    let conversations: Vec<Conversation> = (0..3)
        .map(|i| Conversation {
            id: QualifiedId::new(format!("conv-{i}"), "example.com"),
            name: Some(format!("Conversation {i}")),
            kind: if i == 0 {
                ConversationKind::OneOnOne
            } else {
                ConversationKind::Group
            },
            last_modified_ms: i * 1_000,
        })
        .collect();
    db.insert_conversations(&conversations).await.unwrap();

    let messages: Vec<Message> = (0..messages)
        .map(|i| {
            let sender = if i % 2 == 0 { me.clone() } else { bob.clone() };
            Message {
                id: format!("m{i:04}"),
                conversation_id: conversations[i % 3].id.clone(),
                direction: Direction::for_sender(&sender, &me),
                sender_user_id: sender,
                sender_client_id: Some("client-a".to_string()),
                creation_ms: i as i64 * 10,
                last_edit_ms: None,
                content: if i % 5 == 0 {
                    MessageContent::Asset {
                        mime_type: "image/png".to_string(),
                        size: 1024,
                        name: Some(format!("img{i}.png")),
                        otr_key: "a2V5".to_string(),
                        sha256: "c2hh".to_string(),
                        asset_id: format!("asset-{i}"),
                    }
                } else {
                    MessageContent::Text {
                        text: format!("message {i}"),
                        quoted_message_id: None,
                    }
                },
            }
        })
        .collect();
    db.insert_messages(&messages).await.unwrap();
    db
}

fn exporter(temp: &TempDir, page_size: u32) -> Arc<MultiplatformExporter> {
    Arc::new(exporter_owned(temp, page_size))
}

fn exporter_owned(temp: &TempDir, page_size: u32) -> MultiplatformExporter {
    MultiplatformExporter::new(
        &account(),
        Some("client-a"),
        page_size,
        &temp.path().join("work"),
        cipher(),
    )
    .unwrap()
}

#[tokio::test]
async fn encrypted_paged_export_round_trips() {
    let temp = TempDir::new().unwrap();
    let src = Arc::new(seeded_db(&temp.path().join("src.db"), 23).await);

    let exp = exporter(&temp, 5);
    let progress = RecordingProgress::default();
    let stats = export_multiplatform(
        src.clone(),
        exp.clone(),
        ExportOptions {
            cancel: None,
            progress: Some(&progress),
        },
    )
    .await
    .unwrap();
    assert_eq!((stats.users, stats.conversations, stats.messages), (3, 3, 23));

    let seen = progress.seen.lock().unwrap().clone();
    let last = seen.last().unwrap();
    assert_eq!(last.pages_total, Some(5));
    assert_eq!(last.pages_done, Some(5));
    assert_eq!(last.fraction(), Some(1.0));

    let output = temp.path().join("backup.kbak");
    let artifact = exp.finalize(Some("s3cret"), &output).unwrap();
    assert!(artifact.encrypted);
    assert_eq!(classify(&output).unwrap(), ArchiveClass::Encrypted);
    assert_eq!(
        detect_format(&output).unwrap(),
        Some(BackupFormat::MultiplatformPaged)
    );

    let importer =
        MultiplatformImporter::new(&account(), &temp.path().join("work")).with_cipher(cipher());
    let mut import = importer.import_from_file(&output, Some("s3cret")).unwrap();
    assert_eq!(import.messages.remaining_pages(), 5);
    assert_eq!(import.metadata.client_id.as_deref(), Some("client-a"));

    let dst = SqliteUserDb::open(&temp.path().join("dst.db")).await.unwrap();
    let restored = restore_multiplatform(&mut import, &dst).await.unwrap();
    assert_eq!(restored.users, 3);
    assert_eq!(restored.conversations, 3);
    assert_eq!(restored.messages, 23);

    assert_eq!(
        dst.users_page(0, 100).await.unwrap(),
        src.users_page(0, 100).await.unwrap()
    );
    assert_eq!(
        dst.conversations_page(0, 100).await.unwrap(),
        src.conversations_page(0, 100).await.unwrap()
    );
    assert_eq!(
        dst.messages_page(0, 100).await.unwrap(),
        src.messages_page(0, 100).await.unwrap()
    );
}

#[tokio::test]
async fn encrypted_import_failures_are_distinct() {
    let temp = TempDir::new().unwrap();
    let src = Arc::new(seeded_db(&temp.path().join("src.db"), 4).await);
    let exp = exporter(&temp, 10);
    export_multiplatform(src, exp.clone(), ExportOptions::default())
        .await
        .unwrap();
    let output = temp.path().join("backup.kbak");
    exp.finalize(Some("s3cret"), &output).unwrap();

    let work = temp.path().join("work");
    let importer = MultiplatformImporter::new(&account(), &work).with_cipher(cipher());
    assert!(matches!(
        importer.import_from_file(&output, None).err().unwrap(),
        Error::InvalidPassword
    ));
    assert!(matches!(
        importer.import_from_file(&output, Some("nope")).err().unwrap(),
        Error::Decryption { .. }
    ));

    let other = MultiplatformImporter::new(&QualifiedId::new("bob", "example.com"), &work)
        .with_cipher(cipher());
    assert!(matches!(
        other.import_from_file(&output, Some("s3cret")).err().unwrap(),
        Error::InvalidUserId
    ));
}

#[tokio::test]
async fn plain_export_direction_follows_the_restoring_account() {
    let temp = TempDir::new().unwrap();
    let src = Arc::new(seeded_db(&temp.path().join("src.db"), 2).await);
    let exp = exporter(&temp, 10);
    export_multiplatform(src, exp.clone(), ExportOptions::default())
        .await
        .unwrap();
    let output = temp.path().join("plain.zip");
    let artifact = exp.finalize(None, &output).unwrap();
    assert!(!artifact.encrypted);
    assert_eq!(classify(&output).unwrap(), ArchiveClass::Unencrypted);

    let importer = MultiplatformImporter::new(&account(), &temp.path().join("work"));
    let mut import = importer.import_from_file(&output, None).unwrap();
    let work_dir = import.work_dir().to_path_buf();
    let messages = import.messages.next_page().unwrap();
    assert_eq!(messages[0].direction, Direction::Outgoing);
    assert_eq!(messages[1].direction, Direction::Incoming);
    drop(import);
    assert!(!work_dir.exists());
}

#[tokio::test]
async fn empty_database_round_trips_unencrypted() {
    let temp = TempDir::new().unwrap();
    let src = Arc::new(SqliteUserDb::open(&temp.path().join("empty.db")).await.unwrap());
    let exp = exporter(&temp, 10);
    let stats = export_multiplatform(src, exp.clone(), ExportOptions::default())
        .await
        .unwrap();
    assert_eq!((stats.users, stats.conversations, stats.messages), (0, 0, 0));

    let output = temp.path().join("empty.zip");
    let artifact = exp.finalize(None, &output).unwrap();
    assert!(!artifact.encrypted);
    assert_eq!(classify(&output).unwrap(), ArchiveClass::Unencrypted);
    assert_eq!(
        detect_format(&output).unwrap(),
        Some(BackupFormat::MultiplatformPaged)
    );

    let importer = MultiplatformImporter::new(&account(), &temp.path().join("work"));
    let mut import = importer.import_from_file(&output, None).unwrap();
    let dst = SqliteUserDb::open(&temp.path().join("dst.db")).await.unwrap();
    let restored = restore_multiplatform(&mut import, &dst).await.unwrap();
    assert_eq!(
        (restored.users, restored.conversations, restored.messages),
        (0, 0, 0)
    );
    assert_eq!(dst.count_messages().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn producers_fill_every_kind_on_a_threaded_runtime() {
    let temp = TempDir::new().unwrap();
    let src = Arc::new(seeded_db(&temp.path().join("src.db"), 250).await);
    let exp = exporter(&temp, 7);
    let stats = export_multiplatform(src, exp.clone(), ExportOptions::default())
        .await
        .unwrap();
    assert_eq!((stats.users, stats.conversations, stats.messages), (3, 3, 250));

    let output = temp.path().join("threaded.zip");
    exp.finalize(None, &output).unwrap();
    let importer = MultiplatformImporter::new(&account(), &temp.path().join("work"));
    let import = importer.import_from_file(&output, None).unwrap();
    assert_eq!(import.users.remaining_pages(), 1);
    assert_eq!(import.conversations.remaining_pages(), 1);
    assert_eq!(import.messages.remaining_pages(), 36);
}

#[tokio::test]
async fn cancelled_token_stops_the_producers() {
    let temp = TempDir::new().unwrap();
    let src = Arc::new(seeded_db(&temp.path().join("src.db"), 30).await);
    let exp = exporter(&temp, 5);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = export_multiplatform(
        src,
        exp,
        ExportOptions {
            cancel: Some(&cancel),
            progress: None,
        },
    )
    .await;
    assert!(matches!(result, Err(Error::Cancelled)));
}

fn upload_job(
    db: Arc<SqliteUserDb>,
    remote: Arc<InMemoryRemoteBackup>,
    exp: MultiplatformExporter,
    output: PathBuf,
) -> ExportUploadJob {
    ExportUploadJob {
        db,
        remote,
        exporter: exp,
        password: Some("s3cret".to_string()),
        output,
        progress: None,
    }
}

#[tokio::test]
async fn supervised_export_uploads_the_artifact() {
    let temp = TempDir::new().unwrap();
    let db = Arc::new(seeded_db(&temp.path().join("src.db"), 12).await);
    let remote = Arc::new(InMemoryRemoteBackup::new());
    let output = temp.path().join("upload.kbak");

    let task = spawn_export_upload(upload_job(
        db,
        remote.clone(),
        exporter_owned(&temp, 4),
        output.clone(),
    ));
    let artifact = task.wait().await.unwrap();

    assert_eq!(remote.artifact_uploads.load(Ordering::Relaxed), 1);
    let stored = remote.artifact(&account()).await.unwrap();
    assert_eq!(stored.len() as u64, artifact.size);
    assert_eq!(stored, std::fs::read(&output).unwrap());
}

#[tokio::test]
async fn cancelled_export_never_uploads() {
    let temp = TempDir::new().unwrap();
    let db = Arc::new(seeded_db(&temp.path().join("src.db"), 12).await);
    let remote = Arc::new(InMemoryRemoteBackup::new());

    let task = spawn_export_upload(upload_job(
        db,
        remote.clone(),
        exporter_owned(&temp, 4),
        temp.path().join("never.kbak"),
    ));
    task.cancel();
    assert!(matches!(task.wait().await, Err(Error::Cancelled)));
    assert_eq!(remote.calls(), 0);
}
