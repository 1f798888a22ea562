use std::path::{Path, PathBuf};

use keepsake_core::archive::{ArchiveEntry, compress_to_file};
use keepsake_core::client::RecoveryMarkerFile;
use keepsake_core::model::{ConversationKind, QualifiedId};
use keepsake_core::{
    ArchiveClass, BackupFormat, BackupMetadata, Error, RestoreContext, RestoreFailure,
    RestoreOutcome, RestoreReport, SqliteUserDb, UserDatabase, classify, detect_format,
    import_web_backup, restore_backup,
};
use keepsake_core::web_import::{WEB_BATCH_SIZE, WebImportReport};
use tempfile::TempDir;

fn account() -> QualifiedId {
    QualifiedId::new("some-user-id", "some-domain")
}

fn text_event(i: usize) -> serde_json::Value {
    serde_json::json!({
        "conversation": "conversation-id",
        "from": if i % 2 == 0 { "some-user-id" } else { "peer-id" },
        "from_client_id": "some-client-id",
        "id": format!("message-{i}"),
        "qualified_conversation": {"domain": "wire.com", "id": "conversation-id"},
        "status": 2,
        "time": "2023-02-25T14:17:27.364Z",
        "data": {"content": format!("hey {i}"), "mentions": [], "previews": []},
        "type": "conversation.message-add",
        "category": 16,
        "version": 2
    })
}

fn conversations_json() -> String {
    serde_json::json!([
        {
            "domain": "wire.com",
            "id": "conversation-id",
            "name": "#SPAM 4",
            "type": 0,
            "last_event_timestamp": 1677334658266i64,
            "others": ["649b6774-81aa-4e4d-90e5-26e7cadd3ff1"]
        },
        {"id": "pending", "type": 3}
    ])
    .to_string()
}

fn web_archive(dir: &Path, version: &str, events: &[serde_json::Value]) -> PathBuf {
    let events = serde_json::to_string_pretty(&serde_json::Value::Array(events.to_vec())).unwrap();
    web_archive_text(dir, version, &events)
}

fn web_archive_text(dir: &Path, version: &str, events_json: &str) -> PathBuf {
    let metadata = BackupMetadata::new("Web", version, &account(), Some("dummy-client-id"));
    let mut web_metadata = serde_json::to_value(&metadata).unwrap();
    web_metadata["user_id"] = serde_json::Value::String(account().id);

    let path = dir.join(format!("web-{version}.zip"));
    compress_to_file(
        &[
            ArchiveEntry::bytes("export.json", web_metadata.to_string().into_bytes()),
            ArchiveEntry::bytes("events.json", events_json.as_bytes().to_vec()),
            ArchiveEntry::bytes("conversations.json", conversations_json().into_bytes()),
        ],
        &path,
    )
    .unwrap();
    path
}

async fn restore_with_defaults(
    temp: &TempDir,
    archive: &Path,
    db: &SqliteUserDb,
) -> WebImportReport {
    let me = account();
    let recovery = RecoveryMarkerFile::new(temp.path().join("slow-sync.pending"));
    let work = temp.path().join("work");
    let ctx = RestoreContext::new(&me, &work, &recovery);
    assert_eq!(ctx.web_batch_size, WEB_BATCH_SIZE);
    match restore_backup(db, archive, None, &ctx).await.unwrap() {
        RestoreReport::Web(report) => report,
        other => panic!("expected a web report, got {other:?}"),
    }
}

async fn restore(
    temp: &TempDir,
    archive: &Path,
    db: &SqliteUserDb,
) -> RestoreOutcome<RestoreReport> {
    let me = account();
    let recovery = RecoveryMarkerFile::new(temp.path().join("slow-sync.pending"));
    let work = temp.path().join("work");
    let mut ctx = RestoreContext::new(&me, &work, &recovery);
    ctx.web_batch_size = 100;
    restore_backup(db, archive, None, &ctx).await
}

#[tokio::test]
async fn version_gate_accepts_only_19_to_21() {
    let temp = TempDir::new().unwrap();
    let events = vec![text_event(0)];

    for version in ["18", "22", "7", "not-a-number"] {
        let db = SqliteUserDb::open(&temp.path().join(format!("db-{version}.db")))
            .await
            .unwrap();
        let archive = web_archive(temp.path(), version, &events);
        let err = restore(&temp, &archive, &db).await.unwrap_err();
        assert!(
            matches!(err, RestoreFailure::IncompatibleBackup(_)),
            "version {version}: {err:?}"
        );
        assert_eq!(db.count_conversations().await.unwrap(), 0);
        assert_eq!(db.count_messages().await.unwrap(), 0);
    }

    for version in ["19", "20", "21"] {
        let db = SqliteUserDb::open(&temp.path().join(format!("db-{version}.db")))
            .await
            .unwrap();
        let archive = web_archive(temp.path(), version, &events);
        assert_eq!(classify(&archive).unwrap(), ArchiveClass::Unencrypted);
        assert_eq!(
            detect_format(&archive).unwrap(),
            Some(BackupFormat::WebCompatible)
        );
        let report = restore(&temp, &archive, &db).await.unwrap();
        let RestoreReport::Web(report) = report else {
            panic!("expected a web report");
        };
        assert_eq!(report.messages_imported, 1, "version {version}");
        assert_eq!(report.conversations_imported, 1);
    }
}

#[tokio::test]
async fn one_malformed_record_among_a_thousand_is_skipped() {
    let temp = TempDir::new().unwrap();
    let mut events: Vec<serde_json::Value> = (0..999).map(text_event).collect();
    events.insert(
        500,
        serde_json::json!({"id": "broken", "type": "conversation.message-add"}),
    );
    let archive = web_archive(temp.path(), "20", &events);

    let db = SqliteUserDb::open(&temp.path().join("user.db")).await.unwrap();
    let report = restore(&temp, &archive, &db).await.unwrap();
    let RestoreReport::Web(report) = report else {
        panic!("expected a web report");
    };
    assert_eq!(report.messages_imported, 999);
    assert_eq!(report.records_skipped, 1);
    assert_eq!(db.count_messages().await.unwrap(), 999);

    let conversations = db.conversations_page(0, 10).await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].id, QualifiedId::new("conversation-id", "wire.com"));
    assert_eq!(conversations[0].kind, ConversationKind::Group);
    assert_eq!(conversations[0].last_modified_ms, 1_677_334_658_266);

    let marker = RecoveryMarkerFile::new(temp.path().join("slow-sync.pending"));
    assert!(marker.is_pending(), "slow sync recovery must be requested");
}

#[tokio::test]
async fn broken_json_element_is_skipped_at_the_default_batch_size() {
    let temp = TempDir::new().unwrap();
    let mut elements: Vec<String> = (0..999).map(|i| text_event(i).to_string()).collect();
    elements.insert(500, r#"{"id": }"#.to_string());
    let archive = web_archive_text(temp.path(), "21", &format!("[{}]", elements.join(",\n")));

    let db = SqliteUserDb::open(&temp.path().join("user.db")).await.unwrap();
    let report = restore_with_defaults(&temp, &archive, &db).await;
    assert_eq!(report.messages_imported, 999);
    assert_eq!(report.records_skipped, 1);
    assert_eq!(db.count_messages().await.unwrap(), 999);
}

#[tokio::test]
async fn rows_past_a_full_default_batch_are_flushed() {
    let temp = TempDir::new().unwrap();
    let events: Vec<serde_json::Value> = (0..WEB_BATCH_SIZE + 1).map(text_event).collect();
    let archive = web_archive(temp.path(), "19", &events);

    let db = SqliteUserDb::open(&temp.path().join("user.db")).await.unwrap();
    let report = restore_with_defaults(&temp, &archive, &db).await;
    assert_eq!(report.messages_imported, WEB_BATCH_SIZE as u64 + 1);
    assert_eq!(report.records_skipped, 0);
    assert_eq!(db.count_messages().await.unwrap(), WEB_BATCH_SIZE as u64 + 1);
}

#[tokio::test]
async fn missing_events_file_is_an_io_failure() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("extracted");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("conversations.json"), conversations_json()).unwrap();

    let db = SqliteUserDb::open(&temp.path().join("user.db")).await.unwrap();
    let metadata = BackupMetadata::new("Web", "19", &account(), None);
    let recovery = RecoveryMarkerFile::new(temp.path().join("slow-sync.pending"));

    let err = import_web_backup(&db, &root, &metadata, &account(), &recovery, 1000)
        .await
        .unwrap_err();
    match err {
        Error::BackupIo { reason } => assert_eq!(reason, "no valid content found"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!recovery.is_pending());
}

#[tokio::test]
async fn web_backup_of_another_user_is_refused() {
    let temp = TempDir::new().unwrap();
    let archive = web_archive(temp.path(), "19", &[text_event(0)]);

    let db = SqliteUserDb::open(&temp.path().join("user.db")).await.unwrap();
    let stranger = QualifiedId::new("stranger", "some-domain");
    let recovery = RecoveryMarkerFile::new(temp.path().join("slow-sync.pending"));
    let work = temp.path().join("work");
    let ctx = RestoreContext::new(&stranger, &work, &recovery);
    assert_eq!(
        restore_backup(&db, &archive, None, &ctx).await.unwrap_err(),
        RestoreFailure::InvalidUserId
    );
}
