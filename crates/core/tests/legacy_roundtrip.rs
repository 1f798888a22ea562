use keepsake_core::client::RecoveryMarkerFile;
use keepsake_core::model::{
    Call, Conversation, ConversationKind, Direction, Message, MessageContent, QualifiedId, User,
};
use keepsake_core::{
    ArchiveClass, BackupFormat, LegacyExportOptions, PassphraseCipher, RestoreContext,
    RestoreFailure, RestoreReport, SqliteUserDb, UserDatabase, classify, detect_format,
    export_legacy, restore_backup,
};
use tempfile::TempDir;

fn account() -> QualifiedId {
    QualifiedId::new("alice", "example.com")
}

fn cipher() -> PassphraseCipher {
    PassphraseCipher::new(10_000).unwrap()
}

async fn seeded_db(temp: &TempDir) -> SqliteUserDb {
    let db = SqliteUserDb::open(&temp.path().join("live.db")).await.unwrap();
    let me = account();
    let bob = QualifiedId::new("bob", "example.com");
    let conv = QualifiedId::new("conv-1", "example.com");

    db.insert_users(&[
        User {
            id: me.clone(),
            name: Some("Alice".to_string()),
            handle: Some("alice".to_string()),
        },
        User {
            id: bob.clone(),
            name: Some("Bob".to_string()),
            handle: None,
        },
    ])
    .await
    .unwrap();
    db.insert_conversations(&[Conversation {
        id: conv.clone(),
        name: Some("Team".to_string()),
        kind: ConversationKind::Group,
        last_modified_ms: 300,
    }])
    .await
    .unwrap();
    db.insert_messages(&[
        Message {
            id: "m1".to_string(),
            conversation_id: conv.clone(),
            sender_user_id: me.clone(),
            sender_client_id: Some("client-a".to_string()),
            creation_ms: 100,
            last_edit_ms: None,
            direction: Direction::Outgoing,
            content: MessageContent::Text {
                text: "hello".to_string(),
                quoted_message_id: None,
            },
        },
        Message {
            id: "m2".to_string(),
            conversation_id: conv.clone(),
            sender_user_id: bob.clone(),
            sender_client_id: None,
            creation_ms: 300,
            last_edit_ms: Some(310),
            direction: Direction::Incoming,
            content: MessageContent::Location {
                longitude: 13.4,
                latitude: 52.5,
                name: Some("Berlin".to_string()),
                zoom: Some(12),
            },
        },
    ])
    .await
    .unwrap();
    db.record_call(&Call {
        conversation_id: conv,
        caller_id: bob,
        status: "missed".to_string(),
        created_ms: 200,
    })
    .await
    .unwrap();
    db
}

async fn export(temp: &TempDir, db: &SqliteUserDb, password: Option<&str>) -> std::path::PathBuf {
    let output = temp.path().join("out").join("backup.zip");
    let me = account();
    let artifact = export_legacy(
        db,
        LegacyExportOptions {
            account: &me,
            client_id: Some("client-a"),
            work_root: &temp.path().join("work"),
            output: &output,
            password,
            cipher: cipher(),
        },
    )
    .await
    .unwrap();
    assert_eq!(artifact.encrypted, password.is_some());
    assert_eq!(artifact.size, std::fs::metadata(&output).unwrap().len());
    output
}

#[tokio::test]
async fn plain_export_restores_every_row() {
    let temp = TempDir::new().unwrap();
    let src = seeded_db(&temp).await;
    let archive = export(&temp, &src, None).await;

    assert_eq!(classify(&archive).unwrap(), ArchiveClass::Unencrypted);
    assert_eq!(
        detect_format(&archive).unwrap(),
        Some(BackupFormat::LegacySingleDb)
    );

    let dst = SqliteUserDb::open(&temp.path().join("restored.db")).await.unwrap();
    let me = account();
    let recovery = RecoveryMarkerFile::new(temp.path().join("slow-sync.pending"));
    let work = temp.path().join("work");
    let mut ctx = RestoreContext::new(&me, &work, &recovery);
    ctx.current_client_id = Some("client-a");
    ctx.cipher = cipher();

    let report = restore_backup(&dst, &archive, None, &ctx).await.unwrap();
    let RestoreReport::Legacy(stats) = report else {
        panic!("expected a legacy report");
    };
    assert_eq!(stats.users, 2);
    assert_eq!(stats.conversations, 1);
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.calls, 1);

    assert_eq!(
        dst.users_page(0, 10).await.unwrap(),
        src.users_page(0, 10).await.unwrap()
    );
    assert_eq!(
        dst.conversations_page(0, 10).await.unwrap(),
        src.conversations_page(0, 10).await.unwrap()
    );
    assert_eq!(
        dst.messages_page(0, 10).await.unwrap(),
        src.messages_page(0, 10).await.unwrap()
    );
    assert!(!recovery.is_pending());

    let again = restore_backup(&dst, &archive, None, &ctx).await.unwrap();
    assert_eq!(
        again,
        RestoreReport::Legacy(keepsake_core::ImportStats::default())
    );
}

#[tokio::test]
async fn encrypted_export_is_double_wrapped_and_bound_to_the_account() {
    let temp = TempDir::new().unwrap();
    let src = seeded_db(&temp).await;
    let archive = export(&temp, &src, Some("correct horse")).await;

    assert_eq!(classify(&archive).unwrap(), ArchiveClass::Encrypted);
    let names = keepsake_core::archive::entry_names(&archive).unwrap();
    assert_eq!(names, vec!["user-backup.cc20".to_string()]);

    let dst = SqliteUserDb::open(&temp.path().join("restored.db")).await.unwrap();
    let me = account();
    let recovery = RecoveryMarkerFile::new(temp.path().join("slow-sync.pending"));
    let work = temp.path().join("work");
    let mut ctx = RestoreContext::new(&me, &work, &recovery);
    ctx.cipher = cipher();

    assert_eq!(
        restore_backup(&dst, &archive, None, &ctx).await.unwrap_err(),
        RestoreFailure::InvalidPassword
    );
    assert!(matches!(
        restore_backup(&dst, &archive, Some("wrong"), &ctx)
            .await
            .unwrap_err(),
        RestoreFailure::DecryptionFailure(_)
    ));

    let mallory = QualifiedId::new("mallory", "example.com");
    let mut other_ctx = RestoreContext::new(&mallory, &work, &recovery);
    other_ctx.cipher = cipher();
    assert_eq!(
        restore_backup(&dst, &archive, Some("correct horse"), &other_ctx)
            .await
            .unwrap_err(),
        RestoreFailure::InvalidUserId
    );
    assert_eq!(dst.count_messages().await.unwrap(), 0);

    let report = restore_backup(&dst, &archive, Some("correct horse"), &ctx)
        .await
        .unwrap();
    let RestoreReport::Legacy(stats) = report else {
        panic!("expected a legacy report");
    };
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.calls, 0, "restoring client differs from the exporting one");
    assert_eq!(
        dst.messages_page(0, 10).await.unwrap(),
        src.messages_page(0, 10).await.unwrap()
    );

    let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("work"))
        .unwrap()
        .collect();
    assert!(leftovers.is_empty(), "temporary directories must be removed");
}

#[tokio::test]
async fn unencrypted_archive_of_another_user_is_refused() {
    let temp = TempDir::new().unwrap();
    let src = seeded_db(&temp).await;
    let archive = export(&temp, &src, None).await;

    let dst = SqliteUserDb::open(&temp.path().join("restored.db")).await.unwrap();
    let someone = QualifiedId::new("alice", "other.org");
    let recovery = RecoveryMarkerFile::new(temp.path().join("slow-sync.pending"));
    let work = temp.path().join("work");
    let ctx = RestoreContext::new(&someone, &work, &recovery);

    assert_eq!(
        restore_backup(&dst, &archive, None, &ctx).await.unwrap_err(),
        RestoreFailure::InvalidUserId
    );
}

#[tokio::test]
async fn garbage_file_is_incompatible() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("random.zip");
    std::fs::write(&path, b"PK but not really").unwrap();

    let dst = SqliteUserDb::open(&temp.path().join("restored.db")).await.unwrap();
    let me = account();
    let recovery = RecoveryMarkerFile::new(temp.path().join("slow-sync.pending"));
    let work = temp.path().join("work");
    let ctx = RestoreContext::new(&me, &work, &recovery);

    assert!(matches!(
        restore_backup(&dst, &path, None, &ctx).await.unwrap_err(),
        RestoreFailure::IncompatibleBackup(_)
    ));
}
