use std::sync::atomic::Ordering;

use keepsake_core::model::{Conversation, ConversationKind, Direction, QualifiedId};
use keepsake_core::{InMemoryRemoteBackup, SqliteUserDb, UserDatabase, restore_remote_messages};
use tempfile::TempDir;

fn account() -> QualifiedId {
    QualifiedId::new("alice", "example.com")
}

fn payload(id: &str, conversation: &str, sender: &str, at: i64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "conversationId": {"id": conversation, "domain": "example.com"},
        "senderUserId": {"id": sender, "domain": "example.com"},
        "senderClientId": "client-b",
        "creationDate": at,
        "content": {"type": "text", "text": format!("text of {id}")}
    })
}

async fn seeded_remote() -> InMemoryRemoteBackup {
    let remote = InMemoryRemoteBackup::new();
    for i in 0..130i64 {
        let conversation = if i % 2 == 0 { "conv-a" } else { "conv-b" };
        let sender = if i % 3 == 0 { "alice" } else { "bob" };
        remote
            .push_message(
                payload(&format!("m{i}"), conversation, sender, 1_000 + i),
                1_000 + i,
            )
            .await;
    }
    remote
}

async fn db_with_conversations(temp: &TempDir) -> SqliteUserDb {
    let db = SqliteUserDb::open(&temp.path().join("user.db")).await.unwrap();
    db.insert_conversations(&[
        Conversation {
            id: QualifiedId::new("conv-a", "example.com"),
            name: Some("A".to_string()),
            kind: ConversationKind::Group,
            last_modified_ms: 0,
        },
        Conversation {
            id: QualifiedId::new("conv-b", "example.com"),
            name: None,
            kind: ConversationKind::OneOnOne,
            last_modified_ms: 5_000,
        },
    ])
    .await
    .unwrap();
    db
}

#[tokio::test]
async fn restoring_twice_inserts_each_message_once() {
    let temp = TempDir::new().unwrap();
    let db = db_with_conversations(&temp).await;
    let remote = seeded_remote().await;

    let first = restore_remote_messages(&remote, &db, &account()).await.unwrap();
    assert_eq!(first, 130);
    assert_eq!(remote.message_fetches.load(Ordering::Relaxed), 2);
    assert_eq!(db.count_messages().await.unwrap(), 130);

    let second = restore_remote_messages(&remote, &db, &account()).await.unwrap();
    assert_eq!(second, 0);
    assert_eq!(db.count_messages().await.unwrap(), 130);
}

#[tokio::test]
async fn restored_messages_touch_their_conversations() {
    let temp = TempDir::new().unwrap();
    let db = db_with_conversations(&temp).await;
    let remote = seeded_remote().await;

    restore_remote_messages(&remote, &db, &account()).await.unwrap();

    let conversations = db.conversations_page(0, 10).await.unwrap();
    let a = conversations
        .iter()
        .find(|c| c.id.id == "conv-a")
        .unwrap();
    let b = conversations
        .iter()
        .find(|c| c.id.id == "conv-b")
        .unwrap();
    assert_eq!(a.last_modified_ms, 1_128);
    assert_eq!(b.last_modified_ms, 5_000, "last modified never moves backwards");

    let messages = db.messages_page(0, 200).await.unwrap();
    let own = messages.iter().find(|m| m.id == "m0").unwrap();
    let peer = messages.iter().find(|m| m.id == "m1").unwrap();
    assert_eq!(own.direction, Direction::Outgoing);
    assert_eq!(peer.direction, Direction::Incoming);
}
