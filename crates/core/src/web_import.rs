use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::SlowSyncRecovery;
use crate::json_records::JsonRecords;
use crate::metadata::{
    BackupMetadata, WEB_CONVERSATIONS_FILE_NAME, WEB_EVENTS_FILE_NAME, WEB_MAX_FORMAT_VERSION,
    WEB_MIN_FORMAT_VERSION,
};
use crate::model::{Conversation, ConversationKind, Direction, Message, MessageContent, QualifiedId};
use crate::persistence::UserDatabase;
use crate::{Error, Result};

pub const WEB_BATCH_SIZE: usize = 1000;

const EVENT_TEXT: &str = "conversation.message-add";
const EVENT_ASSET: &str = "conversation.asset-add";
const EVENT_KNOCK: &str = "conversation.knock";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WebImportReport {
    pub conversations_imported: u64,
    pub messages_imported: u64,
    pub records_skipped: u64,
}

#[derive(Debug, Deserialize)]
struct WebQualifiedId {
    id: String,
    domain: String,
}

impl From<WebQualifiedId> for QualifiedId {
    fn from(q: WebQualifiedId) -> Self {
        QualifiedId::new(q.id, q.domain)
    }
}

#[derive(Debug, Deserialize)]
struct WebEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    time: String,
    #[serde(default)]
    conversation: Option<String>,
    #[serde(default)]
    qualified_conversation: Option<WebQualifiedId>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    qualified_from: Option<WebQualifiedId>,
    #[serde(default)]
    from_client_id: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WebConversation {
    id: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: i64,
    #[serde(default)]
    last_event_timestamp: Option<i64>,
}

fn web_conversation_kind(kind: i64) -> Option<ConversationKind> {
    match kind {
        0 => Some(ConversationKind::Group),
        1 => Some(ConversationKind::SelfConversation),
        2 => Some(ConversationKind::OneOnOne),
        _ => None,
    }
}

fn convert_conversation(c: WebConversation, self_domain: &str) -> Option<Conversation> {
    let kind = web_conversation_kind(c.kind)?;
    let domain = c
        .domain
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| self_domain.to_string());
    Some(Conversation {
        id: QualifiedId::new(c.id, domain),
        name: c.name,
        kind,
        last_modified_ms: c.last_event_timestamp.unwrap_or(0),
    })
}

fn str_field<'a>(data: &'a serde_json::Value, name: &str) -> Option<&'a str> {
    data.get(name).and_then(|v| v.as_str())
}

/// Key material is a string in newer exports and a byte array or index map in older ones.
fn bytes_field(data: &serde_json::Value, name: &str) -> Option<String> {
    let value = data.get(name)?;
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    let bytes: Option<Vec<u8>> = match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect(),
        serde_json::Value::Object(map) => {
            let mut indexed: Vec<(usize, u8)> = Vec::with_capacity(map.len());
            for (k, v) in map {
                let idx = k.parse().ok()?;
                let byte = v.as_u64().and_then(|n| u8::try_from(n).ok())?;
                indexed.push((idx, byte));
            }
            indexed.sort_unstable_by_key(|(i, _)| *i);
            Some(indexed.into_iter().map(|(_, b)| b).collect())
        }
        _ => None,
    };
    bytes.map(|b| base64::engine::general_purpose::STANDARD.encode(b))
}

fn event_content(kind: &str, data: &serde_json::Value) -> Result<Option<MessageContent>> {
    let missing = |field: &str| Error::incompatible(format!("{kind} event without {field}"));
    let content = match kind {
        EVENT_TEXT => {
            let text = str_field(data, "content")
                .or_else(|| str_field(data, "text"))
                .ok_or_else(|| missing("content"))?;
            MessageContent::Text {
                text: text.to_string(),
                quoted_message_id: data
                    .get("quote")
                    .and_then(|q| str_field(q, "message_id"))
                    .map(str::to_string),
            }
        }
        EVENT_ASSET => MessageContent::Asset {
            mime_type: str_field(data, "content_type")
                .ok_or_else(|| missing("content_type"))?
                .to_string(),
            size: data
                .get("content_length")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            name: data
                .get("info")
                .and_then(|i| str_field(i, "name"))
                .map(str::to_string),
            otr_key: bytes_field(data, "otr_key").ok_or_else(|| missing("otr_key"))?,
            sha256: bytes_field(data, "sha256").ok_or_else(|| missing("sha256"))?,
            asset_id: str_field(data, "key")
                .ok_or_else(|| missing("key"))?
                .to_string(),
        },
        EVENT_KNOCK => MessageContent::Knock { hot_knock: false },
        _ => return Ok(None),
    };
    Ok(Some(content))
}

fn convert_event(event: WebEvent, account: &QualifiedId) -> Result<Option<Message>> {
    let Some(content) = event_content(&event.kind, &event.data)? else {
        return Ok(None);
    };

    let conversation_id = match (event.qualified_conversation, event.conversation) {
        (Some(q), _) => q.into(),
        (None, Some(id)) => QualifiedId::new(id, account.domain.clone()),
        (None, None) => return Err(Error::incompatible("event without conversation")),
    };
    let sender = match (event.qualified_from, event.from) {
        (Some(q), _) => q.into(),
        (None, Some(id)) => QualifiedId::new(id, account.domain.clone()),
        (None, None) => return Err(Error::incompatible("event without sender")),
    };
    let creation_ms = chrono::DateTime::parse_from_rfc3339(&event.time)
        .map_err(|e| Error::incompatible(format!("event time {:?}: {e}", event.time)))?
        .timestamp_millis();

    Ok(Some(Message {
        id: event.id,
        direction: Direction::for_sender(&sender, account),
        conversation_id,
        sender_user_id: sender,
        sender_client_id: event.from_client_id,
        creation_ms,
        last_edit_ms: None,
        content,
    }))
}

fn open_records<T: DeserializeOwned>(
    path: &Path,
) -> Result<JsonRecords<BufReader<File>, T>> {
    let file = File::open(path).map_err(|e| {
        error!(
            event = "io.web_import.open_failed",
            path = %path.display(),
            error = %e,
            "io.web_import.open_failed"
        );
        Error::backup_io(format!("{} not readable: {e}", path.display()))
    })?;
    Ok(JsonRecords::new(BufReader::new(file)))
}

/// Decodes the records of `path` on the blocking pool and hands converted rows
/// over in batches of `batch_size`. The task resolves to the number of records
/// that were skipped. Dropping the receiver stops the reader at its next batch.
fn spawn_record_reader<R, T, C>(
    path: PathBuf,
    kind: &'static str,
    batch_size: usize,
    convert: C,
) -> (mpsc::Receiver<Vec<T>>, JoinHandle<Result<u64>>)
where
    R: DeserializeOwned + 'static,
    T: Send + 'static,
    C: Fn(R) -> Result<Option<T>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(2);
    let reader = tokio::task::spawn_blocking(move || {
        let mut skipped = 0u64;
        let mut batch = Vec::with_capacity(batch_size);
        for (index, record) in open_records::<R>(&path)?.enumerate() {
            match record.and_then(&convert) {
                Ok(Some(row)) => batch.push(row),
                Ok(None) => {}
                Err(e) => {
                    skipped += 1;
                    warn!(
                        event = "web_import.record_skipped",
                        kind,
                        index,
                        error = %e,
                        "web_import.record_skipped"
                    );
                }
            }
            if batch.len() >= batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                if tx.blocking_send(full).is_err() {
                    return Ok(skipped);
                }
            }
        }
        if !batch.is_empty() {
            let _ = tx.blocking_send(batch);
        }
        Ok(skipped)
    });
    (rx, reader)
}

/// Refuses web exports outside the supported format range before any data is read.
pub fn check_web_version(metadata: &BackupMetadata) -> Result<u32> {
    match metadata.format_version() {
        Some(v) if (WEB_MIN_FORMAT_VERSION..=WEB_MAX_FORMAT_VERSION).contains(&v) => Ok(v),
        other => {
            warn!(
                event = "web_import.version_refused",
                version = %metadata.version,
                "web_import.version_refused"
            );
            Err(Error::incompatible(format!(
                "web backup version {} is not supported (expected {WEB_MIN_FORMAT_VERSION}..={WEB_MAX_FORMAT_VERSION})",
                other.map_or_else(|| metadata.version.clone(), |v| v.to_string())
            )))
        }
    }
}

/// Imports an extracted web export rooted at `root` into the live database.
pub async fn import_web_backup(
    db: &dyn UserDatabase,
    root: &Path,
    metadata: &BackupMetadata,
    account: &QualifiedId,
    recovery: &dyn SlowSyncRecovery,
    batch_size: usize,
) -> Result<WebImportReport> {
    let version = check_web_version(metadata)?;
    let batch_size = batch_size.max(1);

    let events_path = root.join(WEB_EVENTS_FILE_NAME);
    if !events_path.is_file() {
        error!(
            event = "web_import.events_missing",
            root = %root.display(),
            "web_import.events_missing"
        );
        return Err(Error::backup_io("no valid content found"));
    }

    info!(event = "web_import.start", version, "web_import.start");
    let mut report = WebImportReport::default();

    let conversations_path = root.join(WEB_CONVERSATIONS_FILE_NAME);
    if conversations_path.is_file() {
        let domain = account.domain.clone();
        let (mut batches, reader) = spawn_record_reader(
            conversations_path,
            "conversation",
            batch_size,
            move |c: WebConversation| Ok(convert_conversation(c, &domain)),
        );
        while let Some(batch) = batches.recv().await {
            report.conversations_imported += db.insert_conversations(&batch).await?;
        }
        report.records_skipped += reader.await.map_err(Error::join)??;
    } else {
        debug!(event = "web_import.conversations_absent", "web_import.conversations_absent");
    }

    let owner = account.clone();
    let (mut batches, reader) = spawn_record_reader(
        events_path,
        "event",
        batch_size,
        move |event: WebEvent| convert_event(event, &owner),
    );
    while let Some(batch) = batches.recv().await {
        report.messages_imported += flush_messages(db, &batch).await?;
    }
    report.records_skipped += reader.await.map_err(Error::join)??;

    recovery.restart_slow_sync_for_recovery()?;

    info!(
        event = "web_import.finish",
        conversations = report.conversations_imported,
        messages = report.messages_imported,
        skipped = report.records_skipped,
        "web_import.finish"
    );
    Ok(report)
}

async fn flush_messages(db: &dyn UserDatabase, batch: &[Message]) -> Result<u64> {
    let inserted = db.insert_messages(batch).await.map_err(|e| {
        error!(
            event = "web_import.batch_failed",
            size = batch.len(),
            error = %e,
            "web_import.batch_failed"
        );
        e
    })?;
    debug!(
        event = "web_import.batch_flushed",
        size = batch.len(),
        inserted,
        "web_import.batch_flushed"
    );
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> QualifiedId {
        QualifiedId::new("some-user-id", "some-domain")
    }

    #[test]
    fn text_event_converts_with_fallback_sender_domain() {
        let event: WebEvent = serde_json::from_str(
            r#"{
                "conversation": "conversation-id",
                "from": "some-user-id",
                "from_client_id": "some-client-id",
                "id": "message-id",
                "qualified_conversation": {"domain": "wire.com", "id": "conversation-id"},
                "time": "2023-02-25T14:17:27.364Z",
                "data": {"content": "hey", "mentions": []},
                "type": "conversation.message-add"
            }"#,
        )
        .unwrap();

        let message = convert_event(event, &account()).unwrap().unwrap();
        assert_eq!(message.conversation_id, QualifiedId::new("conversation-id", "wire.com"));
        assert_eq!(message.sender_user_id, account());
        assert_eq!(message.direction, Direction::Outgoing);
        assert_eq!(message.creation_ms, 1_677_334_647_364);
        assert_eq!(
            message.content,
            MessageContent::Text {
                text: "hey".to_string(),
                quoted_message_id: None
            }
        );
    }

    #[test]
    fn unsupported_events_are_ignored_and_bad_ones_fail() {
        let unsupported: WebEvent = serde_json::from_str(
            r#"{"id":"x","type":"conversation.member-join","time":"2023-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(convert_event(unsupported, &account()).unwrap().is_none());

        let bad_time: WebEvent = serde_json::from_str(
            r#"{"id":"x","type":"conversation.knock","time":"yesterday","conversation":"c","from":"u"}"#,
        )
        .unwrap();
        assert!(convert_event(bad_time, &account()).is_err());
    }

    #[test]
    fn asset_key_material_accepts_byte_maps() {
        let data = serde_json::json!({
            "content_type": "image/png",
            "content_length": 3,
            "otr_key": {"1": 2, "0": 1},
            "sha256": [3, 4],
            "key": "asset-1"
        });
        let content = event_content(EVENT_ASSET, &data).unwrap().unwrap();
        let MessageContent::Asset { otr_key, sha256, size, .. } = content else {
            panic!("expected asset");
        };
        assert_eq!(otr_key, base64::engine::general_purpose::STANDARD.encode([1u8, 2]));
        assert_eq!(sha256, base64::engine::general_purpose::STANDARD.encode([3u8, 4]));
        assert_eq!(size, 3);
    }

    #[test]
    fn conversation_types_map_and_domain_defaults() {
        let c: WebConversation =
            serde_json::from_str(r##"{"id":"c1","name":"#SPAM 4","type":0}"##).unwrap();
        let conv = convert_conversation(c, "some-domain").unwrap();
        assert_eq!(conv.id, QualifiedId::new("c1", "some-domain"));
        assert_eq!(conv.kind, ConversationKind::Group);
        assert_eq!(conv.last_modified_ms, 0);

        let pending: WebConversation = serde_json::from_str(r#"{"id":"c2","type":3}"#).unwrap();
        assert!(convert_conversation(pending, "d").is_none());
    }

    #[test]
    fn version_gate_is_closed_range() {
        let mut m = BackupMetadata::new("Web", "19", &account(), None);
        for (v, ok) in [("18", false), ("19", true), ("20", true), ("21", true), ("22", false)] {
            m.version = v.to_string();
            assert_eq!(check_web_version(&m).is_ok(), ok, "version {v}");
        }
        m.version = "abc".to_string();
        assert!(matches!(
            check_web_version(&m),
            Err(Error::IncompatibleBackup { .. })
        ));
    }
}
