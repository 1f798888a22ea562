use std::collections::BTreeSet;

use tracing::{debug, error, info, warn};

use crate::model::{BackupMessage, Message, QualifiedId};
use crate::persistence::UserDatabase;
use crate::remote::{MESSAGE_PAGE_SIZE, MessageQuery, RemoteBackupService, SortOrder};
use crate::Result;

/// Pulls every remotely stored message newer than the local history, oldest first,
/// and inserts the ones not already present. Returns how many were inserted.
///
/// A failing page ends the run with that error; pages persisted before it stay.
pub async fn restore_remote_messages(
    remote: &dyn RemoteBackupService,
    db: &dyn UserDatabase,
    account: &QualifiedId,
) -> Result<u64> {
    let mut query = MessageQuery {
        since: None,
        order: SortOrder::Asc,
        size: MESSAGE_PAGE_SIZE,
        ..MessageQuery::for_user(account)
    };
    let mut restored = 0u64;
    let mut pages = 0u64;

    loop {
        let page = remote.fetch_messages(&query).await.map_err(|e| {
            error!(
                event = "message_restore.page_failed",
                provider = remote.provider(),
                since = ?query.since,
                restored,
                error = %e,
                "message_restore.page_failed"
            );
            e
        })?;
        pages += 1;

        let Some(last) = page.results.last() else {
            break;
        };
        let next_since = last.timestamp;

        let mut fresh: Vec<Message> = Vec::with_capacity(page.results.len());
        for result in &page.results {
            let parsed = match serde_json::from_value::<BackupMessage>(result.payload.clone()) {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        event = "message_restore.payload_skipped",
                        timestamp = result.timestamp,
                        error = %e,
                        "message_restore.payload_skipped"
                    );
                    continue;
                }
            };
            if db.message_exists(&parsed.conversation_id, &parsed.id).await? {
                continue;
            }
            fresh.push(parsed.into_message(account));
        }

        if !fresh.is_empty() {
            let inserted = db.insert_messages(&fresh).await?;
            let conversations: Vec<QualifiedId> = fresh
                .iter()
                .map(|m| m.conversation_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            db.update_conversations_last_modified(&conversations).await?;
            restored += inserted;
            debug!(
                event = "message_restore.page_applied",
                page = pages,
                inserted,
                conversations = conversations.len(),
                "message_restore.page_applied"
            );
        }

        if !page.has_more {
            break;
        }
        query.since = Some(next_since);
    }

    info!(
        event = "message_restore.finished",
        pages,
        restored,
        "message_restore.finished"
    );
    Ok(restored)
}
