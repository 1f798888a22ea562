use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use serde::Serialize;

use crate::Result;
use crate::model::{Call, Conversation, Message, QualifiedId, User};

pub type DbFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Live user database as seen by the exporters and importers.
///
/// Inserts never overwrite: a row that already exists locally wins and the call
/// reports only the rows that were actually added.
pub trait UserDatabase: Send + Sync {
    fn users_page<'a>(&'a self, offset: u64, limit: u32) -> DbFuture<'a, Vec<User>>;

    fn conversations_page<'a>(&'a self, offset: u64, limit: u32)
    -> DbFuture<'a, Vec<Conversation>>;

    fn messages_page<'a>(&'a self, offset: u64, limit: u32) -> DbFuture<'a, Vec<Message>>;

    fn count_users<'a>(&'a self) -> DbFuture<'a, u64>;

    fn count_conversations<'a>(&'a self) -> DbFuture<'a, u64>;

    fn count_messages<'a>(&'a self) -> DbFuture<'a, u64>;

    fn insert_users<'a>(&'a self, users: &'a [User]) -> DbFuture<'a, u64>;

    fn insert_conversations<'a>(&'a self, conversations: &'a [Conversation]) -> DbFuture<'a, u64>;

    fn insert_messages<'a>(&'a self, messages: &'a [Message]) -> DbFuture<'a, u64>;

    fn message_exists<'a>(
        &'a self,
        conversation_id: &'a QualifiedId,
        message_id: &'a str,
    ) -> DbFuture<'a, bool>;

    /// Recomputes `last_modified_ms` of each conversation from its newest message
    /// whose content type bumps the conversation.
    fn update_conversations_last_modified<'a>(
        &'a self,
        conversation_ids: &'a [QualifiedId],
    ) -> DbFuture<'a, u64>;

    fn record_call<'a>(&'a self, call: &'a Call) -> DbFuture<'a, ()>;

    fn count_calls<'a>(&'a self) -> DbFuture<'a, u64>;
}

pub trait DatabaseExporter: Send + Sync {
    /// Writes a standalone, unencrypted copy of the database to `target`.
    fn export_to_file<'a>(&'a self, target: &'a Path) -> DbFuture<'a, u64>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub users: u64,
    pub conversations: u64,
    pub messages: u64,
    pub calls: u64,
}

pub trait DatabaseImporter: Send + Sync {
    /// Merges a backup database file into the live one. Client-local history is
    /// skipped when the backup was made by another client.
    fn import_from_file<'a>(
        &'a self,
        source: &'a Path,
        is_from_other_client: bool,
    ) -> DbFuture<'a, ImportStats>;
}
