use std::path::{Path, PathBuf};

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Connection, Row, SqlitePool};
use tracing::{debug, error, warn};

use crate::model::{
    Call, Conversation, ConversationKind, Direction, LAST_MODIFIED_CONTENT_TYPES, Message,
    MessageContent, QualifiedId, User,
};
use crate::persistence::{
    DatabaseExporter, DatabaseImporter, DbFuture, ImportStats, UserDatabase,
};
use crate::{Error, Result};

const REQUIRED_BACKUP_TABLES: &[&str] = &["users", "conversations", "messages"];

pub async fn open_user_db(path: &Path) -> Result<SqlitePool> {
    debug!(
        event = "sqlite.open",
        db_path = %path.display(),
        create_if_missing = true,
        "sqlite.open"
    );
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| {
            error!(
                event = "io.sqlite.connect_failed",
                db_path = %path.display(),
                error = %e,
                "io.sqlite.connect_failed"
            );
            e
        })?;

    sqlx::migrate!().run(&pool).await.map_err(|e| {
        error!(
            event = "io.sqlite.migrate_failed",
            db_path = %path.display(),
            error = %e,
            "io.sqlite.migrate_failed"
        );
        e
    })?;
    Ok(pool)
}

/// SQLite-backed user database. One connection, so `ATTACH` stays on the
/// connection that runs the merge.
#[derive(Debug, Clone)]
pub struct SqliteUserDb {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteUserDb {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_user_db(path).await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn qualified(row: &SqliteRow, id_col: &str, domain_col: &str) -> Result<QualifiedId> {
    Ok(QualifiedId::new(
        row.try_get::<String, _>(id_col)?,
        row.try_get::<String, _>(domain_col)?,
    ))
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: qualified(row, "id", "domain")?,
        name: row.try_get("name")?,
        handle: row.try_get("handle")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let kind: String = row.try_get("kind")?;
    Ok(Conversation {
        id: qualified(row, "id", "domain")?,
        name: row.try_get("name")?,
        kind: ConversationKind::parse(&kind),
        last_modified_ms: row.try_get("last_modified_ms")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let direction: String = row.try_get("direction")?;
    let content_json: String = row.try_get("content_json")?;
    let content: MessageContent = serde_json::from_str(&content_json)?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: qualified(row, "conversation_id", "conversation_domain")?,
        sender_user_id: qualified(row, "sender_id", "sender_domain")?,
        sender_client_id: row.try_get("sender_client_id")?,
        creation_ms: row.try_get("creation_ms")?,
        last_edit_ms: row.try_get("last_edit_ms")?,
        direction: Direction::parse(&direction),
        content,
    })
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl SqliteUserDb {
    async fn count(&self, table: &'static str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

impl UserDatabase for SqliteUserDb {
    fn users_page<'a>(&'a self, offset: u64, limit: u32) -> DbFuture<'a, Vec<User>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, domain, name, handle FROM users ORDER BY id, domain LIMIT ? OFFSET ?",
            )
            .bind(i64::from(limit))
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(user_from_row).collect()
        })
    }

    fn conversations_page<'a>(
        &'a self,
        offset: u64,
        limit: u32,
    ) -> DbFuture<'a, Vec<Conversation>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT id, domain, name, kind, last_modified_ms
                FROM conversations
                ORDER BY id, domain
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(i64::from(limit))
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(conversation_from_row).collect()
        })
    }

    fn messages_page<'a>(&'a self, offset: u64, limit: u32) -> DbFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT conversation_id, conversation_domain, id, sender_id, sender_domain,
                       sender_client_id, creation_ms, last_edit_ms, direction, content_json
                FROM messages
                ORDER BY creation_ms, conversation_id, conversation_domain, id
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(i64::from(limit))
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(message_from_row).collect()
        })
    }

    fn count_users<'a>(&'a self) -> DbFuture<'a, u64> {
        Box::pin(self.count("users"))
    }

    fn count_conversations<'a>(&'a self) -> DbFuture<'a, u64> {
        Box::pin(self.count("conversations"))
    }

    fn count_messages<'a>(&'a self) -> DbFuture<'a, u64> {
        Box::pin(self.count("messages"))
    }

    fn insert_users<'a>(&'a self, users: &'a [User]) -> DbFuture<'a, u64> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let mut inserted = 0u64;
            for u in users {
                inserted += sqlx::query(
                    "INSERT OR IGNORE INTO users (id, domain, name, handle) VALUES (?, ?, ?, ?)",
                )
                .bind(&u.id.id)
                .bind(&u.id.domain)
                .bind(&u.name)
                .bind(&u.handle)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
            tx.commit().await?;
            Ok(inserted)
        })
    }

    fn insert_conversations<'a>(&'a self, conversations: &'a [Conversation]) -> DbFuture<'a, u64> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let mut inserted = 0u64;
            for c in conversations {
                inserted += sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO conversations (id, domain, name, kind, last_modified_ms)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&c.id.id)
                .bind(&c.id.domain)
                .bind(&c.name)
                .bind(c.kind.as_str())
                .bind(c.last_modified_ms)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
            tx.commit().await?;
            Ok(inserted)
        })
    }

    fn insert_messages<'a>(&'a self, messages: &'a [Message]) -> DbFuture<'a, u64> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let mut inserted = 0u64;
            for m in messages {
                let content_json = serde_json::to_string(&m.content)?;
                inserted += sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO messages (
                        conversation_id, conversation_domain, id, sender_id, sender_domain,
                        sender_client_id, creation_ms, last_edit_ms, direction, content_type,
                        content_json
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&m.conversation_id.id)
                .bind(&m.conversation_id.domain)
                .bind(&m.id)
                .bind(&m.sender_user_id.id)
                .bind(&m.sender_user_id.domain)
                .bind(&m.sender_client_id)
                .bind(m.creation_ms)
                .bind(m.last_edit_ms)
                .bind(m.direction.as_str())
                .bind(m.content.type_name())
                .bind(content_json)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
            tx.commit().await?;
            Ok(inserted)
        })
    }

    fn message_exists<'a>(
        &'a self,
        conversation_id: &'a QualifiedId,
        message_id: &'a str,
    ) -> DbFuture<'a, bool> {
        Box::pin(async move {
            let found: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT 1 FROM messages
                WHERE conversation_id = ? AND conversation_domain = ? AND id = ?
                "#,
            )
            .bind(&conversation_id.id)
            .bind(&conversation_id.domain)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(found.is_some())
        })
    }

    fn update_conversations_last_modified<'a>(
        &'a self,
        conversation_ids: &'a [QualifiedId],
    ) -> DbFuture<'a, u64> {
        Box::pin(async move {
            let types = LAST_MODIFIED_CONTENT_TYPES
                .iter()
                .map(|t| format!("'{t}'"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                r#"
                UPDATE conversations
                SET last_modified_ms = MAX(last_modified_ms, COALESCE((
                    SELECT MAX(m.creation_ms) FROM messages m
                    WHERE m.conversation_id = conversations.id
                      AND m.conversation_domain = conversations.domain
                      AND m.content_type IN ({types})
                ), 0))
                WHERE id = ? AND domain = ?
                "#
            );

            let mut tx = self.pool.begin().await?;
            let mut updated = 0u64;
            for id in conversation_ids {
                updated += sqlx::query(&sql)
                    .bind(&id.id)
                    .bind(&id.domain)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
            tx.commit().await?;
            Ok(updated)
        })
    }

    fn record_call<'a>(&'a self, call: &'a Call) -> DbFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO calls (
                    conversation_id, conversation_domain, caller_id, caller_domain, status, created_ms
                )
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&call.conversation_id.id)
            .bind(&call.conversation_id.domain)
            .bind(&call.caller_id.id)
            .bind(&call.caller_id.domain)
            .bind(&call.status)
            .bind(call.created_ms)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn count_calls<'a>(&'a self) -> DbFuture<'a, u64> {
        Box::pin(self.count("calls"))
    }
}

impl DatabaseExporter for SqliteUserDb {
    fn export_to_file<'a>(&'a self, target: &'a Path) -> DbFuture<'a, u64> {
        Box::pin(async move {
            let target_str = target.to_str().ok_or_else(|| Error::NonUtf8Path {
                path: target.to_path_buf(),
            })?;
            if tokio::fs::try_exists(target).await? {
                tokio::fs::remove_file(target).await?;
            }

            sqlx::query("VACUUM INTO ?")
                .bind(target_str)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!(
                        event = "io.sqlite.export_failed",
                        db_path = %self.path.display(),
                        target = %target.display(),
                        error = %e,
                        "io.sqlite.export_failed"
                    );
                    e
                })?;

            let bytes = tokio::fs::metadata(target).await?.len();
            debug!(
                event = "sqlite.exported",
                target = %target.display(),
                bytes,
                "sqlite.exported"
            );
            Ok(bytes)
        })
    }
}

impl DatabaseImporter for SqliteUserDb {
    fn import_from_file<'a>(
        &'a self,
        source: &'a Path,
        is_from_other_client: bool,
    ) -> DbFuture<'a, ImportStats> {
        Box::pin(async move {
            let source_str = source.to_str().ok_or_else(|| Error::NonUtf8Path {
                path: source.to_path_buf(),
            })?;

            let mut conn = self.pool.acquire().await?;
            sqlx::query("ATTACH DATABASE ? AS backup")
                .bind(source_str)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    error!(
                        event = "io.sqlite.attach_failed",
                        source = %source.display(),
                        error = %e,
                        "io.sqlite.attach_failed"
                    );
                    e
                })?;

            let merged = merge_attached(&mut conn, is_from_other_client).await;

            if let Err(e) = sqlx::query("DETACH DATABASE backup")
                .execute(&mut *conn)
                .await
            {
                warn!(
                    event = "io.sqlite.detach_failed",
                    error = %e,
                    "io.sqlite.detach_failed"
                );
            }

            let stats = merged?;
            debug!(
                event = "sqlite.imported",
                users = stats.users,
                conversations = stats.conversations,
                messages = stats.messages,
                calls = stats.calls,
                is_from_other_client,
                "sqlite.imported"
            );
            Ok(stats)
        })
    }
}

async fn merge_attached(
    conn: &mut sqlx::SqliteConnection,
    is_from_other_client: bool,
) -> Result<ImportStats> {
    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM backup.sqlite_master WHERE type = 'table'")
            .fetch_all(&mut *conn)
            .await?;
    if let Some(missing) = REQUIRED_BACKUP_TABLES
        .iter()
        .find(|t| !tables.iter().any(|name| name == *t))
    {
        return Err(Error::incompatible(format!(
            "backup database has no {missing} table"
        )));
    }

    let mut tx = conn.begin().await?;
    let mut stats = ImportStats {
        users: sqlx::query(
            r#"
            INSERT OR IGNORE INTO main.users (id, domain, name, handle)
            SELECT id, domain, name, handle FROM backup.users
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected(),
        conversations: sqlx::query(
            r#"
            INSERT OR IGNORE INTO main.conversations (id, domain, name, kind, last_modified_ms)
            SELECT id, domain, name, kind, last_modified_ms FROM backup.conversations
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected(),
        messages: sqlx::query(
            r#"
            INSERT OR IGNORE INTO main.messages (
                conversation_id, conversation_domain, id, sender_id, sender_domain,
                sender_client_id, creation_ms, last_edit_ms, direction, content_type, content_json
            )
            SELECT conversation_id, conversation_domain, id, sender_id, sender_domain,
                   sender_client_id, creation_ms, last_edit_ms, direction, content_type, content_json
            FROM backup.messages
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected(),
        calls: 0,
    };

    if !is_from_other_client && tables.iter().any(|t| t == "calls") {
        stats.calls = sqlx::query(
            r#"
            INSERT OR IGNORE INTO main.calls (
                conversation_id, conversation_domain, caller_id, caller_domain, status, created_ms
            )
            SELECT conversation_id, conversation_domain, caller_id, caller_domain, status, created_ms
            FROM backup.calls
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }

    tx.commit().await?;
    Ok(stats)
}
